//! Liveness Session Controller
//!
//! Owns the camera and landmark model for one verification attempt and
//! drives the challenge machine from their output.
//!
//! ```text
//! Idle ──start()──▶ Initializing ──ok──▶ Running ──▶ Succeeded | Failed | Cancelled
//!                        │
//!                        └──acquisition error──▶ Error
//! ```
//!
//! Every terminal phase releases the camera before the outcome is emitted.
//! The outcome callback fires at most once per session and stays
//! registered across [`SessionController::restart`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::capability::{AcquisitionError, CapturedImage, FrameSource, LandmarkDetector};
use crate::challenge::ChallengePlan;
use crate::config::LivenessConfig;
use crate::landmarks::FaceLandmarks;
use crate::machine::{ChallengeMachine, FailureReason, Transition};
use crate::{LivenessError, LivenessResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Initializing,
    Running,
    Succeeded,
    Failed(FailureReason),
    Cancelled,
    Error(AcquisitionError),
}

impl SessionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Initializing => "initializing",
            SessionPhase::Running => "running",
            SessionPhase::Succeeded => "succeeded",
            SessionPhase::Failed(_) => "failed",
            SessionPhase::Cancelled => "cancelled",
            SessionPhase::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Succeeded
                | SessionPhase::Failed(_)
                | SessionPhase::Cancelled
                | SessionPhase::Error(_)
        )
    }
}

/// Result handed to the caller when a session ends
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Verified {
        captured_image: Option<CapturedImage>,
    },
    Failed {
        reason: FailureReason,
    },
    Cancelled,
}

impl Outcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, Outcome::Verified { .. })
    }
}

type OutcomeCallback = Box<dyn FnMut(&Outcome) + Send>;

struct CancelShared {
    requested: AtomicBool,
    notify: Notify,
    stopped: watch::Sender<bool>,
}

impl CancelShared {
    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Cancels a running session from another task
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<CancelShared>,
    stopped: watch::Receiver<bool>,
}

impl CancelHandle {
    /// Flag the session for cancellation without waiting
    pub fn request(&self) {
        self.shared.requested.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    /// Cancel and wait until the session loop has stopped and released the camera
    pub async fn cancel(&self) {
        self.request();
        let mut rx = self.stopped.clone();
        // Err means the controller is gone, which also released the camera
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub fn is_requested(&self) -> bool {
        self.shared.is_requested()
    }
}

/// Session controller for one caller context
pub struct SessionController<S: FrameSource, D: LandmarkDetector> {
    source: S,
    detector: D,
    config: LivenessConfig,
    phase: SessionPhase,
    machine: ChallengeMachine,
    last_frame_us: Option<i64>,
    face_visible: bool,
    outcome: Option<Outcome>,
    on_outcome: Option<OutcomeCallback>,
    cancel: Arc<CancelShared>,
    stopped_rx: watch::Receiver<bool>,
}

impl<S: FrameSource, D: LandmarkDetector> SessionController<S, D> {
    /// Controller with a challenge order drawn per `config.timing.shuffle`
    pub fn new(source: S, detector: D, config: LivenessConfig) -> Self {
        let plan = plan_for(&config);
        Self::with_plan(source, detector, config, plan)
    }

    /// Controller with a caller-chosen challenge order
    pub fn with_plan(source: S, detector: D, config: LivenessConfig, plan: ChallengePlan) -> Self {
        let (stopped_tx, stopped_rx) = watch::channel(true);
        let machine = machine_for(&config, plan);

        Self {
            source,
            detector,
            config,
            phase: SessionPhase::Idle,
            machine,
            last_frame_us: None,
            face_visible: false,
            outcome: None,
            on_outcome: None,
            cancel: Arc::new(CancelShared {
                requested: AtomicBool::new(false),
                notify: Notify::new(),
                stopped: stopped_tx,
            }),
            stopped_rx,
        }
    }

    /// Register the callback that receives the session outcome
    pub fn on_outcome<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&Outcome) + Send + 'static,
    {
        self.on_outcome = Some(Box::new(callback));
        self
    }

    pub fn set_outcome_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&Outcome) + Send + 'static,
    {
        self.on_outcome = Some(Box::new(callback));
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.cancel),
            stopped: self.stopped_rx.clone(),
        }
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn machine(&self) -> &ChallengeMachine {
        &self.machine
    }

    pub fn plan(&self) -> &ChallengePlan {
        self.machine.plan()
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Whether the last processed frame contained a face
    pub fn face_visible(&self) -> bool {
        self.face_visible
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    /// Acquire camera and model. Both must succeed before frames are processed.
    ///
    /// A plan with no challenges is refused before anything is acquired.
    pub async fn start(&mut self) -> LivenessResult<()> {
        if self.phase != SessionPhase::Idle {
            return Err(LivenessError::InvalidPhase {
                phase: self.phase.name(),
                expected: "idle",
            });
        }
        if self.machine.plan().is_empty() {
            warn!("refusing to start a session with no challenges");
            return Err(LivenessError::EmptyPlan);
        }

        self.phase = SessionPhase::Initializing;
        self.cancel.stopped.send_replace(false);
        info!("liveness session initializing");

        let cancel = Arc::clone(&self.cancel);
        let acquired = tokio::select! {
            biased;
            _ = wait_cancelled(&cancel) => None,
            r = async { tokio::try_join!(self.source.open(), self.detector.load()) } => Some(r),
        };

        match acquired {
            None => {
                self.finish(Outcome::Cancelled);
                Ok(())
            }
            Some(Err(e)) => {
                warn!(error = %e, "liveness acquisition failed");
                self.source.release();
                self.phase = SessionPhase::Error(e.clone());
                self.cancel.stopped.send_replace(true);
                Err(LivenessError::Acquisition(e))
            }
            Some(Ok(_)) if self.cancel.is_requested() => {
                self.finish(Outcome::Cancelled);
                Ok(())
            }
            Some(Ok(_)) => {
                self.phase = SessionPhase::Running;
                info!(
                    challenges = ?self.machine.plan().kinds(),
                    "liveness session running"
                );
                Ok(())
            }
        }
    }

    /// Apply one frame's detection result.
    ///
    /// Frames whose timestamp does not advance past the last processed
    /// frame are dropped. Results arriving after cancellation are ignored.
    pub fn handle_frame(
        &mut self,
        timestamp_us: i64,
        detection: Option<FaceLandmarks>,
    ) -> Transition {
        if self.cancel.is_requested() {
            self.cancel();
            return Transition::Unchanged;
        }
        if self.phase != SessionPhase::Running {
            return Transition::Unchanged;
        }
        if matches!(self.last_frame_us, Some(last) if timestamp_us <= last) {
            return Transition::Unchanged;
        }
        self.last_frame_us = Some(timestamp_us);
        self.face_visible = detection.is_some();

        let metric = match (self.machine.active_challenge(), detection) {
            (Some(challenge), Some(landmarks)) => match challenge.kind.measure(&landmarks) {
                Ok(m) => Some(m),
                Err(e) => {
                    debug!(error = %e, "skipping frame with unusable landmarks");
                    None
                }
            },
            _ => None,
        };

        let transition = self.machine.observe(metric);
        match &transition {
            Transition::Advanced { completed, next } => {
                info!(%completed, %next, "challenge completed");
            }
            Transition::Succeeded => {
                info!("all challenges completed");
                self.complete_success();
            }
            Transition::Progress { frames, required } => {
                debug!(frames, required, "challenge progress");
            }
            _ => {}
        }
        transition
    }

    /// Advance the countdown by one tick interval
    pub fn handle_tick(&mut self) -> Transition {
        if self.cancel.is_requested() {
            self.cancel();
            return Transition::Unchanged;
        }
        if self.phase != SessionPhase::Running {
            return Transition::Unchanged;
        }

        let transition = self.machine.tick(self.config.timing.tick_interval());
        match &transition {
            Transition::Failed(reason) => {
                warn!(%reason, "liveness verification failed");
                self.finish(Outcome::Failed {
                    reason: reason.clone(),
                });
            }
            Transition::Retried {
                challenge,
                retries_left,
            } => {
                info!(%challenge, retries_left, "challenge timed out, retrying");
            }
            _ => {}
        }
        transition
    }

    /// Stop immediately and release the camera. No-op once terminal.
    pub fn cancel(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        self.cancel.requested.store(true, Ordering::SeqCst);
        info!("liveness session cancelled");
        self.finish(Outcome::Cancelled);
    }

    /// Run the session to completion: acquire (if idle), then process frames
    /// and countdown ticks until a terminal phase is reached.
    ///
    /// When a tick and a frame are ready at the same instant the tick is
    /// applied first, so an expiring timer beats a frame that would have
    /// completed the challenge.
    pub async fn run(&mut self) -> LivenessResult<Outcome> {
        if self.phase == SessionPhase::Idle {
            self.start().await?;
        }

        let period = self.config.timing.tick_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let cancel = Arc::clone(&self.cancel);
        let mut frames_open = true;

        while self.phase == SessionPhase::Running {
            if cancel.is_requested() {
                self.cancel();
                break;
            }

            tokio::select! {
                biased;
                _ = wait_cancelled(&cancel) => {
                    self.cancel();
                }
                _ = ticker.tick() => {
                    self.handle_tick();
                }
                frame = self.source.next_frame(), if frames_open => {
                    let Some(frame) = frame else {
                        debug!("frame stream ended, countdown continues");
                        frames_open = false;
                        continue;
                    };

                    let detected = tokio::select! {
                        biased;
                        _ = wait_cancelled(&cancel) => {
                            self.cancel();
                            continue;
                        }
                        r = self.detector.detect(&frame) => r,
                    };

                    let landmarks = match detected {
                        Ok(landmarks) => landmarks,
                        Err(e) => {
                            warn!(error = %e, "landmark detection failed, treating as no face");
                            None
                        }
                    };
                    self.handle_frame(frame.timestamp_us, landmarks);
                }
            }
        }

        match (&self.phase, &self.outcome) {
            (SessionPhase::Error(e), _) => Err(LivenessError::Acquisition(e.clone())),
            (_, Some(outcome)) => Ok(outcome.clone()),
            (phase, None) => Err(LivenessError::InvalidPhase {
                phase: phase.name(),
                expected: "terminal",
            }),
        }
    }

    /// Discard all session state and return to idle with a fresh challenge
    /// order. Only valid from idle or a terminal phase. The outcome callback
    /// is kept for the next session.
    pub fn restart(&mut self) -> LivenessResult<()> {
        if !(self.phase.is_terminal() || self.phase == SessionPhase::Idle) {
            return Err(LivenessError::InvalidPhase {
                phase: self.phase.name(),
                expected: "terminal",
            });
        }

        self.source.release();
        self.machine = machine_for(&self.config, plan_for(&self.config));
        self.phase = SessionPhase::Idle;
        self.last_frame_us = None;
        self.face_visible = false;
        self.outcome = None;
        self.cancel.requested.store(false, Ordering::SeqCst);
        self.cancel.stopped.send_replace(true);
        info!("liveness session reset");
        Ok(())
    }

    fn complete_success(&mut self) {
        let captured_image = match self.source.capture_still() {
            Ok(image) => Some(image),
            Err(e) => {
                warn!(error = %e, "final capture failed, continuing without image");
                None
            }
        };
        self.finish(Outcome::Verified { captured_image });
    }

    fn finish(&mut self, outcome: Outcome) {
        self.source.release();
        self.phase = match &outcome {
            Outcome::Verified { .. } => SessionPhase::Succeeded,
            Outcome::Failed { reason } => SessionPhase::Failed(reason.clone()),
            Outcome::Cancelled => SessionPhase::Cancelled,
        };
        self.cancel.stopped.send_replace(true);

        if let Some(callback) = self.on_outcome.as_mut() {
            callback(&outcome);
        }
        self.outcome = Some(outcome);
    }
}

impl<S: FrameSource, D: LandmarkDetector> Drop for SessionController<S, D> {
    fn drop(&mut self) {
        self.source.release();
    }
}

/// Resolves once cancellation has been requested. Spurious wakeups from a
/// stale permit are filtered by re-checking the flag.
async fn wait_cancelled(shared: &CancelShared) {
    loop {
        if shared.is_requested() {
            return;
        }
        shared.notify.notified().await;
    }
}

fn plan_for(config: &LivenessConfig) -> ChallengePlan {
    if config.timing.shuffle {
        ChallengePlan::shuffled(&config.thresholds, &mut rand::thread_rng())
    } else {
        ChallengePlan::in_order(&config.thresholds)
    }
}

fn machine_for(config: &LivenessConfig, plan: ChallengePlan) -> ChallengeMachine {
    ChallengeMachine::with_retries(
        plan,
        config.timing.challenge_time_limit(),
        config.timing.challenge_retries,
    )
}
