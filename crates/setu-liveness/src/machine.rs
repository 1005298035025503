//! Challenge State Machine
//!
//! Walks a [`ChallengePlan`] one challenge at a time. Each frame's metric
//! either extends, holds, or resets a consecutive-frame counter for the
//! active challenge; a countdown ticked independently fails the session
//! when the active challenge runs out of time.
//!
//! The machine is purely synchronous and owns no clock. Callers feed it
//! frame metrics through [`ChallengeMachine::observe`] and elapsed time
//! through [`ChallengeMachine::tick`], in whatever order events arrive.

use std::fmt;
use std::time::Duration;

use crate::challenge::{Challenge, ChallengePlan, ChallengeType};

/// Why a session failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    TimeExpired { challenge: ChallengeType },
}

impl FailureReason {
    pub fn challenge(&self) -> ChallengeType {
        match self {
            FailureReason::TimeExpired { challenge } => *challenge,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::TimeExpired { challenge } => {
                write!(f, "time expired for {}", challenge)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    Awaiting { index: usize },
    Succeeded,
    Failed(FailureReason),
}

/// What a single observation or tick did to the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Nothing changed (terminal machine, held in hysteresis band, or plain tick)
    Unchanged,
    /// Active challenge gained a frame
    Progress { frames: u32, required: u32 },
    /// Accumulated frames were discarded
    Reset,
    /// Active challenge completed, next one is now active
    Advanced {
        completed: ChallengeType,
        next: ChallengeType,
    },
    /// Last challenge completed
    Succeeded,
    /// Timer expired but a retry was granted
    Retried {
        challenge: ChallengeType,
        retries_left: u32,
    },
    /// Timer expired with no retries left
    Failed(FailureReason),
}

/// Challenge state machine for one session
#[derive(Debug, Clone)]
pub struct ChallengeMachine {
    plan: ChallengePlan,
    state: MachineState,
    consecutive_frames: u32,
    time_limit: Duration,
    remaining: Duration,
    retries: u32,
    retries_left: u32,
}

impl ChallengeMachine {
    pub fn new(plan: ChallengePlan, time_limit: Duration) -> Self {
        Self::with_retries(plan, time_limit, 0)
    }

    /// Machine that restarts a timed-out challenge up to `retries` times
    /// before failing the session
    pub fn with_retries(plan: ChallengePlan, time_limit: Duration, retries: u32) -> Self {
        let state = if plan.is_empty() {
            MachineState::Succeeded
        } else {
            MachineState::Awaiting { index: 0 }
        };

        Self {
            plan,
            state,
            consecutive_frames: 0,
            time_limit,
            remaining: time_limit,
            retries,
            retries_left: retries,
        }
    }

    pub fn plan(&self) -> &ChallengePlan {
        &self.plan
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, MachineState::Awaiting { .. })
    }

    /// Index of the active challenge, if any
    pub fn active_index(&self) -> Option<usize> {
        match self.state {
            MachineState::Awaiting { index } => Some(index),
            _ => None,
        }
    }

    pub fn active_challenge(&self) -> Option<&Challenge> {
        self.active_index().and_then(|i| self.plan.get(i))
    }

    pub fn consecutive_frames(&self) -> u32 {
        self.consecutive_frames
    }

    /// Time left for the active challenge
    pub fn time_remaining(&self) -> Duration {
        self.remaining
    }

    /// Fraction of required frames accumulated for the active challenge
    pub fn progress(&self) -> f32 {
        match self.active_challenge() {
            Some(c) => (self.consecutive_frames as f32 / c.required_frames.max(1) as f32).min(1.0),
            None => 0.0,
        }
    }

    /// Feed one frame. `None` means no face was found (or its metric could
    /// not be computed) and counts as a miss without failing the session.
    pub fn observe(&mut self, metric: Option<f32>) -> Transition {
        let Some(challenge) = self.active_challenge().cloned() else {
            return Transition::Unchanged;
        };
        let required = challenge.required_frames;

        match metric.filter(|m| m.is_finite()) {
            Some(m) if challenge.is_met(m) => {
                self.consecutive_frames += 1;
                if self.consecutive_frames >= required {
                    self.advance()
                } else {
                    Transition::Progress {
                        frames: self.consecutive_frames,
                        required,
                    }
                }
            }
            Some(m) if !challenge.should_reset(m) => Transition::Unchanged,
            _ => self.reset_counter(),
        }
    }

    /// Advance the countdown by `elapsed`
    pub fn tick(&mut self, elapsed: Duration) -> Transition {
        let Some(kind) = self.active_challenge().map(|c| c.kind) else {
            return Transition::Unchanged;
        };

        self.remaining = self.remaining.saturating_sub(elapsed);
        if !self.remaining.is_zero() {
            return Transition::Unchanged;
        }

        if self.retries_left > 0 {
            self.retries_left -= 1;
            self.remaining = self.time_limit;
            self.consecutive_frames = 0;
            return Transition::Retried {
                challenge: kind,
                retries_left: self.retries_left,
            };
        }

        let reason = FailureReason::TimeExpired { challenge: kind };
        self.state = MachineState::Failed(reason.clone());
        self.consecutive_frames = 0;
        Transition::Failed(reason)
    }

    fn reset_counter(&mut self) -> Transition {
        if self.consecutive_frames == 0 {
            return Transition::Unchanged;
        }
        self.consecutive_frames = 0;
        Transition::Reset
    }

    fn advance(&mut self) -> Transition {
        let Some(index) = self.active_index() else {
            return Transition::Unchanged;
        };
        let completed = self.plan.get(index).map(|c| c.kind);

        self.consecutive_frames = 0;
        self.remaining = self.time_limit;
        self.retries_left = self.retries;

        match (completed, self.plan.get(index + 1)) {
            (Some(completed), Some(next)) => {
                self.state = MachineState::Awaiting { index: index + 1 };
                Transition::Advanced {
                    completed,
                    next: next.kind,
                }
            }
            _ => {
                self.state = MachineState::Succeeded;
                Transition::Succeeded
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThresholdConfig;
    use proptest::prelude::*;

    const TICK: Duration = Duration::from_millis(100);
    const LIMIT: Duration = Duration::from_secs(15);

    fn machine_for(kinds: &[ChallengeType]) -> ChallengeMachine {
        ChallengeMachine::new(
            ChallengePlan::from_types(kinds, &ThresholdConfig::default()),
            LIMIT,
        )
    }

    #[test]
    fn test_blink_example_advances_on_third_frame() {
        let mut m = machine_for(&[ChallengeType::Blink, ChallengeType::MouthOpen]);

        assert_eq!(m.observe(Some(0.30)), Transition::Unchanged);
        assert_eq!(
            m.observe(Some(0.20)),
            Transition::Progress {
                frames: 1,
                required: 2
            }
        );
        assert_eq!(
            m.observe(Some(0.18)),
            Transition::Advanced {
                completed: ChallengeType::Blink,
                next: ChallengeType::MouthOpen
            }
        );
        assert_eq!(m.active_index(), Some(1));
        assert_eq!(m.consecutive_frames(), 0);
    }

    #[test]
    fn test_blink_hysteresis_keeps_progress() {
        let mut m = machine_for(&[ChallengeType::Blink]);
        m.observe(Some(0.20));
        // 0.30 misses the threshold but sits inside the reset margin
        assert_eq!(m.observe(Some(0.30)), Transition::Unchanged);
        assert_eq!(m.consecutive_frames(), 1);
        assert_eq!(m.observe(Some(0.20)), Transition::Succeeded);
    }

    #[test]
    fn test_blink_wide_open_resets() {
        let mut m = machine_for(&[ChallengeType::Blink]);
        m.observe(Some(0.20));
        assert_eq!(m.observe(Some(0.40)), Transition::Reset);
        assert_eq!(m.consecutive_frames(), 0);
    }

    #[test]
    fn test_look_left_example_requires_unbroken_run() {
        let mut m = machine_for(&[ChallengeType::LookLeft, ChallengeType::Blink]);

        for _ in 0..5 {
            m.observe(Some(0.05));
        }
        assert_eq!(m.active_index(), Some(0));
        assert_eq!(m.observe(Some(0.01)), Transition::Reset);

        for _ in 0..5 {
            assert!(matches!(m.observe(Some(0.05)), Transition::Progress { .. }));
        }
        assert_eq!(m.active_index(), Some(0));
        assert!(matches!(
            m.observe(Some(0.05)),
            Transition::Advanced {
                completed: ChallengeType::LookLeft,
                ..
            }
        ));
    }

    #[test]
    fn test_look_right_needs_negative_offset() {
        let mut m = machine_for(&[ChallengeType::LookRight]);
        for _ in 0..10 {
            m.observe(Some(0.05));
        }
        assert_eq!(m.consecutive_frames(), 0);
        for _ in 0..6 {
            m.observe(Some(-0.04));
        }
        assert_eq!(m.state(), &MachineState::Succeeded);
    }

    #[test]
    fn test_no_face_resets_but_never_fails() {
        let mut m = machine_for(&[ChallengeType::MouthOpen]);
        m.observe(Some(0.6));
        m.observe(Some(0.6));
        assert_eq!(m.observe(None), Transition::Reset);
        for _ in 0..1000 {
            m.observe(None);
        }
        assert_eq!(m.active_index(), Some(0));
    }

    #[test]
    fn test_non_finite_metric_counts_as_miss() {
        let mut m = machine_for(&[ChallengeType::MouthOpen]);
        m.observe(Some(0.6));
        assert_eq!(m.observe(Some(f32::NAN)), Transition::Reset);
    }

    #[test]
    fn test_timeout_after_150_ticks() {
        let mut m = machine_for(&[ChallengeType::Blink, ChallengeType::LookLeft]);
        for _ in 0..149 {
            assert_eq!(m.tick(TICK), Transition::Unchanged);
        }
        let t = m.tick(TICK);
        assert_eq!(
            t,
            Transition::Failed(FailureReason::TimeExpired {
                challenge: ChallengeType::Blink
            })
        );
        assert_eq!(
            m.state(),
            &MachineState::Failed(FailureReason::TimeExpired {
                challenge: ChallengeType::Blink
            })
        );
    }

    #[test]
    fn test_failure_reason_names_challenge() {
        let reason = FailureReason::TimeExpired {
            challenge: ChallengeType::LookRight,
        };
        assert_eq!(reason.to_string(), "time expired for look right");
    }

    #[test]
    fn test_advance_restarts_timer() {
        let mut m = machine_for(&[ChallengeType::Blink, ChallengeType::LookLeft]);
        for _ in 0..140 {
            m.tick(TICK);
        }
        m.observe(Some(0.1));
        m.observe(Some(0.1));
        assert_eq!(m.time_remaining(), LIMIT);
        for _ in 0..140 {
            m.tick(TICK);
        }
        assert!(!m.is_terminal());
    }

    #[test]
    fn test_terminal_ignores_input() {
        let mut m = machine_for(&[ChallengeType::Blink]);
        m.observe(Some(0.1));
        m.observe(Some(0.1));
        assert_eq!(m.state(), &MachineState::Succeeded);
        assert_eq!(m.tick(LIMIT), Transition::Unchanged);
        assert_eq!(m.observe(Some(0.1)), Transition::Unchanged);
        assert_eq!(m.state(), &MachineState::Succeeded);
    }

    #[test]
    fn test_retry_budget() {
        let plan = ChallengePlan::from_types(&[ChallengeType::Blink], &ThresholdConfig::default());
        let mut m = ChallengeMachine::with_retries(plan, LIMIT, 1);
        m.observe(Some(0.1));
        assert_eq!(
            m.tick(LIMIT),
            Transition::Retried {
                challenge: ChallengeType::Blink,
                retries_left: 0
            }
        );
        assert_eq!(m.consecutive_frames(), 0);
        assert!(matches!(m.tick(LIMIT), Transition::Failed(_)));
    }

    #[test]
    fn test_progress_fraction() {
        let mut m = machine_for(&[ChallengeType::MouthOpen]);
        m.observe(Some(0.5));
        m.observe(Some(0.5));
        m.observe(Some(0.5));
        assert!((m.progress() - 0.5).abs() < 1e-6);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_observations_alone_never_fail(
            metrics in proptest::collection::vec(proptest::option::of(-1.0f32..1.0f32), 0..400)
        ) {
            let mut m = machine_for(&ChallengeType::ALL);
            for metric in metrics {
                m.observe(metric);
                prop_assert!(!matches!(m.state(), MachineState::Failed(_)));
                if let Some(c) = m.active_challenge() {
                    prop_assert!(m.consecutive_frames() < c.required_frames);
                }
            }
        }

        #[test]
        fn prop_oscillation_below_required_times_out(kind_idx in 0usize..4) {
            let kind = ChallengeType::ALL[kind_idx];
            let mut m = machine_for(&[kind]);
            let challenge = m.active_challenge().cloned().unwrap();
            let hit = match challenge.direction {
                crate::challenge::Direction::Below => challenge.threshold - 0.05,
                crate::challenge::Direction::Above => challenge.threshold + 0.05,
            };
            let miss = match challenge.direction {
                crate::challenge::Direction::Below => challenge.threshold + challenge.reset_margin + 0.05,
                crate::challenge::Direction::Above => challenge.threshold - challenge.reset_margin - 0.05,
            };

            let mut last = Transition::Unchanged;
            for _ in 0..150 {
                for _ in 0..challenge.required_frames - 1 {
                    m.observe(Some(hit));
                }
                m.observe(Some(miss));
                last = m.tick(TICK);
            }
            prop_assert_eq!(
                last,
                Transition::Failed(FailureReason::TimeExpired { challenge: kind })
            );
        }
    }
}
