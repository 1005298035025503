//! Challenge-Response Liveness Verification
//!
//! Sequences randomized facial challenges (blink, look left, look right,
//! open mouth) against a live camera feed and reports whether the person in
//! front of the camera completed all of them in time.
//!
//! # Modules
//! - `landmarks`: face mesh points and the indices the metrics read
//! - `metrics`: eye/mouth aspect ratios and nose offset
//! - `challenge`: challenge definitions and the per-session shuffled plan
//! - `machine`: per-frame challenge state machine with countdown
//! - `capability`: camera and landmark-model interfaces
//! - `session`: session controller owning camera/model lifecycles
//! - `synthetic`: scripted camera/model doubles for simulations and tests
//! - `config`: thresholds and timing, loadable from TOML and environment

pub mod capability;
pub mod challenge;
pub mod config;
pub mod landmarks;
pub mod machine;
pub mod metrics;
pub mod session;
pub mod synthetic;

pub use capability::{
    AcquisitionError, CaptureError, CapturedImage, DetectError, Frame, FrameSource,
    LandmarkDetector,
};
pub use challenge::{Challenge, ChallengePlan, ChallengeType, Direction};
pub use config::{ConfigError, LivenessConfig, ThresholdConfig, TimingConfig};
pub use landmarks::{FaceLandmarks, Point};
pub use machine::{ChallengeMachine, FailureReason, MachineState, Transition};
pub use session::{CancelHandle, Outcome, SessionController, SessionPhase};

/// Result type for liveness operations
pub type LivenessResult<T> = Result<T, LivenessError>;

/// Errors raised by metric computation and session control
#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    #[error("invalid landmarks: {0}")]
    InvalidLandmarks(String),

    #[error("session is {phase}, expected {expected}")]
    InvalidPhase {
        phase: &'static str,
        expected: &'static str,
    },

    #[error("challenge plan is empty")]
    EmptyPlan,

    #[error("acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}
