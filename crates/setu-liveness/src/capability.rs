//! Camera and Landmark Model Interfaces
//!
//! The session controller never touches hardware or inference runtimes
//! directly. Both arrive as injected capabilities so the challenge logic
//! runs unchanged against a webcam, a recorded clip, or a scripted feed.

use async_trait::async_trait;
use bytes::Bytes;

use crate::landmarks::FaceLandmarks;

/// One raster frame from the camera
#[derive(Debug, Clone, Default)]
pub struct Frame {
    /// Presentation time in microseconds
    pub timestamp_us: i64,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn new(timestamp_us: i64, width: u32, height: u32, data: Bytes) -> Self {
        Self {
            timestamp_us,
            width,
            height,
            data,
        }
    }

    /// Frame with no pixel payload, for feeds that only carry timing
    pub fn empty(timestamp_us: i64) -> Self {
        Self {
            timestamp_us,
            ..Default::default()
        }
    }
}

/// Still image captured when verification succeeds
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedImage {
    /// Encoded image bytes (typically JPEG)
    pub data: Bytes,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

/// Camera or model could not be brought up. Terminal for the session,
/// correctable by the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquisitionError {
    #[error("Camera permission was denied.")]
    PermissionDenied,

    #[error("No camera found on your device.")]
    NoDevice,

    #[error("Camera is already in use.")]
    DeviceBusy,

    #[error("Camera does not meet requirements.")]
    Overconstrained,

    #[error("Camera did not start streaming in time.")]
    VideoTimeout,

    #[error("Failed to initialize face detection: {0}")]
    ModelLoad(String),

    #[error("Unable to access camera: {0}")]
    Other(String),
}

impl AcquisitionError {
    /// What the user can do about it
    pub fn remediation(&self) -> &'static str {
        match self {
            AcquisitionError::PermissionDenied => {
                "Allow camera access for this application in your browser or system settings, then try again."
            }
            AcquisitionError::NoDevice => {
                "Please ensure you have a working camera connected and try again."
            }
            AcquisitionError::DeviceBusy => {
                "Please close other applications using the camera and try again."
            }
            AcquisitionError::Overconstrained => "Please try with a different camera.",
            AcquisitionError::VideoTimeout => {
                "Check that the camera is not covered or disabled, then try again."
            }
            AcquisitionError::ModelLoad(_) => "Please refresh and try again.",
            AcquisitionError::Other(_) => {
                "Please check your device and browser settings, then try again."
            }
        }
    }

    /// Full user-facing message
    pub fn user_message(&self) -> String {
        format!("{} {}", self, self.remediation())
    }
}

/// Still capture failed. Never affects the verification result.
#[derive(Debug, Clone, thiserror::Error)]
#[error("capture failed: {0}")]
pub struct CaptureError(pub String);

/// Landmark inference failed for one frame. Treated as "no face".
#[derive(Debug, Clone, thiserror::Error)]
#[error("landmark detection failed: {0}")]
pub struct DetectError(pub String);

/// Live camera stream
#[async_trait]
pub trait FrameSource: Send {
    /// Acquire the device and start streaming
    async fn open(&mut self) -> Result<(), AcquisitionError>;

    /// Wait for the next frame. `None` once the stream has ended.
    ///
    /// Must be cancel safe: the session drops this future whenever a tick
    /// or cancellation wins the race, and no frame may be lost when it does.
    /// A paced source must not restart its wait on the next call.
    async fn next_frame(&mut self) -> Option<Frame>;

    /// Grab a still of the current view
    fn capture_still(&mut self) -> Result<CapturedImage, CaptureError>;

    /// Stop streaming and release the device. Must be idempotent.
    fn release(&mut self);

    fn is_open(&self) -> bool;
}

/// Black-box face landmark model
#[async_trait]
pub trait LandmarkDetector: Send {
    /// Load model weights and runtime
    async fn load(&mut self) -> Result<(), AcquisitionError>;

    /// Landmarks of the most prominent face, or `None` if no face is visible
    async fn detect(&mut self, frame: &Frame) -> Result<Option<FaceLandmarks>, DetectError>;
}
