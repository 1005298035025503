//! Synthetic Camera and Landmark Model
//!
//! Scripted stand-ins for [`FrameSource`] and [`LandmarkDetector`] used by
//! simulations and tests. Faces are generated with exact EAR, MAR and nose
//! offset values so a script reads as a sequence of metric values.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::capability::{
    AcquisitionError, CaptureError, CapturedImage, DetectError, Frame, FrameSource,
    LandmarkDetector,
};
use crate::challenge::ChallengeType;
use crate::landmarks::{indices, FaceLandmarks, Point};

const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 480;

/// Face whose landmarks produce the given metric values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticFace {
    pub ear: f32,
    pub mar: f32,
    pub nose_offset: f32,
}

impl Default for SyntheticFace {
    fn default() -> Self {
        Self::neutral()
    }
}

impl SyntheticFace {
    /// Eyes open, mouth closed, looking straight ahead
    pub fn neutral() -> Self {
        Self {
            ear: 0.32,
            mar: 0.05,
            nose_offset: 0.0,
        }
    }

    /// Neutral face with the metric `kind` is judged on set to `value`
    pub fn with_metric(kind: ChallengeType, value: f32) -> Self {
        let mut face = Self::neutral();
        match kind {
            ChallengeType::Blink => face.ear = value,
            ChallengeType::LookLeft | ChallengeType::LookRight => face.nose_offset = value,
            ChallengeType::MouthOpen => face.mar = value,
        }
        face
    }

    /// Face that satisfies `kind` with the default thresholds
    pub fn performing(kind: ChallengeType) -> Self {
        let value = match kind {
            ChallengeType::Blink => 0.15,
            ChallengeType::LookLeft => 0.08,
            ChallengeType::LookRight => -0.08,
            ChallengeType::MouthOpen => 0.6,
        };
        Self::with_metric(kind, value)
    }

    /// Build a full 478-point mesh
    pub fn landmarks(&self) -> FaceLandmarks {
        let mut points: Vec<Point> = vec![[0.5, 0.5]; indices::MESH_POINTS + 10];

        // eyes 0.10 wide; outer corners at x = 0.30 and 0.70
        place_eye(&mut points, indices::LEFT_EYE, 0.30, 0.40, self.ear);
        place_eye(&mut points, indices::RIGHT_EYE, 0.60, 0.40, self.ear);
        // RIGHT_EYE runs inner -> outer, so p4 (263) lands on the outer corner
        let outer_span = points[indices::RIGHT_EYE_OUTER][0] - points[indices::LEFT_EYE_OUTER][0];
        let eye_center =
            (points[indices::RIGHT_EYE_OUTER][0] + points[indices::LEFT_EYE_OUTER][0]) / 2.0;
        points[indices::NOSE_TIP] = [eye_center + self.nose_offset * outer_span, 0.55];

        // mouth 0.20 wide
        let width = 0.20;
        points[indices::MOUTH_LEFT] = [0.40, 0.70];
        points[indices::MOUTH_RIGHT] = [0.40 + width, 0.70];
        points[indices::UPPER_LIP_INNER] = [0.50, 0.70 - self.mar * width / 2.0];
        points[indices::LOWER_LIP_INNER] = [0.50, 0.70 + self.mar * width / 2.0];

        FaceLandmarks::new(points)
    }
}

/// Lay out p1..p6 so that EAR == `ear`: corners `x0` and `x0 + 0.1` on `y`,
/// lids at thirds of the width.
fn place_eye(points: &mut [Point], idx: [usize; 6], x0: f32, y: f32, ear: f32) {
    let w = 0.10;
    let half = ear * w / 2.0;
    let [p1, p2, p3, p4, p5, p6] = idx;
    points[p1] = [x0, y];
    points[p2] = [x0 + w / 3.0, y - half];
    points[p3] = [x0 + 2.0 * w / 3.0, y - half];
    points[p4] = [x0 + w, y];
    points[p5] = [x0 + 2.0 * w / 3.0, y + half];
    points[p6] = [x0 + w / 3.0, y + half];
}

/// Shared view of a scripted camera's device state
#[derive(Debug, Clone, Default)]
pub struct CameraProbe {
    open: Arc<AtomicBool>,
    opens: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    frames_served: Arc<AtomicUsize>,
}

impl CameraProbe {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn frames_served(&self) -> usize {
        self.frames_served.load(Ordering::SeqCst)
    }
}

/// Camera that replays a fixed list of frames
pub struct ScriptedFrameSource {
    frames: VecDeque<Frame>,
    frame_interval: Option<Duration>,
    next_due: Option<Instant>,
    open_error: Option<AcquisitionError>,
    fail_capture: bool,
    probe: CameraProbe,
}

impl ScriptedFrameSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
            frame_interval: None,
            next_due: None,
            open_error: None,
            fail_capture: false,
            probe: CameraProbe::default(),
        }
    }

    /// `count` empty frames spaced `interval` apart
    pub fn timed(count: usize, interval: Duration) -> Self {
        let step = interval.as_micros() as i64;
        let frames = (0..count)
            .map(|i| Frame::empty((i as i64 + 1) * step))
            .collect();
        Self::new(frames).with_frame_interval(interval)
    }

    /// Deliver frames on a fixed `interval` schedule starting from `open()`.
    /// The schedule survives a dropped `next_frame` call.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Fail `open()` with `error`
    pub fn failing_open(mut self, error: AcquisitionError) -> Self {
        self.open_error = Some(error);
        self
    }

    /// Fail every still capture
    pub fn failing_capture(mut self) -> Self {
        self.fail_capture = true;
        self
    }

    pub fn probe(&self) -> CameraProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl FrameSource for ScriptedFrameSource {
    async fn open(&mut self) -> Result<(), AcquisitionError> {
        if let Some(e) = &self.open_error {
            return Err(e.clone());
        }
        self.next_due = self.frame_interval.map(|interval| Instant::now() + interval);
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        self.probe.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Frame> {
        if !self.is_open() {
            return None;
        }
        if let Some(interval) = self.frame_interval {
            let due = *self
                .next_due
                .get_or_insert_with(|| Instant::now() + interval);
            tokio::time::sleep_until(due).await;
            self.next_due = Some(due + interval);
        }
        let frame = self.frames.pop_front()?;
        self.probe.frames_served.fetch_add(1, Ordering::SeqCst);
        Some(frame)
    }

    fn capture_still(&mut self) -> Result<CapturedImage, CaptureError> {
        if self.fail_capture {
            return Err(CaptureError("synthetic capture disabled".to_string()));
        }
        if !self.is_open() {
            return Err(CaptureError("camera is not open".to_string()));
        }
        Ok(CapturedImage {
            data: Bytes::from_static(b"\xff\xd8\xff\xe0synthetic\xff\xd9"),
            mime_type: "image/jpeg".to_string(),
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
        })
    }

    fn release(&mut self) {
        self.next_due = None;
        if self.probe.open.swap(false, Ordering::SeqCst) {
            self.probe.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_open(&self) -> bool {
        self.probe.is_open()
    }
}

/// Landmark model that answers frames in order from a script.
/// Once the script runs out every frame reports no face.
pub struct ScriptedDetector {
    script: VecDeque<Option<FaceLandmarks>>,
    load_error: Option<AcquisitionError>,
    load_delay: Option<Duration>,
    latency: Option<Duration>,
    failing_calls: HashSet<usize>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Option<FaceLandmarks>>) -> Self {
        Self {
            script: script.into(),
            load_error: None,
            load_delay: None,
            latency: None,
            failing_calls: HashSet::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Script built from synthetic faces (`None` = no face)
    pub fn from_faces<I>(faces: I) -> Self
    where
        I: IntoIterator<Item = Option<SyntheticFace>>,
    {
        Self::new(
            faces
                .into_iter()
                .map(|f| f.map(|face| face.landmarks()))
                .collect(),
        )
    }

    pub fn failing_load(mut self, reason: impl Into<String>) -> Self {
        self.load_error = Some(AcquisitionError::ModelLoad(reason.into()));
        self
    }

    /// Take `delay` to load the model
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Fail the `detect` calls at these zero-based positions. The scripted
    /// face for a failed call is consumed.
    pub fn failing_detect<I>(mut self, calls: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        self.failing_calls.extend(calls);
        self
    }

    /// Delay every inference by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Counter of `detect` calls, shared with the caller
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl LandmarkDetector for ScriptedDetector {
    async fn load(&mut self) -> Result<(), AcquisitionError> {
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        match &self.load_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn detect(&mut self, _frame: &Frame) -> Result<Option<FaceLandmarks>, DetectError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let face = self.script.pop_front().flatten();
        if self.failing_calls.contains(&call) {
            return Err(DetectError(format!("synthetic inference failure on call {}", call)));
        }
        Ok(face)
    }
}

/// Camera and model pair replaying `faces` one per frame, `interval` apart
pub fn scripted_pair(
    faces: Vec<Option<SyntheticFace>>,
    interval: Duration,
) -> (ScriptedFrameSource, ScriptedDetector) {
    let source = ScriptedFrameSource::timed(faces.len(), interval);
    let detector = ScriptedDetector::from_faces(faces);
    (source, detector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;

    #[test]
    fn test_neutral_face_meets_no_challenge() {
        let face = SyntheticFace::neutral().landmarks();
        assert!(metrics::average_eye_aspect_ratio(&face).unwrap() > 0.25);
        assert!(metrics::mouth_aspect_ratio(&face).unwrap() < 0.45);
        assert!(metrics::nose_offset(&face).unwrap().abs() < 0.03);
    }

    #[test]
    fn test_performing_face_matches_metric() {
        let face = SyntheticFace::performing(ChallengeType::LookLeft).landmarks();
        let offset = ChallengeType::LookLeft.measure(&face).unwrap();
        assert!((offset - 0.08).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_scripted_source_lifecycle() {
        let mut source = ScriptedFrameSource::new(vec![Frame::empty(1), Frame::empty(2)]);
        let probe = source.probe();
        assert!(source.next_frame().await.is_none());

        source.open().await.unwrap();
        assert_eq!(source.next_frame().await.unwrap().timestamp_us, 1);
        source.release();
        source.release();
        assert!(!probe.is_open());
        assert_eq!(probe.releases(), 1);
        assert!(source.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_detector_exhaustion_reports_no_face() {
        let mut det = ScriptedDetector::from_faces(vec![Some(SyntheticFace::neutral())]);
        let frame = Frame::empty(0);
        assert!(det.detect(&frame).await.unwrap().is_some());
        assert!(det.detect(&frame).await.unwrap().is_none());
        assert_eq!(det.call_counter().load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_next_frame_keeps_schedule() {
        let mut source = ScriptedFrameSource::timed(3, Duration::from_millis(120));
        source.open().await.unwrap();
        let opened = Instant::now();

        // abandon the wait twice before the first frame is due
        for _ in 0..2 {
            let waited =
                tokio::time::timeout(Duration::from_millis(50), source.next_frame()).await;
            assert!(waited.is_err());
        }

        assert!(source.next_frame().await.is_some());
        assert_eq!(opened.elapsed(), Duration::from_millis(120));
        assert!(source.next_frame().await.is_some());
        assert_eq!(opened.elapsed(), Duration::from_millis(240));
    }

    #[tokio::test]
    async fn test_failing_detect_consumes_script() {
        let mut det = ScriptedDetector::from_faces(vec![Some(SyntheticFace::neutral()); 3])
            .failing_detect([1]);
        let frame = Frame::empty(0);
        assert!(det.detect(&frame).await.unwrap().is_some());
        assert!(det.detect(&frame).await.is_err());
        assert!(det.detect(&frame).await.unwrap().is_some());
        assert!(det.detect(&frame).await.unwrap().is_none());
    }
}
