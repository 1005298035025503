//! Face Mesh Landmarks
//!
//! A single detected face in the MediaPipe face-mesh convention
//! (468 points, 478 with irises), in normalized image coordinates.

use crate::{LivenessError, LivenessResult};

/// 2D landmark in normalized image coordinates
pub type Point = [f32; 2];

/// MediaPipe Face Mesh indices read by the liveness metrics
pub mod indices {
    /// Left eye contour in EAR order p1..p6 (outer corner, upper lid x2, inner corner, lower lid x2)
    pub const LEFT_EYE: [usize; 6] = [33, 160, 158, 133, 153, 144];
    /// Right eye contour in EAR order p1..p6
    pub const RIGHT_EYE: [usize; 6] = [362, 385, 387, 263, 373, 380];

    /// Left eye outer corner
    pub const LEFT_EYE_OUTER: usize = 33;
    /// Right eye outer corner
    pub const RIGHT_EYE_OUTER: usize = 263;
    /// Nose tip
    pub const NOSE_TIP: usize = 1;

    /// Inner upper lip center
    pub const UPPER_LIP_INNER: usize = 13;
    /// Inner lower lip center
    pub const LOWER_LIP_INNER: usize = 14;
    /// Left mouth corner (inner contour)
    pub const MOUTH_LEFT: usize = 78;
    /// Right mouth corner (inner contour)
    pub const MOUTH_RIGHT: usize = 308;

    /// Points in a full face mesh without iris refinement
    pub const MESH_POINTS: usize = 468;
}

/// Landmarks of one detected face
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceLandmarks {
    pub points: Vec<Point>,
}

impl FaceLandmarks {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Get landmark point by index
    pub fn point(&self, idx: usize) -> LivenessResult<Point> {
        self.points.get(idx).copied().ok_or_else(|| {
            LivenessError::InvalidLandmarks(format!(
                "landmark {} requested but only {} present",
                idx,
                self.points.len()
            ))
        })
    }

    /// Collect the points at `idx` in order
    pub fn select<const N: usize>(&self, idx: [usize; N]) -> LivenessResult<[Point; N]> {
        let mut out = [[0.0f32; 2]; N];
        for (slot, i) in out.iter_mut().zip(idx) {
            *slot = self.point(i)?;
        }
        Ok(out)
    }
}

impl From<Vec<Point>> for FaceLandmarks {
    fn from(points: Vec<Point>) -> Self {
        Self::new(points)
    }
}

/// Euclidean distance between two points
pub fn distance(a: Point, b: Point) -> f32 {
    let dx = b[0] - a[0];
    let dy = b[1] - a[1];
    (dx * dx + dy * dy).sqrt()
}
