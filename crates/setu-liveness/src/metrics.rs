//! Facial Metrics
//!
//! Scalar signals derived from a single frame's landmarks:
//! - Eye Aspect Ratio (EAR) for blink detection
//! - Mouth Aspect Ratio (MAR) for mouth opening
//! - Nose offset for horizontal head turn
//!
//! All functions are pure. Callers detect "no face" upstream and skip
//! metric computation for that frame.

use crate::landmarks::{distance, indices, FaceLandmarks, Point};
use crate::{LivenessError, LivenessResult};

/// Distances at or below this are treated as degenerate geometry
const MIN_SPAN: f32 = 1e-6;

/// Eye Aspect Ratio of one eye.
///
/// `points` must hold the six contour points p1..p6:
/// `(|p2-p6| + |p3-p5|) / (2 * |p1-p4|)`. Roughly 0.3 for an open eye,
/// near 0 when closed.
pub fn eye_aspect_ratio(points: &[Point]) -> LivenessResult<f32> {
    let [p1, p2, p3, p4, p5, p6]: [Point; 6] = points.try_into().map_err(|_| {
        LivenessError::InvalidLandmarks(format!("EAR needs 6 eye points, got {}", points.len()))
    })?;

    let a = distance(p2, p6);
    let b = distance(p3, p5);
    let c = distance(p1, p4);

    if c <= MIN_SPAN {
        return Err(LivenessError::InvalidLandmarks(
            "eye corners coincide".to_string(),
        ));
    }

    Ok((a + b) / (2.0 * c))
}

/// Mean EAR of both eyes
pub fn average_eye_aspect_ratio(landmarks: &FaceLandmarks) -> LivenessResult<f32> {
    let left = eye_aspect_ratio(&landmarks.select(indices::LEFT_EYE)?)?;
    let right = eye_aspect_ratio(&landmarks.select(indices::RIGHT_EYE)?)?;
    Ok((left + right) / 2.0)
}

/// Mouth Aspect Ratio: vertical inner-lip separation over mouth width
pub fn mouth_aspect_ratio(landmarks: &FaceLandmarks) -> LivenessResult<f32> {
    let upper = landmarks.point(indices::UPPER_LIP_INNER)?;
    let lower = landmarks.point(indices::LOWER_LIP_INNER)?;
    let left = landmarks.point(indices::MOUTH_LEFT)?;
    let right = landmarks.point(indices::MOUTH_RIGHT)?;

    let vertical = (upper[1] - lower[1]).abs();
    let horizontal = (left[0] - right[0]).abs();

    if horizontal <= MIN_SPAN {
        return Err(LivenessError::InvalidLandmarks(
            "mouth corners coincide".to_string(),
        ));
    }

    Ok(vertical / horizontal)
}

/// Signed horizontal nose displacement from the eye midpoint, normalized
/// by the distance between the outer eye corners.
///
/// In the mirrored selfie view a positive value means the subject looks
/// to their left, a negative value to their right.
pub fn nose_offset(landmarks: &FaceLandmarks) -> LivenessResult<f32> {
    let nose = landmarks.point(indices::NOSE_TIP)?;
    let left_eye = landmarks.point(indices::LEFT_EYE_OUTER)?;
    let right_eye = landmarks.point(indices::RIGHT_EYE_OUTER)?;

    let span = right_eye[0] - left_eye[0];
    if span.abs() <= MIN_SPAN {
        return Err(LivenessError::InvalidLandmarks(
            "eye corners share an x coordinate".to_string(),
        ));
    }

    let eye_center = (left_eye[0] + right_eye[0]) / 2.0;
    Ok((nose[0] - eye_center) / span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticFace;

    #[test]
    fn test_ear_open_eye() {
        // width 0.3, each lid pair 0.09 apart -> (0.09 + 0.09) / 0.6
        let eye = [
            [0.0, 0.0],
            [0.1, -0.045],
            [0.2, -0.045],
            [0.3, 0.0],
            [0.2, 0.045],
            [0.1, 0.045],
        ];
        let ear = eye_aspect_ratio(&eye).unwrap();
        assert!((ear - 0.3).abs() < 1e-5);
    }

    #[test]
    fn test_ear_requires_six_points() {
        let eye = [[0.0, 0.0]; 5];
        assert!(matches!(
            eye_aspect_ratio(&eye),
            Err(LivenessError::InvalidLandmarks(_))
        ));
    }

    #[test]
    fn test_ear_degenerate_width() {
        let eye = [[0.5, 0.5]; 6];
        assert!(eye_aspect_ratio(&eye).is_err());
    }

    #[test]
    fn test_synthetic_face_metrics() {
        let face = SyntheticFace {
            ear: 0.18,
            mar: 0.6,
            nose_offset: -0.05,
        }
        .landmarks();

        assert!((average_eye_aspect_ratio(&face).unwrap() - 0.18).abs() < 1e-4);
        assert!((mouth_aspect_ratio(&face).unwrap() - 0.6).abs() < 1e-4);
        assert!((nose_offset(&face).unwrap() + 0.05).abs() < 1e-4);
    }

    #[test]
    fn test_truncated_mesh_rejected() {
        let face = FaceLandmarks::new(vec![[0.5, 0.5]; 100]);
        assert!(average_eye_aspect_ratio(&face).is_err());
        assert!(mouth_aspect_ratio(&face).is_err());
        assert!(nose_offset(&face).is_err());
    }
}
