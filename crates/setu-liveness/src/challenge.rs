//! Challenge Definitions
//!
//! The four liveness challenges, their thresholds, and the ordered plan a
//! session walks through.

use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt;
use std::sync::Arc;

use crate::config::ThresholdConfig;
use crate::landmarks::FaceLandmarks;
use crate::metrics;
use crate::LivenessResult;

/// Challenge types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeType {
    Blink,
    LookLeft,
    LookRight,
    MouthOpen,
}

impl ChallengeType {
    pub const ALL: [ChallengeType; 4] = [
        ChallengeType::Blink,
        ChallengeType::LookLeft,
        ChallengeType::LookRight,
        ChallengeType::MouthOpen,
    ];

    pub fn instruction(&self) -> &'static str {
        match self {
            ChallengeType::Blink => "Blink your eyes naturally",
            ChallengeType::LookLeft => "Look to your left",
            ChallengeType::LookRight => "Look to your right",
            ChallengeType::MouthOpen => "Open your mouth wide",
        }
    }

    /// Compute the scalar this challenge is judged on
    pub fn measure(&self, landmarks: &FaceLandmarks) -> LivenessResult<f32> {
        match self {
            ChallengeType::Blink => metrics::average_eye_aspect_ratio(landmarks),
            ChallengeType::LookLeft | ChallengeType::LookRight => metrics::nose_offset(landmarks),
            ChallengeType::MouthOpen => metrics::mouth_aspect_ratio(landmarks),
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChallengeType::Blink => "blink",
            ChallengeType::LookLeft => "look left",
            ChallengeType::LookRight => "look right",
            ChallengeType::MouthOpen => "mouth open",
        };
        f.write_str(name)
    }
}

/// Which side of the threshold satisfies a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Below,
    Above,
}

/// One challenge with its detection parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    pub kind: ChallengeType,
    pub instruction: &'static str,
    pub threshold: f32,
    pub direction: Direction,
    pub required_frames: u32,
    /// How far past the threshold a miss must land before progress resets
    pub reset_margin: f32,
}

impl Challenge {
    pub fn from_config(kind: ChallengeType, cfg: &ThresholdConfig) -> Self {
        let (threshold, direction, required_frames, reset_margin) = match kind {
            ChallengeType::Blink => (
                cfg.ear_threshold,
                Direction::Below,
                cfg.blink_frames,
                cfg.blink_reset_margin,
            ),
            ChallengeType::LookLeft => {
                (cfg.look_threshold, Direction::Above, cfg.look_hold_frames, 0.0)
            }
            ChallengeType::LookRight => {
                (-cfg.look_threshold, Direction::Below, cfg.look_hold_frames, 0.0)
            }
            ChallengeType::MouthOpen => (
                cfg.mouth_threshold,
                Direction::Above,
                cfg.mouth_hold_frames,
                0.0,
            ),
        };

        Self {
            kind,
            instruction: kind.instruction(),
            threshold,
            direction,
            required_frames,
            reset_margin,
        }
    }

    /// Metric lies strictly on the satisfying side of the threshold
    pub fn is_met(&self, metric: f32) -> bool {
        match self.direction {
            Direction::Below => metric < self.threshold,
            Direction::Above => metric > self.threshold,
        }
    }

    /// A miss far enough from the threshold to discard accumulated frames
    pub fn should_reset(&self, metric: f32) -> bool {
        if self.is_met(metric) {
            return false;
        }
        if self.reset_margin <= 0.0 {
            return true;
        }
        match self.direction {
            Direction::Below => metric > self.threshold + self.reset_margin,
            Direction::Above => metric < self.threshold - self.reset_margin,
        }
    }
}

/// Ordered challenges for one session. Fixed at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengePlan {
    challenges: Arc<[Challenge]>,
}

impl ChallengePlan {
    /// All four challenges in random order
    pub fn shuffled<R: Rng + ?Sized>(cfg: &ThresholdConfig, rng: &mut R) -> Self {
        let mut kinds = ChallengeType::ALL;
        kinds.shuffle(rng);
        Self::from_types(&kinds, cfg)
    }

    /// All four challenges in declaration order
    pub fn in_order(cfg: &ThresholdConfig) -> Self {
        Self::from_types(&ChallengeType::ALL, cfg)
    }

    pub fn from_types(kinds: &[ChallengeType], cfg: &ThresholdConfig) -> Self {
        Self {
            challenges: kinds
                .iter()
                .map(|&k| Challenge::from_config(k, cfg))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Challenge> {
        self.challenges.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Challenge> {
        self.challenges.iter()
    }

    pub fn kinds(&self) -> Vec<ChallengeType> {
        self.challenges.iter().map(|c| c.kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_thresholds() {
        let cfg = ThresholdConfig::default();
        let blink = Challenge::from_config(ChallengeType::Blink, &cfg);
        assert_eq!(blink.required_frames, 2);
        assert!(blink.is_met(0.2));
        assert!(!blink.is_met(0.25));

        let right = Challenge::from_config(ChallengeType::LookRight, &cfg);
        assert!((right.threshold + 0.03).abs() < 1e-6);
        assert!(right.is_met(-0.05));
        assert!(!right.is_met(0.05));

        let mouth = Challenge::from_config(ChallengeType::MouthOpen, &cfg);
        assert_eq!(mouth.required_frames, 6);
        assert!(mouth.is_met(0.5));
    }

    #[test]
    fn test_blink_hysteresis_band() {
        let blink = Challenge::from_config(ChallengeType::Blink, &ThresholdConfig::default());
        // inside the 0.25..=0.35 band: neither met nor reset
        assert!(!blink.is_met(0.30));
        assert!(!blink.should_reset(0.30));
        assert!(blink.should_reset(0.36));
    }

    #[test]
    fn test_non_blink_resets_on_any_miss() {
        let left = Challenge::from_config(ChallengeType::LookLeft, &ThresholdConfig::default());
        assert!(left.should_reset(0.01));
        assert!(left.should_reset(0.03));
        assert!(!left.should_reset(0.05));
    }

    #[test]
    fn test_shuffled_plan_is_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        let plan = ChallengePlan::shuffled(&ThresholdConfig::default(), &mut rng);
        let mut kinds = plan.kinds();
        kinds.sort_by_key(|k| ChallengeType::ALL.iter().position(|a| a == k));
        assert_eq!(kinds, ChallengeType::ALL.to_vec());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ChallengeType::LookLeft.to_string(), "look left");
        assert_eq!(ChallengeType::MouthOpen.to_string(), "mouth open");
    }
}
