//! Scripted camera feeds for `setu simulate` and `setu vote cast`.
//!
//! ```json
//! {
//!   "frame_interval_ms": 33,
//!   "steps": [
//!     { "face": {}, "repeat": 3 },
//!     { "face": { "ear": 0.15 }, "repeat": 2 },
//!     { "repeat": 10 }
//!   ]
//! }
//! ```
//!
//! A step without `face` yields frames with no face. Face fields left out
//! take neutral values.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use setu_liveness::synthetic::SyntheticFace;
use setu_liveness::ChallengeType;

fn default_interval_ms() -> u64 {
    33
}

fn default_repeat() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub face: Option<SyntheticFace>,
    #[serde(default = "default_repeat")]
    pub repeat: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default = "default_interval_ms")]
    pub frame_interval_ms: u64,
    pub steps: Vec<Step>,
}

impl Script {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Feed that passes any challenge order: each challenge's pose is shown
    /// once per slot, four slots deep.
    pub fn cooperative() -> Self {
        let mut steps = Vec::new();
        for _ in 0..ChallengeType::ALL.len() {
            for kind in ChallengeType::ALL {
                steps.push(Step {
                    face: Some(SyntheticFace::performing(kind)),
                    repeat: 6,
                });
                steps.push(Step {
                    face: Some(SyntheticFace::neutral()),
                    repeat: 1,
                });
            }
        }
        Script {
            frame_interval_ms: default_interval_ms(),
            steps,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }

    /// One entry per frame
    pub fn faces(&self) -> Vec<Option<SyntheticFace>> {
        self.steps
            .iter()
            .flat_map(|s| std::iter::repeat(s.face).take(s.repeat))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_with_defaults() {
        let script: Script = serde_json::from_str(
            r#"{ "steps": [ { "face": { "ear": 0.1 }, "repeat": 2 }, { "repeat": 3 }, { "face": {} } ] }"#,
        )
        .unwrap();

        assert_eq!(script.frame_interval_ms, 33);
        let faces = script.faces();
        assert_eq!(faces.len(), 6);
        assert_eq!(faces[0].unwrap().ear, 0.1);
        assert_eq!(faces[0].unwrap().mar, SyntheticFace::neutral().mar);
        assert!(faces[2..5].iter().all(Option::is_none));
        assert_eq!(faces[5], Some(SyntheticFace::neutral()));
    }

    #[test]
    fn test_from_file() {
        let mut tf = tempfile::NamedTempFile::new().unwrap();
        write!(tf, r#"{{ "frame_interval_ms": 10, "steps": [] }}"#).unwrap();
        let script = Script::from_file(tf.path()).unwrap();
        assert_eq!(script.frame_interval(), Duration::from_millis(10));
        assert!(script.faces().is_empty());
    }

    #[test]
    fn test_cooperative_covers_every_challenge() {
        let faces = Script::cooperative().faces();
        assert_eq!(faces.len(), 4 * 4 * 7);
        for kind in ChallengeType::ALL {
            assert!(faces.contains(&Some(SyntheticFace::performing(kind))));
        }
    }
}
