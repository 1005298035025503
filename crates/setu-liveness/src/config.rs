use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LivenessConfig {
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Detection thresholds per challenge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Average EAR below which the eyes count as closed
    pub ear_threshold: f32,
    /// Consecutive closed-eye frames that make a blink
    pub blink_frames: u32,
    /// Blink progress only resets once EAR exceeds `ear_threshold + blink_reset_margin`
    pub blink_reset_margin: f32,
    /// Absolute nose offset that counts as looking left/right
    pub look_threshold: f32,
    /// Frames a head turn must be held
    pub look_hold_frames: u32,
    /// MAR above which the mouth counts as open
    pub mouth_threshold: f32,
    /// Frames the mouth must stay open
    pub mouth_hold_frames: u32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            ear_threshold: 0.25,
            blink_frames: 2,
            blink_reset_margin: 0.1,
            look_threshold: 0.03,
            look_hold_frames: 6,
            mouth_threshold: 0.45,
            mouth_hold_frames: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Time allowed for each challenge
    pub challenge_time_limit_ms: u64,
    /// Countdown tick period
    pub tick_interval_ms: u64,
    /// Extra attempts granted to a challenge after its timer expires.
    /// 0 means any timeout fails the whole session.
    pub challenge_retries: u32,
    /// Shuffle the challenge order for each session
    pub shuffle: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            challenge_time_limit_ms: 15_000,
            tick_interval_ms: 100,
            challenge_retries: 0,
            shuffle: true,
        }
    }
}

impl TimingConfig {
    pub fn challenge_time_limit(&self) -> Duration {
        Duration::from_millis(self.challenge_time_limit_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl LivenessConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: LivenessConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    /// Environment variables are prefixed with SETU_, e.g. SETU_EAR_THRESHOLD=0.22
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. User config file (if exists)
    /// 3. Built-in defaults (lowest priority)
    pub fn load_layered(user_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = LivenessConfig::default();

        if let Some(path) = user_path {
            if path.exists() {
                config = Self::from_file(path)?;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        override_from_env("SETU_EAR_THRESHOLD", &mut self.thresholds.ear_threshold)?;
        override_from_env("SETU_BLINK_FRAMES", &mut self.thresholds.blink_frames)?;
        override_from_env(
            "SETU_BLINK_RESET_MARGIN",
            &mut self.thresholds.blink_reset_margin,
        )?;
        override_from_env("SETU_LOOK_THRESHOLD", &mut self.thresholds.look_threshold)?;
        override_from_env("SETU_LOOK_HOLD_FRAMES", &mut self.thresholds.look_hold_frames)?;
        override_from_env("SETU_MOUTH_THRESHOLD", &mut self.thresholds.mouth_threshold)?;
        override_from_env(
            "SETU_MOUTH_HOLD_FRAMES",
            &mut self.thresholds.mouth_hold_frames,
        )?;

        override_from_env(
            "SETU_CHALLENGE_TIME_LIMIT_MS",
            &mut self.timing.challenge_time_limit_ms,
        )?;
        override_from_env("SETU_TICK_INTERVAL_MS", &mut self.timing.tick_interval_ms)?;
        override_from_env("SETU_CHALLENGE_RETRIES", &mut self.timing.challenge_retries)?;
        override_from_env("SETU_SHUFFLE", &mut self.timing.shuffle)?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        if !(t.ear_threshold > 0.0 && t.ear_threshold < 1.0) {
            return Err(ConfigError::Validation(
                "thresholds.ear_threshold must be in (0, 1)".to_string(),
            ));
        }
        if !(t.blink_reset_margin >= 0.0) {
            return Err(ConfigError::Validation(
                "thresholds.blink_reset_margin must be non-negative".to_string(),
            ));
        }
        if !(t.look_threshold > 0.0) {
            return Err(ConfigError::Validation(
                "thresholds.look_threshold must be positive".to_string(),
            ));
        }
        if !(t.mouth_threshold > 0.0) {
            return Err(ConfigError::Validation(
                "thresholds.mouth_threshold must be positive".to_string(),
            ));
        }
        if t.blink_frames == 0 || t.look_hold_frames == 0 || t.mouth_hold_frames == 0 {
            return Err(ConfigError::Validation(
                "required frame counts must be at least 1".to_string(),
            ));
        }

        let tm = &self.timing;
        if tm.tick_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "timing.tick_interval_ms must be positive".to_string(),
            ));
        }
        if tm.challenge_time_limit_ms < tm.tick_interval_ms {
            return Err(ConfigError::Validation(
                "timing.challenge_time_limit_ms must cover at least one tick".to_string(),
            ));
        }

        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = self
            .to_toml_string()
            .map_err(|e| ConfigError::Validation(format!("TOML serialization error: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }
}

fn override_from_env<T: std::str::FromStr>(name: &str, slot: &mut T) -> Result<(), ConfigError> {
    if let Ok(val) = env::var(name) {
        *slot = val
            .parse()
            .map_err(|_| ConfigError::Validation(format!("Invalid {}", name)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_valid() {
        let config = LivenessConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.challenge_time_limit(), Duration::from_secs(15));
        assert_eq!(config.timing.tick_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_validation_rejects_bad_thresholds() {
        let mut config = LivenessConfig::default();
        config.thresholds.ear_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = LivenessConfig::default();
        config.thresholds.look_hold_frames = 0;
        assert!(config.validate().is_err());

        let mut config = LivenessConfig::default();
        config.timing.challenge_time_limit_ms = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_nan_thresholds() {
        let mut config = LivenessConfig::default();
        config.thresholds.look_threshold = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = LivenessConfig::default();
        config.thresholds.mouth_threshold = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = LivenessConfig::default();
        config.thresholds.blink_reset_margin = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let mut config = LivenessConfig::default();
        config.timing.challenge_retries = 2;
        config.thresholds.mouth_threshold = 0.5;

        let tf = NamedTempFile::new().unwrap();
        config.save_to_file(tf.path()).unwrap();
        let loaded = LivenessConfig::from_file(tf.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: LivenessConfig = toml::from_str("[timing]\nshuffle = false\n").unwrap();
        assert!(!config.timing.shuffle);
        assert_eq!(config.timing.challenge_time_limit_ms, 15_000);
        assert_eq!(config.thresholds, ThresholdConfig::default());
    }

    #[test]
    fn test_load_layered_missing_file_falls_back() {
        let config =
            LivenessConfig::load_layered(Some(Path::new("/nonexistent/setu.toml"))).unwrap();
        assert!(config.validate().is_ok());
    }
}
