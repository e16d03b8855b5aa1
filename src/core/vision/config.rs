use super::error::VisionError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lower bound on the time between two matching cycle starts.
pub const MIN_CYCLE_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// A detection matches a label when similarity >= this value.
    pub similarity_threshold: f32,
    pub recurrence_window_ms: u64,
    /// How long the presentation layer keeps a recurrence warning up.
    pub warning_display_ms: u64,
    pub min_cycle_interval_ms: u64,
    /// Side of the square buffer fed to the embedding model.
    pub input_size: u32,
    /// 0 = recompute a failed reference image on every call.
    pub cache_failure_backoff_ms: u64,
    pub match_log_threshold: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.65,
            recurrence_window_ms: 30_000,
            warning_display_ms: 5_000,
            min_cycle_interval_ms: MIN_CYCLE_INTERVAL_MS,
            input_size: 224,
            cache_failure_backoff_ms: 0,
            match_log_threshold: 0.5,
        }
    }
}

impl MatcherConfig {
    pub fn for_low_power() -> Self {
        Self {
            min_cycle_interval_ms: 1_000,
            cache_failure_backoff_ms: 10_000,
            ..Default::default()
        }
    }

    pub fn strict() -> Self {
        Self {
            similarity_threshold: 0.75,
            ..Default::default()
        }
    }

    pub fn from_json5(text: &str) -> Result<Self, VisionError> {
        let config: MatcherConfig =
            json5::from_str(text).map_err(|e| VisionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, VisionError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json5(&text)
    }

    pub fn validate(&self) -> Result<(), VisionError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(VisionError::Config(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.min_cycle_interval_ms < MIN_CYCLE_INTERVAL_MS {
            return Err(VisionError::Config(format!(
                "min_cycle_interval_ms must be >= {}, got {}",
                MIN_CYCLE_INTERVAL_MS, self.min_cycle_interval_ms
            )));
        }
        if self.input_size == 0 {
            return Err(VisionError::Config("input_size must be > 0".to_string()));
        }
        Ok(())
    }
}
