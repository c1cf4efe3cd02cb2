//! Engine Configuration
//!
//! Configuration errors never abort startup: each invalid field is replaced
//! with its default and a warning is logged.

use crate::context::{EngineContext, DEFAULT_BLOCK_SIZE, DEFAULT_SAMPLE_RATE};
use crate::polyphony::MAX_VOICES;
use crate::transport::TimeSignature;
use serde::{Deserialize, Serialize};

/// Startup configuration for an [`Engine`](crate::engine::Engine)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: f64,
    pub block_size: usize,
    /// Initial tempo in BPM
    pub tempo: f64,
    pub time_signature: TimeSignature,
    /// Hardware input channels handed to each callback
    pub input_channels: usize,
    /// Hardware output channels filled by each callback
    pub output_channels: usize,
    /// Default voice limit for polyphonic modules
    pub voice_limit: usize,
    /// Capacity of each module's pending note queue
    pub note_queue_capacity: usize,
    /// Capacity of each module's parameter message ring
    pub param_queue_capacity: usize,
    /// Number of entries retained by the event log
    pub event_log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            tempo: 120.0,
            time_signature: TimeSignature::default(),
            input_channels: 2,
            output_channels: 2,
            voice_limit: MAX_VOICES,
            note_queue_capacity: 50,
            param_queue_capacity: 64,
            event_log_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Return a copy with every invalid field corrected to its default.
    ///
    /// The second element lists a human-readable note per correction.
    pub fn validated(&self) -> (Self, Vec<String>) {
        let defaults = Self::default();
        let mut config = self.clone();
        let mut corrections = Vec::new();

        let mut correct = |what: &str, bad: String, good: String| {
            tracing::warn!("invalid {} {}, using {}", what, bad, good);
            corrections.push(format!("invalid {} {}, using {}", what, bad, good));
        };

        if !(config.sample_rate.is_finite() && config.sample_rate > 0.0) {
            correct(
                "sample rate",
                config.sample_rate.to_string(),
                defaults.sample_rate.to_string(),
            );
            config.sample_rate = defaults.sample_rate;
        }
        if config.block_size == 0 {
            correct("block size", "0".into(), defaults.block_size.to_string());
            config.block_size = defaults.block_size;
        }
        if !(config.tempo.is_finite() && config.tempo > 0.0) {
            correct(
                "tempo",
                config.tempo.to_string(),
                defaults.tempo.to_string(),
            );
            config.tempo = defaults.tempo;
        }
        if !config.time_signature.is_valid() {
            correct(
                "time signature",
                config.time_signature.to_string(),
                defaults.time_signature.to_string(),
            );
            config.time_signature = defaults.time_signature;
        }
        if config.voice_limit == 0 || config.voice_limit > MAX_VOICES {
            let fixed = config.voice_limit.clamp(1, MAX_VOICES);
            correct(
                "voice limit",
                config.voice_limit.to_string(),
                fixed.to_string(),
            );
            config.voice_limit = fixed;
        }
        if config.note_queue_capacity == 0 {
            correct(
                "note queue capacity",
                "0".into(),
                defaults.note_queue_capacity.to_string(),
            );
            config.note_queue_capacity = defaults.note_queue_capacity;
        }
        if config.param_queue_capacity == 0 {
            correct(
                "parameter queue capacity",
                "0".into(),
                defaults.param_queue_capacity.to_string(),
            );
            config.param_queue_capacity = defaults.param_queue_capacity;
        }
        if config.event_log_capacity == 0 {
            correct(
                "event log capacity",
                "0".into(),
                defaults.event_log_capacity.to_string(),
            );
            config.event_log_capacity = defaults.event_log_capacity;
        }

        (config, corrections)
    }

    pub fn context(&self) -> EngineContext {
        EngineContext::new(self.sample_rate, self.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let (config, corrections) = EngineConfig::default().validated();
        assert!(corrections.is_empty());
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_invalid_fields_are_corrected() {
        let config = EngineConfig {
            tempo: -3.0,
            voice_limit: 99,
            block_size: 0,
            ..EngineConfig::default()
        };
        let (fixed, corrections) = config.validated();
        assert_eq!(fixed.tempo, 120.0);
        assert_eq!(fixed.voice_limit, MAX_VOICES);
        assert_eq!(fixed.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(corrections.len(), 3);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(r#"{ "tempo": 90.0, "block_size": 128 }"#).unwrap();
        assert_eq!(config.tempo, 90.0);
        assert_eq!(config.block_size, 128);
        assert_eq!(config.sample_rate, DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = EngineConfig {
            tempo: 97.5,
            ..EngineConfig::default()
        };
        let json = config.to_json().unwrap();
        assert_eq!(EngineConfig::from_json(&json).unwrap(), config);
    }
}
