//! # Configuration Management
//!
//! Loads application settings from layered sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables, nested keys joined by `__`
//!    (e.g. `APP_AUDIO__WINDOW_SECONDS=2`, `APP_MODELS__BACKEND=fixed`)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::audio::{EmitPolicy, LoadFailurePolicy};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
///
/// ## Sections:
/// - **server**: Where to listen
/// - **models**: Which classifier backend to run and where to get its weights
/// - **audio**: Window, silence gate and session policies for the streaming pipeline
/// - **performance**: Limits protecting the server from overload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Which implementation answers `classify` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierBackend {
    /// Wav2Vec2 checkpoint from HuggingFace Hub, run with candle
    Wav2vec2,

    /// Constant scores, no download; for demos and load testing
    Fixed,
}

impl ClassifierBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassifierBackend::Wav2vec2 => "wav2vec2",
            ClassifierBackend::Fixed => "fixed",
        }
    }
}

/// Emotion model settings.
///
/// ## Fields:
/// - `emotion_model`: HuggingFace repository id of an audio-classification checkpoint
/// - `revision`: Branch, tag or commit of that repository
/// - `device`: "auto", "cpu", "cuda" or "metal"
/// - `top_k`: Keep only the k best labels (all labels when unset)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub backend: ClassifierBackend,
    pub emotion_model: String,
    pub revision: String,
    pub device: String,
    pub top_k: Option<usize>,
}

/// Streaming pipeline settings, read when a session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate of incoming audio in Hz
    pub sample_rate: u32,

    /// Window length presented to the classifier
    pub window_seconds: f32,

    /// Mean absolute amplitude at or below which a window counts as silence
    pub silence_threshold: f32,

    /// Smallest peak used as the normalization divisor
    pub normalization_floor: f32,

    /// Only classify once the window is completely filled
    pub require_full_window: bool,

    pub emit_policy: EmitPolicy,
    pub load_failure_policy: LoadFailurePolicy,
}

impl AudioConfig {
    /// Window capacity in samples (sample_rate × window_seconds).
    pub fn window_samples(&self) -> usize {
        (self.sample_rate as f64 * self.window_seconds as f64).round().max(0.0) as usize
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            window_seconds: 3.0,          // 48,000 samples at 16kHz
            silence_threshold: 0.01,
            normalization_floor: 1e-5,
            require_full_window: true,
            emit_policy: EmitPolicy::EveryChunk,
            load_failure_policy: LoadFailurePolicy::Retry,
        }
    }
}

/// Limits.
///
/// `max_chunk_samples` caps a single WebSocket frame; the browser client sends
/// 16,384 samples per frame, so the default leaves plenty of headroom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub max_chunk_samples: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            models: ModelsConfig {
                backend: ClassifierBackend::Wav2vec2,
                emotion_model: "r-f/wav2vec-english-speech-emotion-recognition".to_string(),
                revision: "main".to_string(),
                device: "auto".to_string(),
                top_k: None,
            },
            audio: AudioConfig::default(),
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                max_chunk_samples: 262_144,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Rust Concepts:
    /// - **Builder pattern**: Each `add_source` layers over the previous one
    /// - **?**: Any failing step returns the error to `main`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.models.emotion_model.trim().is_empty() {
            return Err(anyhow::anyhow!("Emotion model id cannot be empty"));
        }

        if self.models.top_k == Some(0) {
            return Err(anyhow::anyhow!("top_k must be at least 1 when set"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if !(self.audio.window_seconds > 0.0) || self.audio.window_samples() == 0 {
            return Err(anyhow::anyhow!("Window must hold at least one sample"));
        }

        if !(self.audio.silence_threshold >= 0.0) {
            return Err(anyhow::anyhow!("Silence threshold cannot be negative"));
        }

        if !(self.audio.normalization_floor > 0.0) {
            return Err(anyhow::anyhow!("Normalization floor must be positive"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.max_chunk_samples == 0 {
            return Err(anyhow::anyhow!("Max chunk samples must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON update, e.g. `{"audio": {"silence_threshold": 0.02}}`.
    ///
    /// ## Partial updates:
    /// Only the provided fields change. Audio settings apply to sessions opened
    /// after the update; model settings only matter before the model has loaded.
    /// Nothing is modified if the result would fail validation.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                updated.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                updated.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Port {} is out of range", port))?;
            }
        }

        if let Some(models) = partial.get("models") {
            if let Some(backend) = models.get("backend") {
                updated.models.backend = serde_json::from_value(backend.clone())?;
            }
            if let Some(model) = models.get("emotion_model").and_then(|v| v.as_str()) {
                updated.models.emotion_model = model.to_string();
            }
            if let Some(revision) = models.get("revision").and_then(|v| v.as_str()) {
                updated.models.revision = revision.to_string();
            }
            if let Some(device) = models.get("device").and_then(|v| v.as_str()) {
                updated.models.device = device.to_string();
            }
            if let Some(top_k) = models.get("top_k") {
                updated.models.top_k = serde_json::from_value(top_k.clone())?;
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(rate) = audio.get("sample_rate").and_then(|v| v.as_u64()) {
                updated.audio.sample_rate = u32::try_from(rate)
                    .map_err(|_| anyhow::anyhow!("Sample rate {} is out of range", rate))?;
            }
            if let Some(seconds) = audio.get("window_seconds").and_then(|v| v.as_f64()) {
                updated.audio.window_seconds = seconds as f32;
            }
            if let Some(threshold) = audio.get("silence_threshold").and_then(|v| v.as_f64()) {
                updated.audio.silence_threshold = threshold as f32;
            }
            if let Some(floor) = audio.get("normalization_floor").and_then(|v| v.as_f64()) {
                updated.audio.normalization_floor = floor as f32;
            }
            if let Some(full) = audio.get("require_full_window").and_then(|v| v.as_bool()) {
                updated.audio.require_full_window = full;
            }
            if let Some(policy) = audio.get("emit_policy") {
                updated.audio.emit_policy = serde_json::from_value(policy.clone())?;
            }
            if let Some(policy) = audio.get("load_failure_policy") {
                updated.audio.load_failure_policy = serde_json::from_value(policy.clone())?;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                updated.performance.max_concurrent_sessions = sessions as usize;
            }
            if let Some(samples) = performance.get("max_chunk_samples").and_then(|v| v.as_u64()) {
                updated.performance.max_chunk_samples = samples as usize;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.audio.window_samples(), 48000);
        assert_eq!(config.audio.silence_threshold, 0.01);
        assert_eq!(config.models.backend, ClassifierBackend::Wav2vec2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.normalization_floor = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.window_seconds = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.silence_threshold = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"silence_threshold": 0.02, "emit_policy": "ready_only"}, "models": {"backend": "fixed", "top_k": 3}}"#;
        assert!(config.update_from_json(json).is_ok());

        assert!((config.audio.silence_threshold - 0.02).abs() < 1e-9);
        assert_eq!(config.audio.emit_policy, EmitPolicy::ReadyOnly);
        assert_eq!(config.models.backend, ClassifierBackend::Fixed);
        assert_eq!(config.models.top_k, Some(3));
        // Untouched fields keep their values
        assert_eq!(config.audio.sample_rate, 16000);
    }

    #[test]
    fn test_invalid_update_leaves_config_unchanged() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"window_seconds": 1.0, "sample_rate": 0}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.audio.window_seconds, 3.0);
        assert_eq!(config.audio.sample_rate, 16000);

        assert!(config.update_from_json(r#"{"audio": {"emit_policy": "sometimes"}}"#).is_err());
        assert_eq!(config.audio.emit_policy, EmitPolicy::EveryChunk);
    }

    #[test]
    fn test_defaults_round_trip_through_config_crate() {
        let built = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .build()
            .unwrap();
        let config: AppConfig = built.try_deserialize().unwrap();
        assert_eq!(config.audio, AudioConfig::default());
        assert_eq!(config.models.top_k, None);
    }
}
