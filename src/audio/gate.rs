//! # Inference Gate & Normalizer
//!
//! Decides whether a window is worth classifying, rescales it, calls the
//! classifier and shapes the answer into a [`ProcessingOutcome`].
//!
//! ## Evaluation Steps:
//! 1. **Length**: Fewer than `min_samples` samples -> `InsufficientData`
//! 2. **Level**: Mean absolute amplitude; display level = floor(min(level × 1000, 100))
//! 3. **Silence gate**: level ≤ threshold -> `Silence`, classifier not called
//! 4. **Normalize**: Divide by max(peak, floor) so the peak becomes 1.0
//! 5. **Classify**: Inference failures become `InferenceError`; load failures
//!    are returned as [`CapabilityLoadFailure`] so the caller picks the policy
//! 6. **Package**: First returned entry is the top emotion; the list is kept as returned

use crate::audio::outcome::ProcessingOutcome;
use crate::classifier::{ClassifierError, SharedClassifier};
use crate::config::AudioConfig;
use std::fmt;
use tracing::{debug, warn};

/// Tunables read once per session.
#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub sample_rate: u32,
    pub silence_threshold: f32,
    pub normalization_floor: f32,

    /// Windows shorter than this are not evaluated (at least 1)
    pub min_samples: usize,
}

impl GateConfig {
    pub fn from_audio_config(audio: &AudioConfig) -> Self {
        let min_samples = if audio.require_full_window {
            audio.window_samples()
        } else {
            1
        };

        Self {
            sample_rate: audio.sample_rate,
            silence_threshold: audio.silence_threshold,
            normalization_floor: audio.normalization_floor,
            min_samples: min_samples.max(1),
        }
    }
}

/// The classifier backend could not be initialized.
///
/// Not an outcome: the caller decides whether to keep the session alive.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityLoadFailure {
    pub message: String,

    /// Display level of the window that triggered the load
    pub level: u8,

    pub input_timestamp: Option<i64>,
}

impl fmt::Display for CapabilityLoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "classifier unavailable: {}", self.message)
    }
}

impl std::error::Error for CapabilityLoadFailure {}

/// Mean absolute amplitude.
pub fn signal_level(window: &[f32]) -> f32 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().map(|s| s.abs()).sum::<f32>() / window.len() as f32
}

/// Bounded integer indicator for display; not a calibrated loudness.
pub fn level_indicator(level: f32) -> u8 {
    (level * 1000.0).min(100.0).max(0.0).floor() as u8
}

/// Scale `window` so its peak absolute value is 1.0.
///
/// Peaks below `floor` are divided by `floor` instead, so near-silent windows
/// never divide by zero.
pub fn normalize(window: &[f32], floor: f32) -> Vec<f32> {
    let peak = window.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    let divisor = peak.max(floor);
    window.iter().map(|s| s / divisor).collect()
}

/// Gate + normalizer in front of a shared classifier.
#[derive(Clone)]
pub struct InferenceGate {
    config: GateConfig,
    classifier: SharedClassifier,
}

impl InferenceGate {
    pub fn new(config: GateConfig, classifier: SharedClassifier) -> Self {
        Self { config, classifier }
    }

    /// Evaluate one window snapshot.
    ///
    /// ## Returns:
    /// - **Ok(outcome)**: Any of the four outcome states
    /// - **Err(CapabilityLoadFailure)**: The classifier could not be loaded
    ///
    /// Blocks for the duration of the classifier call; async callers should run
    /// it on a blocking thread.
    pub fn evaluate(
        &self,
        window: &[f32],
        input_timestamp: Option<i64>,
    ) -> Result<ProcessingOutcome, CapabilityLoadFailure> {
        if window.len() < self.config.min_samples {
            return Ok(ProcessingOutcome::InsufficientData {
                buffered: window.len(),
                required: self.config.min_samples,
                input_timestamp,
            });
        }

        let raw_level = signal_level(window);
        let level = level_indicator(raw_level);

        if raw_level <= self.config.silence_threshold {
            debug!(level, "Window below silence threshold");
            return Ok(ProcessingOutcome::Silence { level, input_timestamp });
        }

        let normalized = normalize(window, self.config.normalization_floor);

        match self.classifier.classify(&normalized, self.config.sample_rate) {
            Ok(scores) => match scores.first() {
                Some(top) => Ok(ProcessingOutcome::Ready {
                    level,
                    emotion: top.label.clone(),
                    confidence: top.score,
                    all_emotions: scores.clone(),
                    input_timestamp,
                }),
                None => Ok(ProcessingOutcome::InferenceError {
                    level,
                    reason: "inference_error: classifier returned no scores".to_string(),
                    input_timestamp,
                }),
            },
            Err(ClassifierError::Inference(message)) => {
                warn!(level, error = %message, "Window classification failed");
                Ok(ProcessingOutcome::InferenceError {
                    level,
                    reason: format!("inference_error: {}", message),
                    input_timestamp,
                })
            }
            Err(ClassifierError::Load(message)) => Err(CapabilityLoadFailure {
                message,
                level,
                input_timestamp,
            }),
        }
    }
}
