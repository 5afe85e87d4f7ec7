//! # Emotion Classifier Capability
//!
//! Defines the boundary between the streaming pipeline and whatever model
//! actually turns audio into emotion scores. The pipeline only ever sees the
//! [`EmotionClassifier`] trait, so the model backend can be swapped (or
//! replaced with a deterministic stub in tests) without touching the audio code.
//!
//! ## Key Components:
//! - **EmotionClassifier**: The two-operation capability (`classify`, `is_loaded`)
//! - **EmotionScore**: One `(label, score)` pair of a ranked result
//! - **ClassifierError**: Typed failure at the capability boundary
//! - **LazyClassifier**: Loads a backend on first use, exactly once
//!
//! ## Backends:
//! - **wav2vec2**: Wav2Vec2 sequence classification on candle, weights from HuggingFace
//! - **fixed**: Returns a configured score list, useful without a model download

pub mod fixed;       // Fixed-score backend
pub mod lazy;        // Lazy-load-once wrapper
pub mod loader;      // HuggingFace download + model construction
pub mod wav2vec2;    // Candle Wav2Vec2 audio classification model

use crate::config::{ClassifierBackend, ModelsConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use fixed::FixedScoresClassifier;
pub use lazy::LazyClassifier;
pub use loader::Wav2Vec2Loader;

/// A single emotion label with its confidence score.
///
/// ## Wire Format:
/// Serialized as `{"label": "happy", "score": 0.91}`, which is the shape the
/// browser client expects inside `allEmotions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionScore {
    /// Emotion label as reported by the model (e.g. "happy", "neutral")
    pub label: String,

    /// Confidence in [0, 1]
    pub score: f32,
}

impl EmotionScore {
    pub fn new(label: impl Into<String>, score: f32) -> Self {
        Self {
            label: label.into(),
            score,
        }
    }
}

/// Errors a classifier can report.
///
/// A failed *load* means no window classifies until a later load succeeds; the
/// session policy decides whether to keep going. An inference failure only
/// affects the current window.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifierError {
    /// The backend could not be initialized (download, weights, config)
    Load(String),

    /// The backend is loaded but failed on this particular input
    Inference(String),
}

impl fmt::Display for ClassifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifierError::Load(msg) => write!(f, "model load failed: {}", msg),
            ClassifierError::Inference(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ClassifierError {}

/// The classifier capability consumed by the inference gate.
///
/// ## Contract:
/// - `classify` receives normalized samples and their sample rate and returns
///   a ranked list of emotion scores. Ordering is whatever the backend chooses;
///   the gate treats the first entry as the top emotion.
/// - `classify` may fail, but must report failure through `ClassifierError`
///   rather than panicking.
/// - `is_loaded` reports whether the backend is ready without triggering a load.
///
/// ## Thread Safety:
/// `Send + Sync` because one instance is shared by every WebSocket session.
/// Calls may block (model inference), so callers run them off the async executor.
pub trait EmotionClassifier: Send + Sync {
    fn classify(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<EmotionScore>, ClassifierError>;

    fn is_loaded(&self) -> bool;
}

/// Shared handle to the classifier used throughout the application.
pub type SharedClassifier = Arc<dyn EmotionClassifier>;

/// Build the configured backend.
///
/// The wav2vec2 backend is wrapped in a [`LazyClassifier`], so this returns
/// immediately and the download happens on the first classification.
pub fn build_classifier(models: &ModelsConfig) -> SharedClassifier {
    match models.backend {
        ClassifierBackend::Wav2vec2 => Arc::new(LazyClassifier::new(Wav2Vec2Loader::from_config(models))),
        ClassifierBackend::Fixed => Arc::new(FixedScoresClassifier::default()),
    }
}

/// Generate synthetic test audio for classifier self-tests.
///
/// Produces `duration_seconds` of a 220Hz tone with a slow amplitude envelope
/// plus a quieter 3.3kHz component, peaking around 0.05. It is only meant to
/// prove the backend runs end to end, not to carry any emotion.
pub fn synthetic_self_test_audio(sample_rate: u32, duration_seconds: f32) -> Vec<f32> {
    let samples = (sample_rate as f32 * duration_seconds) as usize;
    let rate = sample_rate as f32;

    (0..samples)
        .map(|i| {
            let t = i as f32 / rate;
            let envelope = 0.5 + 0.5 * (2.0 * std::f32::consts::PI * 2.0 * t).sin();
            let tone = (2.0 * std::f32::consts::PI * 220.0 * t).sin();
            let hiss = (2.0 * std::f32::consts::PI * 3300.0 * t).sin() * 0.2;
            0.04 * envelope * tone + 0.01 * hiss
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emotion_score_serialization() {
        let score = EmotionScore::new("happy", 0.5);
        let json = serde_json::to_string(&score).unwrap();
        assert_eq!(json, r#"{"label":"happy","score":0.5}"#);
    }

    #[test]
    fn test_classifier_error_display() {
        let load = ClassifierError::Load("no weights".to_string());
        let inference = ClassifierError::Inference("bad shape".to_string());
        assert_eq!(load.to_string(), "model load failed: no weights");
        assert_eq!(inference.to_string(), "bad shape");
    }

    #[test]
    fn test_wav2vec2_backend_is_not_loaded_eagerly() {
        let models = crate::config::AppConfig::default().models;
        let classifier = build_classifier(&models);
        assert!(!classifier.is_loaded());
    }

    #[test]
    fn test_synthetic_self_test_audio() {
        let audio = synthetic_self_test_audio(16000, 1.0);
        assert_eq!(audio.len(), 16000);

        let peak = audio.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!(peak > 0.01 && peak <= 0.05 + 1e-6, "unexpected peak {}", peak);
    }
}
