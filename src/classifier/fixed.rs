//! Fixed-score classifier backend.
//!
//! Returns the same ranked list for every window. Selected with
//! `models.backend = "fixed"` to run the full streaming pipeline (and the
//! browser client) without downloading a model.

use crate::classifier::{ClassifierError, EmotionClassifier, EmotionScore};

pub struct FixedScoresClassifier {
    scores: Vec<EmotionScore>,
}

impl FixedScoresClassifier {
    pub fn new(scores: Vec<EmotionScore>) -> Self {
        Self { scores }
    }
}

impl Default for FixedScoresClassifier {
    /// Neutral-dominant scores over the seven labels the web client renders.
    fn default() -> Self {
        Self::new(vec![
            EmotionScore::new("neutral", 0.64),
            EmotionScore::new("happy", 0.12),
            EmotionScore::new("sad", 0.08),
            EmotionScore::new("angry", 0.06),
            EmotionScore::new("surprise", 0.05),
            EmotionScore::new("fear", 0.03),
            EmotionScore::new("disgust", 0.02),
        ])
    }
}

impl EmotionClassifier for FixedScoresClassifier {
    fn classify(&self, samples: &[f32], _sample_rate: u32) -> Result<Vec<EmotionScore>, ClassifierError> {
        if samples.is_empty() {
            return Err(ClassifierError::Inference("empty audio window".to_string()));
        }
        Ok(self.scores.clone())
    }

    fn is_loaded(&self) -> bool {
        true
    }
}
