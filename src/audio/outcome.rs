//! Processing outcomes and their wire representation.

use crate::classifier::EmotionScore;
use serde::{Deserialize, Serialize};

/// What evaluating one window produced.
///
/// Every variant carries the echoed client timestamp so the browser can compute
/// end-to-end lag for whichever message it receives.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    /// The window does not hold enough samples yet
    InsufficientData {
        buffered: usize,
        required: usize,
        input_timestamp: Option<i64>,
    },

    /// Mean signal level at or below the silence threshold
    Silence {
        level: u8,
        input_timestamp: Option<i64>,
    },

    /// The classifier failed on this window; the session carries on
    InferenceError {
        level: u8,
        reason: String,
        input_timestamp: Option<i64>,
    },

    Ready {
        level: u8,
        emotion: String,
        confidence: f32,
        all_emotions: Vec<EmotionScore>,
        input_timestamp: Option<i64>,
    },
}

/// Outcome category, used for counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    InsufficientData,
    Silence,
    InferenceError,
    Ready,
}

impl ProcessingOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ProcessingOutcome::InsufficientData { .. } => OutcomeKind::InsufficientData,
            ProcessingOutcome::Silence { .. } => OutcomeKind::Silence,
            ProcessingOutcome::InferenceError { .. } => OutcomeKind::InferenceError,
            ProcessingOutcome::Ready { .. } => OutcomeKind::Ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ProcessingOutcome::Ready { .. })
    }

    /// Display level in [0, 100]. Zero while the window is still filling.
    pub fn level(&self) -> u8 {
        match self {
            ProcessingOutcome::InsufficientData { .. } => 0,
            ProcessingOutcome::Silence { level, .. }
            | ProcessingOutcome::InferenceError { level, .. }
            | ProcessingOutcome::Ready { level, .. } => *level,
        }
    }

    pub fn input_timestamp(&self) -> Option<i64> {
        match self {
            ProcessingOutcome::InsufficientData { input_timestamp, .. }
            | ProcessingOutcome::Silence { input_timestamp, .. }
            | ProcessingOutcome::InferenceError { input_timestamp, .. }
            | ProcessingOutcome::Ready { input_timestamp, .. } => *input_timestamp,
        }
    }

    /// Diagnostic reason for not-ready outcomes.
    pub fn not_ready_reason(&self) -> Option<String> {
        match self {
            ProcessingOutcome::InsufficientData { .. } => Some("insufficient_buffer".to_string()),
            ProcessingOutcome::Silence { .. } => Some("silence".to_string()),
            ProcessingOutcome::InferenceError { reason, .. } => Some(reason.clone()),
            ProcessingOutcome::Ready { .. } => None,
        }
    }

    pub fn to_record(&self) -> OutcomeRecord {
        let (emotion, confidence, all_emotions) = match self {
            ProcessingOutcome::Ready {
                emotion,
                confidence,
                all_emotions,
                ..
            } => (Some(emotion.clone()), Some(*confidence), Some(all_emotions.clone())),
            _ => (None, None, None),
        };

        OutcomeRecord {
            ready: self.is_ready(),
            silence: matches!(self, ProcessingOutcome::Silence { .. }),
            not_ready_reason: self.not_ready_reason(),
            emotion,
            confidence,
            all_emotions,
            level: self.level(),
            input_timestamp: self.input_timestamp(),
        }
    }
}

/// JSON message sent to the client for each emitted outcome.
///
/// ## Wire Format:
/// ```json
/// {"ready":true,"silence":false,"emotion":"happy","confidence":0.9,
///  "allEmotions":[{"label":"happy","score":0.9}],"level":42,"inputTimestamp":1712}
/// ```
/// Optional fields are omitted rather than sent as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRecord {
    pub ready: bool,
    pub silence: bool,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub not_ready_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub emotion: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub confidence: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub all_emotions: Option<Vec<EmotionScore>>,

    pub level: u8,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub input_timestamp: Option<i64>,
}

impl From<&ProcessingOutcome> for OutcomeRecord {
    fn from(outcome: &ProcessingOutcome) -> Self {
        outcome.to_record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ready_record_shape() {
        let outcome = ProcessingOutcome::Ready {
            level: 42,
            emotion: "happy".to_string(),
            confidence: 0.75,
            all_emotions: vec![EmotionScore::new("happy", 0.75), EmotionScore::new("sad", 0.25)],
            input_timestamp: Some(1712),
        };

        let value = serde_json::to_value(outcome.to_record()).unwrap();
        assert_eq!(
            value,
            json!({
                "ready": true,
                "silence": false,
                "emotion": "happy",
                "confidence": 0.75,
                "allEmotions": [{"label": "happy", "score": 0.75}, {"label": "sad", "score": 0.25}],
                "level": 42,
                "inputTimestamp": 1712
            })
        );
    }

    #[test]
    fn test_silence_record_omits_result_fields() {
        let outcome = ProcessingOutcome::Silence { level: 3, input_timestamp: None };
        let value = serde_json::to_value(OutcomeRecord::from(&outcome)).unwrap();
        assert_eq!(
            value,
            json!({"ready": false, "silence": true, "notReadyReason": "silence", "level": 3})
        );
    }

    #[test]
    fn test_not_ready_reasons() {
        let insufficient = ProcessingOutcome::InsufficientData { buffered: 10, required: 48000, input_timestamp: Some(5) };
        assert_eq!(insufficient.not_ready_reason().as_deref(), Some("insufficient_buffer"));
        assert_eq!(insufficient.level(), 0);
        assert_eq!(insufficient.to_record().input_timestamp, Some(5));

        let failed = ProcessingOutcome::InferenceError {
            level: 20,
            reason: "inference_error: bad shape".to_string(),
            input_timestamp: None,
        };
        let record = failed.to_record();
        assert!(!record.ready && !record.silence);
        assert_eq!(record.not_ready_reason.as_deref(), Some("inference_error: bad shape"));
        assert_eq!(failed.kind(), OutcomeKind::InferenceError);
    }
}
