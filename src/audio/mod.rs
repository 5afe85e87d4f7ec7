//! # Audio Streaming Pipeline
//!
//! Turns an unbounded, irregularly chunked audio stream into fixed-size
//! classifier inputs and typed outcomes.
//!
//! ## Key Components:
//! - **WindowBuffer**: Ring buffer of the most recent window of samples
//! - **InferenceGate**: Silence gate, peak normalization, failure containment
//! - **SessionCoordinator**: Per-connection glue from chunk to outcome
//! - **Codec**: Decoding JSON text frames, binary `f32` frames and WAV uploads
//!
//! ## Data Flow:
//! ```text
//! InputChunk -> SessionCoordinator -> WindowBuffer::snapshot -> InferenceGate::evaluate
//!            -> EmotionClassifier::classify -> ProcessingOutcome -> OutcomeRecord (JSON)
//! ```

pub mod codec;     // Inbound frame and file decoding
pub mod gate;      // Silence gate + normalization + classification
pub mod outcome;   // Outcome enum and wire record
pub mod session;   // Per-connection coordinator and session registry
pub mod window;    // Ring buffer

pub use gate::{GateConfig, InferenceGate};
pub use outcome::{OutcomeRecord, ProcessingOutcome};
pub use session::{EmitPolicy, LoadFailurePolicy, SessionCoordinator, SessionRegistry};

/// A batch of samples delivered by the client.
///
/// The timestamp is opaque producer time in milliseconds; it is only echoed
/// back for lag display and never validated or used for ordering.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputChunk {
    pub samples: Vec<f32>,
    pub timestamp: Option<i64>,
}

impl InputChunk {
    pub fn new(samples: Vec<f32>, timestamp: Option<i64>) -> Self {
        Self { samples, timestamp }
    }
}
