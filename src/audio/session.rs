//! # Session Coordination
//!
//! One [`SessionCoordinator`] per WebSocket connection wires chunk arrival to
//! outcome emission:
//!
//! ```text
//! chunk -> WindowBuffer::add_chunk -> latest timestamp -> InferenceGate::evaluate
//!       -> emit policy -> Option<ProcessingOutcome>
//! ```
//!
//! The [`SessionRegistry`] tracks every live connection, enforces the
//! concurrent session cap and keeps per-session counters for `/api/v1/metrics`.
//!
//! ## Policies:
//! - **EmitPolicy**: emit every outcome, or only ready ones
//! - **LoadFailurePolicy**: report a classifier load failure as a per-window
//!   error and keep going, or end the session

use crate::audio::gate::{CapabilityLoadFailure, GateConfig, InferenceGate};
use crate::audio::outcome::{OutcomeKind, ProcessingOutcome};
use crate::audio::window::WindowBuffer;
use crate::audio::InputChunk;
use crate::classifier::SharedClassifier;
use crate::config::AudioConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Which outcomes are forwarded to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitPolicy {
    /// One message per chunk, ready or not
    #[default]
    EveryChunk,

    /// Only ready outcomes; everything else is dropped silently
    ReadyOnly,
}

/// What to do when the classifier backend cannot be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadFailurePolicy {
    /// Report `model_unavailable: ...` for the window, try again on the next one
    #[default]
    Retry,

    /// Return the failure to the caller, which closes the connection
    EndSession,
}

/// Counters for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub started_at: DateTime<Utc>,
    pub chunks_received: u64,
    pub samples_received: u64,
    pub outcomes_emitted: u64,
    pub ready: u64,
    pub silence: u64,
    pub insufficient_data: u64,
    pub inference_errors: u64,
    pub load_failures: u64,

    /// Time spent in windows that reached the classifier
    pub inference_time_ms: u64,
    pub last_input_timestamp: Option<i64>,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            chunks_received: 0,
            samples_received: 0,
            outcomes_emitted: 0,
            ready: 0,
            silence: 0,
            insufficient_data: 0,
            inference_errors: 0,
            load_failures: 0,
            inference_time_ms: 0,
            last_input_timestamp: None,
        }
    }
}

impl SessionStats {
    fn record(&mut self, kind: OutcomeKind) {
        match kind {
            OutcomeKind::Ready => self.ready += 1,
            OutcomeKind::Silence => self.silence += 1,
            OutcomeKind::InsufficientData => self.insufficient_data += 1,
            OutcomeKind::InferenceError => self.inference_errors += 1,
        }
    }

    pub fn average_inference_ms(&self) -> f64 {
        let classified = self.ready + self.inference_errors;
        if classified > 0 {
            self.inference_time_ms as f64 / classified as f64
        } else {
            0.0
        }
    }
}

/// Per-connection pipeline state.
///
/// Owns its window buffer exclusively. The classifier inside the gate is the
/// only thing shared with other sessions.
pub struct SessionCoordinator {
    session_id: String,
    window: WindowBuffer,
    latest_timestamp: Option<i64>,
    gate: InferenceGate,
    emit_policy: EmitPolicy,
    load_failure_policy: LoadFailurePolicy,
    stats: SessionStats,
}

impl SessionCoordinator {
    pub fn new(session_id: impl Into<String>, audio: &AudioConfig, classifier: SharedClassifier) -> Self {
        Self {
            session_id: session_id.into(),
            window: WindowBuffer::new(audio.sample_rate, audio.window_seconds),
            latest_timestamp: None,
            gate: InferenceGate::new(GateConfig::from_audio_config(audio), classifier),
            emit_policy: audio.emit_policy,
            load_failure_policy: audio.load_failure_policy,
            stats: SessionStats::default(),
        }
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Process one inbound chunk.
    ///
    /// ## Returns:
    /// - **Ok(Some(outcome))**: Send this to the client
    /// - **Ok(None)**: Suppressed by the emit policy
    /// - **Err(failure)**: Classifier failed to load under `EndSession`
    ///
    /// Inference failures never end up in `Err`; the next chunk simply tries again.
    pub fn handle_chunk(&mut self, chunk: InputChunk) -> Result<Option<ProcessingOutcome>, CapabilityLoadFailure> {
        self.stats.chunks_received += 1;
        self.stats.samples_received += chunk.samples.len() as u64;

        self.window.add_chunk(&chunk.samples);
        if chunk.timestamp.is_some() {
            self.latest_timestamp = chunk.timestamp;
            self.stats.last_input_timestamp = chunk.timestamp;
        }

        let snapshot = self.window.snapshot();
        let start_time = Instant::now();
        let evaluated = self.gate.evaluate(&snapshot, self.latest_timestamp);
        let elapsed_ms = start_time.elapsed().as_millis() as u64;

        let outcome = match evaluated {
            Ok(outcome) => outcome,
            Err(failure) => {
                self.stats.load_failures += 1;
                match self.load_failure_policy {
                    LoadFailurePolicy::EndSession => {
                        warn!(session_id = %self.session_id, error = %failure, "Ending session after classifier load failure");
                        return Err(failure);
                    }
                    LoadFailurePolicy::Retry => ProcessingOutcome::InferenceError {
                        level: failure.level,
                        reason: format!("model_unavailable: {}", failure.message),
                        input_timestamp: failure.input_timestamp,
                    },
                }
            }
        };

        let kind = outcome.kind();
        self.stats.record(kind);
        if matches!(kind, OutcomeKind::Ready | OutcomeKind::InferenceError) {
            self.stats.inference_time_ms += elapsed_ms;
        }

        debug!(
            session_id = %self.session_id,
            buffered_ms = self.window.duration().as_millis() as u64,
            window_full = self.window.is_full(),
            outcome = ?kind,
            level = outcome.level(),
            duration_ms = elapsed_ms,
            "Chunk processed"
        );

        let emit = match self.emit_policy {
            EmitPolicy::EveryChunk => true,
            EmitPolicy::ReadyOnly => outcome.is_ready(),
        };

        if emit {
            self.stats.outcomes_emitted += 1;
            Ok(Some(outcome))
        } else {
            Ok(None)
        }
    }
}

/// The registry is full.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionLimitReached {
    pub max_sessions: usize,
}

impl std::fmt::Display for SessionLimitReached {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum concurrent sessions ({}) reached", self.max_sessions)
    }
}

/// Registry snapshot for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub active_sessions: usize,
    pub total_chunks: u64,
    pub total_samples: u64,
    pub total_ready: u64,
    pub sessions: HashMap<String, SessionStats>,
}

/// Tracks the live streaming sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionStats>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot and return a fresh session id.
    pub fn register(&self, max_sessions: usize) -> Result<String, SessionLimitReached> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if sessions.len() >= max_sessions {
            return Err(SessionLimitReached { max_sessions });
        }

        let session_id = Uuid::new_v4().to_string();
        sessions.insert(session_id.clone(), SessionStats::default());
        Ok(session_id)
    }

    /// Replace the stored counters for a live session.
    pub fn update(&self, session_id: &str, stats: &SessionStats) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = sessions.get_mut(session_id) {
            *entry = stats.clone();
        }
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionStats> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn summary(&self) -> RegistrySummary {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        RegistrySummary {
            active_sessions: sessions.len(),
            total_chunks: sessions.values().map(|s| s.chunks_received).sum(),
            total_samples: sessions.values().map(|s| s.samples_received).sum(),
            total_ready: sessions.values().map(|s| s.ready).sum(),
            sessions: sessions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierError, EmotionClassifier, EmotionScore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubClassifier {
        calls: AtomicUsize,
        fail_with: Option<ClassifierError>,
    }

    impl StubClassifier {
        fn ok() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail_with: None })
        }

        fn failing(error: ClassifierError) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail_with: Some(error) })
        }
    }

    impl EmotionClassifier for StubClassifier {
        fn classify(&self, _samples: &[f32], _sample_rate: u32) -> Result<Vec<EmotionScore>, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(error) => Err(error.clone()),
                None => Ok(vec![EmotionScore::new("happy", 0.9), EmotionScore::new("sad", 0.1)]),
            }
        }

        fn is_loaded(&self) -> bool {
            self.fail_with.is_none()
        }
    }

    /// 1 second window at 16kHz.
    fn audio_config() -> AudioConfig {
        AudioConfig {
            window_seconds: 1.0,
            ..AudioConfig::default()
        }
    }

    fn chunk(value: f32, len: usize, timestamp: Option<i64>) -> InputChunk {
        InputChunk::new(vec![value; len], timestamp)
    }

    #[test]
    fn test_every_chunk_policy_emits_all_outcomes() {
        let mut session = SessionCoordinator::new("s1", &audio_config(), StubClassifier::ok());

        let first = session.handle_chunk(chunk(0.5, 8000, Some(10))).unwrap().unwrap();
        assert_eq!(first.not_ready_reason().as_deref(), Some("insufficient_buffer"));

        let second = session.handle_chunk(chunk(0.5, 8000, Some(20))).unwrap().unwrap();
        assert!(second.is_ready());
        assert_eq!(second.input_timestamp(), Some(20));
        assert_eq!(second.level(), 100);

        let stats = session.stats();
        assert_eq!(stats.chunks_received, 2);
        assert_eq!(stats.samples_received, 16000);
        assert_eq!(stats.outcomes_emitted, 2);
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.insufficient_data, 1);
    }

    #[test]
    fn test_ready_only_policy_suppresses_not_ready() {
        let audio = AudioConfig {
            emit_policy: EmitPolicy::ReadyOnly,
            ..audio_config()
        };
        let mut session = SessionCoordinator::new("s2", &audio, StubClassifier::ok());

        assert!(session.handle_chunk(chunk(0.5, 8000, None)).unwrap().is_none());
        assert!(session.handle_chunk(chunk(0.0, 16000, None)).unwrap().is_none());
        assert!(session.handle_chunk(chunk(0.4, 16000, None)).unwrap().is_some());
        assert_eq!(session.stats().outcomes_emitted, 1);
        assert_eq!(session.stats().silence, 1);
    }

    #[test]
    fn test_silence_scenario_level_zero() {
        let mut session = SessionCoordinator::new("s3", &audio_config(), StubClassifier::ok());
        let outcome = session.handle_chunk(chunk(0.0, 16000, None)).unwrap().unwrap();
        assert_eq!(outcome, ProcessingOutcome::Silence { level: 0, input_timestamp: None });
    }

    #[test]
    fn test_latest_timestamp_survives_chunks_without_one() {
        let mut session = SessionCoordinator::new("s4", &audio_config(), StubClassifier::ok());
        session.handle_chunk(chunk(0.5, 16000, Some(1234))).unwrap();

        let outcome = session.handle_chunk(chunk(0.5, 100, None)).unwrap().unwrap();
        assert_eq!(outcome.input_timestamp(), Some(1234));
        assert_eq!(session.stats().last_input_timestamp, Some(1234));

        // Not validated: an older timestamp simply replaces the newer one
        let outcome = session.handle_chunk(chunk(0.5, 100, Some(5))).unwrap().unwrap();
        assert_eq!(outcome.input_timestamp(), Some(5));
        assert_eq!(session.stats().last_input_timestamp, Some(5));
    }

    #[test]
    fn test_inference_errors_do_not_end_session() {
        let stub = StubClassifier::failing(ClassifierError::Inference("boom".to_string()));
        let mut session = SessionCoordinator::new("s5", &audio_config(), stub.clone());

        for _ in 0..3 {
            let outcome = session.handle_chunk(chunk(0.3, 16000, None)).unwrap().unwrap();
            assert_eq!(outcome.not_ready_reason().as_deref(), Some("inference_error: boom"));
        }
        assert_eq!(stub.calls.load(Ordering::SeqCst), 3);
        assert_eq!(session.stats().inference_errors, 3);
    }

    #[test]
    fn test_load_failure_retry_policy() {
        let stub = StubClassifier::failing(ClassifierError::Load("download failed".to_string()));
        let mut session = SessionCoordinator::new("s6", &audio_config(), stub.clone());

        let outcome = session.handle_chunk(chunk(0.3, 16000, Some(9))).unwrap().unwrap();
        assert_eq!(outcome.not_ready_reason().as_deref(), Some("model_unavailable: download failed"));
        assert_eq!(outcome.input_timestamp(), Some(9));

        // Next chunk tries again
        session.handle_chunk(chunk(0.3, 10, None)).unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
        assert_eq!(session.stats().load_failures, 2);
    }

    #[test]
    fn test_load_failure_end_session_policy() {
        let audio = AudioConfig {
            load_failure_policy: LoadFailurePolicy::EndSession,
            ..audio_config()
        };
        let stub = StubClassifier::failing(ClassifierError::Load("no weights".to_string()));
        let mut session = SessionCoordinator::new("s7", &audio, stub);

        let failure = session.handle_chunk(chunk(0.3, 16000, None)).unwrap_err();
        assert_eq!(failure.message, "no weights");
    }

    #[test]
    fn test_partial_window_policy() {
        let audio = AudioConfig {
            require_full_window: false,
            ..audio_config()
        };
        let mut session = SessionCoordinator::new("s8", &audio, StubClassifier::ok());
        let outcome = session.handle_chunk(chunk(0.5, 400, None)).unwrap().unwrap();
        assert!(outcome.is_ready());
    }

    #[test]
    fn test_registry_enforces_limit_and_tracks_stats() {
        let registry = SessionRegistry::new();
        let first = registry.register(2).unwrap();
        let _second = registry.register(2).unwrap();
        assert_eq!(registry.register(2).unwrap_err(), SessionLimitReached { max_sessions: 2 });

        let stats = SessionStats {
            chunks_received: 4,
            samples_received: 64000,
            ready: 2,
            ..SessionStats::default()
        };
        registry.update(&first, &stats);

        let summary = registry.summary();
        assert_eq!(summary.active_sessions, 2);
        assert_eq!(summary.total_chunks, 4);
        assert_eq!(summary.total_ready, 2);

        assert!(registry.remove(&first).is_some());
        assert!(registry.remove(&first).is_none());
        assert_eq!(registry.active_count(), 1);
        assert!(registry.register(2).is_ok());
    }

    #[test]
    fn test_update_ignores_unknown_session() {
        let registry = SessionRegistry::new();
        registry.update("missing", &SessionStats::default());
        assert_eq!(registry.active_count(), 0);
    }
}
