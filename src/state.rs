//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Arc<RwLock<T>> Pattern:
//! - **Arc**: Every worker thread holds a reference to the same data
//! - **RwLock**: Many concurrent readers (config lookups) or one writer
//!   (config updates, metric increments)
//!
//! ## What is shared:
//! - **config**: Runtime-updatable settings; sessions copy the audio section at start
//! - **metrics**: Request counters fed by the endpoint metrics middleware
//! - **classifier**: One classifier instance for all sessions, loaded lazily
//! - **sessions**: Registry of live streaming connections

use crate::audio::SessionRegistry;
use crate::classifier::{self, SharedClassifier};
use crate::config::{AppConfig, ClassifierBackend};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,

    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Shared by every session; never replaced after startup
    pub classifier: SharedClassifier,

    /// What `classifier` was built from, for status reporting
    pub classifier_info: ClassifierInfo,

    pub sessions: Arc<SessionRegistry>,

    pub start_time: Instant,
}

#[derive(Debug, Clone)]
pub struct ClassifierInfo {
    pub backend: ClassifierBackend,
    pub model: String,
    pub revision: String,
    pub device: String,
}

/// Counters collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Sessions opened since start; open sessions are counted by the registry
    pub total_sessions: u64,

    /// Keyed by "METHOD /route/pattern"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build state with the classifier selected by `config.models`.
    pub fn new(config: AppConfig) -> Self {
        let classifier = classifier::build_classifier(&config.models);
        Self::with_classifier(config, classifier)
    }

    /// Build state around an existing classifier (tests inject stubs here).
    pub fn with_classifier(config: AppConfig, classifier: SharedClassifier) -> Self {
        let classifier_info = ClassifierInfo {
            backend: config.models.backend,
            model: config.models.emotion_model.clone(),
            revision: config.models.revision.clone(),
            device: config.models.device.clone(),
        };

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            classifier,
            classifier_info,
            sessions: Arc::new(SessionRegistry::new()),
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    fn with_metrics<F: FnOnce(&mut AppMetrics)>(&self, update: F) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }

    pub fn increment_request_count(&self) {
        self.with_metrics(|m| m.request_count += 1);
    }

    pub fn increment_error_count(&self) {
        self.with_metrics(|m| m.error_count += 1);
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.with_metrics(|m| {
            let endpoint_metric = m.endpoint_metrics.entry(endpoint.to_string()).or_default();
            endpoint_metric.request_count += 1;
            endpoint_metric.total_duration_ms += duration_ms;
            if is_error {
                endpoint_metric.error_count += 1;
            }
        });
    }

    pub fn record_session_started(&self) {
        self.with_metrics(|m| m.total_sessions += 1);
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FixedScoresClassifier;

    fn state() -> AppState {
        AppState::with_classifier(AppConfig::default(), Arc::new(FixedScoresClassifier::default()))
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_session_totals_outlive_open_sessions() {
        let state = state();
        let first = state.sessions.register(10).unwrap();
        state.record_session_started();
        state.sessions.register(10).unwrap();
        state.record_session_started();
        state.sessions.remove(&first);

        assert_eq!(state.sessions.active_count(), 1);
        assert_eq!(state.get_metrics_snapshot().total_sessions, 2);
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let state = state();
        let mut config = state.get_config();
        config.performance.max_concurrent_sessions = 0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().performance.max_concurrent_sessions, 10);
    }

    #[test]
    fn test_fixed_backend_selected_from_config() {
        let mut config = AppConfig::default();
        config.models.backend = ClassifierBackend::Fixed;
        let state = AppState::new(config);
        assert!(state.classifier.is_loaded());
        assert_eq!(state.classifier_info.backend, ClassifierBackend::Fixed);
    }
}
