//! Classifier status and self-test endpoints.

use crate::classifier::{synthetic_self_test_audio, EmotionScore};
use crate::device::DeviceSummary;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;
use std::time::Instant;
use tracing::{info, warn};

/// Length of the synthetic clip used by the self-test.
const SELF_TEST_SECONDS: f32 = 1.0;

#[derive(Debug, Serialize)]
pub struct SelfTestReport {
    pub ok: bool,
    pub details: String,
    pub top: Option<EmotionScore>,
    pub duration_ms: u64,
}

pub async fn classifier_status(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let info = &state.classifier_info;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "backend": info.backend.as_str(),
        "model": info.model,
        "revision": info.revision,
        "loaded": state.classifier.is_loaded(),
        "device": DeviceSummary::detect(&info.device)
    })))
}

/// Classify a second of synthetic audio end to end.
///
/// A broken model is reported in the body with `ok: false`; the request itself
/// only fails if the blocking task could not run.
pub async fn classifier_self_test(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sample_rate = state.get_config().audio.sample_rate;
    let classifier = state.classifier.clone();
    let started = Instant::now();

    let result = web::block(move || {
        let audio = synthetic_self_test_audio(sample_rate, SELF_TEST_SECONDS);
        classifier.classify(&audio, sample_rate)
    })
    .await
    .map_err(|e| AppError::Internal(format!("Self-test task failed: {}", e)))?;

    let duration_ms = started.elapsed().as_millis() as u64;

    let report = match result {
        Ok(scores) => match scores.into_iter().next() {
            Some(top) => {
                info!(label = %top.label, score = top.score, duration_ms, "Classifier self-test passed");
                SelfTestReport {
                    ok: true,
                    details: format!("classified {}s of synthetic audio", SELF_TEST_SECONDS),
                    top: Some(top),
                    duration_ms,
                }
            }
            None => SelfTestReport {
                ok: false,
                details: "classifier returned no scores".to_string(),
                top: None,
                duration_ms,
            },
        },
        Err(e) => {
            warn!(error = %e, duration_ms, "Classifier self-test failed");
            SelfTestReport {
                ok: false,
                details: e.to_string(),
                top: None,
                duration_ms,
            }
        }
    };

    Ok(HttpResponse::Ok().json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierError, EmotionClassifier, FixedScoresClassifier, SharedClassifier};
    use crate::config::AppConfig;
    use actix_web::{test, App};
    use std::sync::Arc;

    struct BrokenClassifier;

    impl EmotionClassifier for BrokenClassifier {
        fn classify(&self, _samples: &[f32], _sample_rate: u32) -> Result<Vec<EmotionScore>, ClassifierError> {
            Err(ClassifierError::Load("weights missing".to_string()))
        }

        fn is_loaded(&self) -> bool {
            false
        }
    }

    fn app_state(classifier: SharedClassifier) -> web::Data<AppState> {
        web::Data::new(AppState::with_classifier(AppConfig::default(), classifier))
    }

    #[actix_web::test]
    async fn test_self_test_reports_top_label() {
        let app = test::init_service(
            App::new()
                .app_data(app_state(Arc::new(FixedScoresClassifier::default())))
                .route("/self-test", web::post().to(classifier_self_test)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::post().uri("/self-test").to_request()).await;
        assert_eq!(body["ok"], true);
        assert!(body["top"]["label"].is_string());
    }

    #[actix_web::test]
    async fn test_self_test_failure_is_reported_not_raised() {
        let app = test::init_service(
            App::new()
                .app_data(app_state(Arc::new(BrokenClassifier)))
                .route("/self-test", web::post().to(classifier_self_test)),
        )
        .await;

        let req = test::TestRequest::post().uri("/self-test").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["ok"], false);
        assert!(body["details"].as_str().unwrap().contains("weights missing"));
        assert!(body["top"].is_null());
    }

    #[actix_web::test]
    async fn test_status_reports_backend_and_load_state() {
        let app = test::init_service(
            App::new()
                .app_data(app_state(Arc::new(BrokenClassifier)))
                .route("/status", web::get().to(classifier_status)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/status").to_request()).await;
        assert_eq!(body["backend"], "wav2vec2");
        assert_eq!(body["loaded"], false);
        assert_eq!(body["device"]["configured"], "auto");
    }
}
