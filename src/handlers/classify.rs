use crate::audio::codec::decode_wav;
use crate::audio::{GateConfig, InferenceGate, OutcomeRecord};
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

/// Largest upload accepted, in bytes.
const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct FileClassification {
    #[serde(flatten)]
    pub outcome: OutcomeRecord,

    pub filename: String,
    pub duration_seconds: f32,
    pub analyzed_seconds: f32,
    pub processing_time_ms: u64,
}

/// Classify an uploaded WAV file.
///
/// ## Endpoint: `POST /api/v1/classify/file`
///
/// ## Request:
/// Multipart form data with a WAV file field named "audio", recorded at the
/// configured sample rate.
///
/// ## Response:
/// The same outcome record a streaming session would emit for the last
/// window of the file, plus file details:
/// ```json
/// {"ready": true, "silence": false, "emotion": "neutral", "confidence": 0.62,
///  "allEmotions": [...], "level": 31, "filename": "clip.wav",
///  "duration_seconds": 4.2, "analyzed_seconds": 3.0, "processing_time_ms": 180}
/// ```
pub async fn classify_file(
    state: web::Data<AppState>,
    mut payload: actix_multipart::Multipart,
) -> Result<HttpResponse, AppError> {
    use actix_multipart::Field;
    use futures_util::stream::StreamExt;

    let start_time = Instant::now();

    let mut audio_data: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;

    while let Some(item) = payload.next().await {
        let mut field: Field = item.map_err(|e| AppError::ValidationError(format!("Multipart error: {}", e)))?;

        let is_audio = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .is_some_and(|name| name == "audio");

        if !is_audio {
            // Drain fields we do not use
            while let Some(chunk) = field.next().await {
                chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
            }
            continue;
        }

        filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(|s| s.to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
            if bytes.len() + chunk.len() > MAX_FILE_SIZE {
                return Err(AppError::ValidationError(format!(
                    "File too large (max: {} bytes)",
                    MAX_FILE_SIZE
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        audio_data = Some(bytes);
    }

    let audio_bytes = audio_data.ok_or_else(|| AppError::ValidationError("No audio file provided".to_string()))?;
    let filename = filename.unwrap_or_else(|| "unknown".to_string());

    let wav = decode_wav(&audio_bytes)?;
    let audio = state.get_config().audio;

    if wav.sample_rate != audio.sample_rate {
        return Err(AppError::ValidationError(format!(
            "Sample rate {} Hz does not match the configured {} Hz",
            wav.sample_rate, audio.sample_rate
        )));
    }

    debug!(
        filename = %filename,
        channels = wav.channels,
        samples = wav.samples.len(),
        "Decoded uploaded WAV"
    );

    let duration_seconds = wav.samples.len() as f32 / wav.sample_rate as f32;
    let window_samples = audio.window_samples();
    let window = wav.samples[wav.samples.len().saturating_sub(window_samples)..].to_vec();
    let analyzed_seconds = window.len() as f32 / wav.sample_rate as f32;

    let gate = InferenceGate::new(GateConfig::from_audio_config(&audio), state.classifier.clone());
    let outcome = web::block(move || gate.evaluate(&window, None))
        .await
        .map_err(|e| AppError::Internal(format!("Classification task failed: {}", e)))?
        .map_err(|failure| AppError::ServiceUnavailable(failure.to_string()))?;

    let processing_time_ms = start_time.elapsed().as_millis() as u64;
    info!(
        filename = %filename,
        outcome = ?outcome.kind(),
        duration_ms = processing_time_ms,
        "Classified uploaded file"
    );

    Ok(HttpResponse::Ok().json(FileClassification {
        outcome: outcome.to_record(),
        filename,
        duration_seconds,
        analyzed_seconds,
        processing_time_ms,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FixedScoresClassifier;
    use crate::config::AppConfig;
    use actix_web::http::{header, StatusCode};
    use actix_web::{test, App};
    use std::io::Cursor;
    use std::sync::Arc;

    const BOUNDARY: &str = "emotion-test-boundary";

    fn wav_bytes(sample_rate: u32, samples: Vec<i16>) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for sample in samples {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    fn multipart_body(field: &str, file: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"{f}\"; filename=\"clip.wav\"\r\n\
                 Content-Type: audio/wav\r\n\r\n",
                b = BOUNDARY,
                f = field
            )
            .as_bytes(),
        );
        body.extend_from_slice(file);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    async fn post(body: Vec<u8>) -> actix_web::dev::ServiceResponse {
        let state = web::Data::new(AppState::with_classifier(
            AppConfig::default(),
            Arc::new(FixedScoresClassifier::default()),
        ));
        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/classify/file", web::post().to(classify_file)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/classify/file")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(body)
            .to_request();
        test::call_service(&app, req).await
    }

    #[actix_web::test]
    async fn test_full_window_file_is_classified() {
        let file = wav_bytes(16000, vec![8000; 64000]);
        let resp = post(multipart_body("audio", &file)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["ready"], true);
        assert_eq!(body["filename"], "clip.wav");
        assert_eq!(body["duration_seconds"], 4.0);
        assert_eq!(body["analyzed_seconds"], 3.0);
        assert!(body["emotion"].is_string());
    }

    #[actix_web::test]
    async fn test_short_file_reports_insufficient_data() {
        let file = wav_bytes(16000, vec![8000; 16000]);
        let resp = post(multipart_body("audio", &file)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["ready"], false);
        assert_eq!(body["notReadyReason"], "insufficient_buffer");
    }

    #[actix_web::test]
    async fn test_sample_rate_mismatch_is_rejected() {
        let file = wav_bytes(44100, vec![8000; 44100]);
        let resp = post(multipart_body("audio", &file)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_missing_audio_field_is_rejected() {
        let file = wav_bytes(16000, vec![8000; 100]);
        let resp = post(multipart_body("attachment", &file)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
