use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Apply a partial configuration update.
///
/// Audio settings take effect for sessions opened afterwards; running sessions
/// keep the settings they started with.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(format!("{:#}", e)))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    info!(
        window_seconds = current_config.audio.window_seconds,
        emit_policy = ?current_config.audio.emit_policy,
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config
    })))
}
