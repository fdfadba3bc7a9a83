//! Debug endpoints for captured recordings.
//!
//! Routed only when `debug.audio_debug` is enabled:
//! - `GET /audio-debug`: recordings, newest first
//! - `GET /audio/{file}`: one `.wav` file

use crate::error::{AppError, AppResult};
use crate::recordings::RecordingStore;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

fn store(state: &AppState) -> AppResult<RecordingStore> {
    state
        .recordings
        .clone()
        .ok_or_else(|| AppError::NotFound("Audio debugging is disabled".to_string()))
}

pub async fn list_recordings(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let store = store(&state)?;
    let entries = web::block(move || store.list())
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;

    Ok(HttpResponse::Ok().json(json!({
        "count": entries.len(),
        "recordings": entries,
    })))
}

pub async fn serve_recording(
    file: web::Path<String>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let store = store(&state)?;
    let name = file.into_inner();
    let path = store
        .resolve(&name)
        .ok_or_else(|| AppError::NotFound(format!("Recording '{}' not found", name)))?;

    let bytes = web::block(move || std::fs::read(path))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;

    Ok(HttpResponse::Ok().content_type("audio/wav").body(bytes))
}
