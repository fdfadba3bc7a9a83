//! Liveness and metrics endpoints.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Body of every heartbeat reply. The client checks for this exact string.
pub const HEARTBEAT_BODY: &str = "asr";

/// `GET /heartbeat`: constant reply, independent of recognizer state.
pub async fn heartbeat() -> HttpResponse {
    HttpResponse::Ok().content_type("text/html; charset=utf-8").body(HEARTBEAT_BODY)
}

/// `GET /metrics`: request counters, latency per endpoint, recognition outcomes
/// and the registry's current state.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    let recognition = &metrics.recognition;
    let active_language = state.sessions.active_language().await;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "recognition": {
            "success": recognition.success,
            "no_speech": recognition.no_speech,
            "decode_error": recognition.decode_error,
            "frames_processed": recognition.frames_processed
        },
        "languages": {
            "active": active_language.as_ref().map(|tag| tag.as_str()),
            "supported_count": state.sessions.supported_count(),
            "switches": state.sessions.language_switches().await
        },
        "sessions": {
            "in_use": state.sessions.sessions_in_use(),
            "idle": state.sessions.idle_sessions().await,
            "max": state.sessions.max_sessions()
        }
    }))
}
