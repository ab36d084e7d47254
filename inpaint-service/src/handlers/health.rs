use crate::services::get_metrics;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

pub async fn home() -> &'static str {
    "Inpainting service is running. POST 'image' and 'mask' to /inpaint/"
}

/// Liveness plus a database probe.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "inpaint-service",
                "version": env!("CARGO_PKG_VERSION"),
                "database": "ok"
            })),
        ),
        Err(e) => {
            tracing::warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "service": "inpaint-service",
                    "version": env!("CARGO_PKG_VERSION"),
                    "database": "unavailable"
                })),
            )
        }
    }
}

/// The generator is loaded before the router is served, so only the database
/// decides readiness.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "model": "loaded", "database": "ok" })),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "model": "loaded", "database": "unavailable" })),
        ),
    }
}

pub async fn metrics() -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        get_metrics(),
    )
}
