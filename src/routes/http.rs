// GET handlers: version, latest snapshot (whole or sliced), rolling-window stats.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use super::AppState;
use crate::version::{NAME, VERSION};

pub const NOT_READY: &str = "metrics not collected yet";

/// GET /version: service name and version (from Cargo.toml at build time).
pub(super) async fn version_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": NAME,
        "version": VERSION,
    }))
}

/// 404 with a plain "not ready" body until the first snapshot is published.
fn from_latest<T: Serialize>(
    state: &AppState,
    select: impl FnOnce(&crate::models::Snapshot) -> T,
) -> Response {
    match state.store.latest() {
        Some(snapshot) => Json(select(&snapshot)).into_response(),
        None => (StatusCode::NOT_FOUND, NOT_READY).into_response(),
    }
}

/// GET /api/metrics
pub(super) async fn metrics_handler(State(state): State<AppState>) -> Response {
    from_latest(&state, |s| s.clone())
}

/// GET /api/general
pub(super) async fn general_handler(State(state): State<AppState>) -> Response {
    from_latest(&state, |s| s.general.clone())
}

/// GET /api/user
pub(super) async fn user_handler(State(state): State<AppState>) -> Response {
    from_latest(&state, |s| s.user.clone())
}

/// GET /api/workers
pub(super) async fn workers_handler(State(state): State<AppState>) -> Response {
    from_latest(&state, |s| s.workers.clone())
}

/// GET /api/hourly. Empty windows are reported as zeros, not as an error.
pub(super) async fn hourly_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.window_stats())
}
