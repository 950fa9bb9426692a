// Read-only HTTP API over the metrics store

mod http;

pub use http::NOT_READY;

use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::store::MetricsStore;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<MetricsStore>,
}

pub fn app(store: Arc<MetricsStore>) -> Router {
    let state = AppState { store };
    Router::new()
        .route("/version", get(http::version_handler)) // GET /version
        .route("/api/metrics", get(http::metrics_handler)) // GET /api/metrics
        .route("/api/general", get(http::general_handler)) // GET /api/general
        .route("/api/user", get(http::user_handler)) // GET /api/user
        .route("/api/workers", get(http::workers_handler)) // GET /api/workers
        .route("/api/hourly", get(http::hourly_handler)) // GET /api/hourly
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}
