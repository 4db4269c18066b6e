//! HTTP API for the experiment engine.
//!
//! REST operations mutate experiments through the lifecycle manager; the
//! `/experiments/{id}/live` endpoint serves a persistent server-sent event
//! stream of snapshots.

mod handlers;
mod live;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::lifecycle::LifecycleManager;
use crate::live::LiveBroadcaster;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
    pub broadcaster: Arc<LiveBroadcaster>,
}

/// Build the API router.
///
/// # Example
///
/// ```rust,ignore
/// let state = AppState { lifecycle, broadcaster };
/// let app = build_router(state);
/// ```
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/experiments",
            post(handlers::create_experiment).get(handlers::list_experiments),
        )
        .route(
            "/experiments/:id",
            get(handlers::get_experiment).delete(handlers::delete_experiment),
        )
        .route("/experiments/:id/start", post(handlers::start_experiment))
        .route("/experiments/:id/pause", post(handlers::pause_experiment))
        .route("/experiments/:id/resume", post(handlers::resume_experiment))
        .route("/experiments/:id/stop", post(handlers::stop_experiment))
        .route("/experiments/:id/traffic", post(handlers::record_traffic))
        .route("/experiments/:id/analyze", post(handlers::analyze_experiment))
        .layer(CompressionLayer::new())
        // The live route sits outside the compression layer so each event is
        // flushed to the client immediately.
        .route("/experiments/:id/live", get(live::live_stream))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// API response wrapper.
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            error_code: None,
        }
    }
}
