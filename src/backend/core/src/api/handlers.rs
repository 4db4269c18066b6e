//! API request handlers with proper error propagation.
//!
//! All handlers return `Result<impl IntoResponse, VantageError>` so that
//! errors are automatically converted to appropriate HTTP status codes via
//! the `IntoResponse` implementation on `VantageError`.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiResponse, AppState};
use crate::error::VantageError;
use crate::experiment::{ExperimentId, ExperimentSpec, ExperimentStatus, VariantId};
use crate::store::ListFilter;

// ═══════════════════════════════════════════════════════════════════════════════
// Health Check
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Experiment CRUD
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<ExperimentStatus>,
}

pub async fn create_experiment(
    State(state): State<AppState>,
    Json(spec): Json<ExperimentSpec>,
) -> Result<impl IntoResponse, VantageError> {
    let experiment = state.lifecycle.create(spec).await?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(ApiResponse::success(experiment)),
    ))
}

pub async fn list_experiments(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, VantageError> {
    let experiments = state
        .lifecycle
        .list(ListFilter {
            status: query.status,
        })
        .await?;
    Ok(Json(ApiResponse::success(experiments)))
}

pub async fn get_experiment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, VantageError> {
    let experiment = state.lifecycle.get(ExperimentId(id)).await?;
    Ok(Json(ApiResponse::success(experiment)))
}

pub async fn delete_experiment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, VantageError> {
    // Absent ids are a quiet no-op: delete never raises for missing records.
    let removed = state.lifecycle.delete(ExperimentId(id)).await?;
    Ok(Json(ApiResponse::success(removed)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lifecycle Transitions
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn start_experiment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, VantageError> {
    let experiment = state.lifecycle.start(ExperimentId(id)).await?;
    Ok(Json(ApiResponse::success(experiment)))
}

pub async fn pause_experiment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, VantageError> {
    let experiment = state.lifecycle.pause(ExperimentId(id)).await?;
    Ok(Json(ApiResponse::success(experiment)))
}

pub async fn resume_experiment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, VantageError> {
    let experiment = state.lifecycle.resume(ExperimentId(id)).await?;
    Ok(Json(ApiResponse::success(experiment)))
}

pub async fn stop_experiment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, VantageError> {
    // Stopping a terminal or absent experiment is a no-op, not an error.
    let experiment = state.lifecycle.stop(ExperimentId(id)).await?;
    Ok(Json(ApiResponse::success(experiment)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Traffic Ingestion
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRequest {
    pub variant_id: VariantId,
    #[serde(default)]
    pub visitors: u64,
    #[serde(default)]
    pub conversions: u64,
}

pub async fn record_traffic(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TrafficRequest>,
) -> Result<impl IntoResponse, VantageError> {
    let experiment = state
        .lifecycle
        .record_traffic(ExperimentId(id), req.variant_id, req.visitors, req.conversions)
        .await?;
    Ok(Json(ApiResponse::success(experiment)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Analysis
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn analyze_experiment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, VantageError> {
    let (experiment, analysis) = state.lifecycle.analyze(ExperimentId(id)).await?;
    Ok(Json(ApiResponse::success(serde_json::json!({
        "experiment": experiment,
        "analysis": analysis,
    }))))
}
