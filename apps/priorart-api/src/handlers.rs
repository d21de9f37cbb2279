//! HTTP handlers for the PriorArt API

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    Json,
};
use priorart_core::{
    EcdfPoint, NoProgress, QueryRequest, QueryResultRow, Record, RecordId, ReferenceSummary,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub rows: Vec<QueryResultRow>,
    pub elapsed_ms: u64,
    pub device: String,
    pub candidates_considered: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub vectors: usize,
    pub dimension: usize,
    pub device: String,
}

#[derive(Debug, Serialize)]
pub struct CalibrationResponse {
    pub summary: ReferenceSummary,
    pub ecdf: Vec<EcdfPoint>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let pipeline = &state.pipeline;
    let store = match pipeline.store().health_check().await {
        Ok(()) => "healthy".to_string(),
        Err(e) => format!("unhealthy: {}", e),
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        store,
        vectors: pipeline.index().len(),
        dimension: pipeline.index().dimension(),
        device: pipeline.device_label(),
    })
}

/// Similarity search with post-ranking filters and rejection probabilities
pub async fn search(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Json(request) = payload?;
    info!(
        "Search: {} chars, top_k={}, cpc={:?} ({})",
        request.text.len(),
        request.top_k,
        request.cpc_codes,
        request.cpc_operator
    );

    let outcome = state.pipeline.run(&request, &NoProgress).await?;

    Ok(Json(SearchResponse {
        rows: outcome.rows,
        elapsed_ms: outcome.elapsed.as_millis() as u64,
        device: state.pipeline.device_label(),
        candidates_considered: outcome.candidates_considered,
    }))
}

/// Fetch one record by id
pub async fn get_record(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Record>, ApiError> {
    let Path(id) = id?;
    let record = state.pipeline.store().get_record(RecordId(id)).await?;
    record.map(Json).ok_or(ApiError::RecordNotFound(id))
}

/// Reference distribution used for rejection probabilities
pub async fn calibration(State(state): State<Arc<AppState>>) -> Json<CalibrationResponse> {
    let scorer = state.pipeline.scorer();
    Json(CalibrationResponse {
        summary: scorer.summary(),
        ecdf: scorer.ecdf_points(),
    })
}
