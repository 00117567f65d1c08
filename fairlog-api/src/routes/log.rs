use axum::Json;
use axum::extract::{Path, Query, State};
use std::sync::Arc;

use crate::AppState;
use crate::routes::{ApiError, ApiResult};
use crate::types::{BatchesQuery, BatchesResponse, HealthResponse, ProofQuery};

use fairlog_batch::QueryStore;
use fairlog_core::now_ms;
use fairlog_core::record::ProofResponse;

/// Fresh inclusion proof for one committed seq. 404 until a batch covers it.
pub async fn proof(
    State(state): State<Arc<AppState>>,
    Path(seq_num): Path<u64>,
    Query(q): Query<ProofQuery>,
) -> ApiResult<Json<ProofResponse>> {
    match state.builder.proof_for(q.model_id, seq_num)? {
        Some(p) => Ok(Json(p)),
        None => Err(ApiError::not_found(format!(
            "no batch covers seq {seq_num} of model {}",
            q.model_id
        ))),
    }
}

pub async fn batches(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BatchesQuery>,
) -> ApiResult<Json<BatchesResponse>> {
    let mut batches = state.builder.store().batches()?;
    if let Some(model_id) = q.model_id {
        batches.retain(|b| b.model_id == model_id);
    }
    Ok(Json(BatchesResponse { batches }))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let mut models: Vec<u32> = state.models.keys().copied().collect();
    models.sort_unstable();
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        models,
        provider_public_key: state.provider.public_key_hex(),
        timestamp: now_ms(),
    })
}
