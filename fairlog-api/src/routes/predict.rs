use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use crate::routes::{ApiError, ApiResult};
use crate::types::{PredictRequest, PredictResponse};

use fairlog_core::error::FairlogError;
use fairlog_core::now_ms;
use fairlog_core::record::NewQuery;
use fairlog_itmac::TranscriptInput;
use fairlog_itmac::codec::input_hash;

/// Run the model, authenticate the exchange, then log the query.
///
/// The query is only appended once the IT-MAC bundle exists, so every logged
/// seq has a receipt the client can hold the provider to.
pub async fn predict(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PredictRequest>,
) -> ApiResult<Json<PredictResponse>> {
    let model = state
        .models
        .get(&req.model_id)
        .cloned()
        .ok_or_else(|| ApiError::not_found(format!("model {} not found", req.model_id)))?;
    let prediction = model.predict(&req.features)?;

    let query_id = Uuid::new_v4().to_string();
    let timestamp = now_ms();
    let input = TranscriptInput {
        query_id: query_id.clone(),
        model_id: req.model_id,
        input_hash: input_hash(&req.features),
        prediction,
        timestamp,
    };

    let provider = state.provider.clone();
    let itmac_req = req.itmac();
    let exchange = tokio::task::spawn_blocking(move || provider.respond(&itmac_req, input));
    let itmac = match tokio::time::timeout(state.bundle_timeout, exchange).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => {
            return Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("itmac task failed: {e}"),
            ));
        }
        Err(_) => {
            tracing::warn!(query_id = %query_id, "bundle deadline passed");
            return Err(FairlogError::Timeout(format!(
                "no bundle within {}ms",
                state.bundle_timeout.as_millis()
            ))
            .into());
        }
    };

    let record = state.sequencer.append(NewQuery {
        query_id: query_id.clone(),
        model_id: req.model_id,
        features: req.features,
        sensitive_attr: req.sensitive_attr,
        prediction,
        timestamp,
    })?;
    let seq_num = record.seq_num;
    let receipt = state.provider.sign_receipt(&query_id, record);

    tracing::info!(
        model_id = req.model_id,
        seq_num,
        query_id = %query_id,
        prediction,
        "query served"
    );

    Ok(Json(PredictResponse {
        itmac,
        seq_num,
        receipt,
    }))
}
