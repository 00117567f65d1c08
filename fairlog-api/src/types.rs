use fairlog_core::digest::Digest;
use fairlog_core::record::Batch;
use fairlog_itmac::receipt::SignedReceipt;
use fairlog_itmac::{ItmacRequest, ItmacResponse};
use serde::{Deserialize, Serialize};

// -- /predict --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub version: u32,
    pub model_id: u32,
    pub features: Vec<f32>,
    pub sensitive_attr: u32,
    pub client_commit: Digest,
    pub client_rand: Digest,
}

impl PredictRequest {
    pub fn new(itmac: &ItmacRequest, model_id: u32, features: Vec<f32>, sensitive_attr: u32) -> Self {
        Self {
            version: itmac.version,
            model_id,
            features,
            sensitive_attr,
            client_commit: itmac.client_commit,
            client_rand: itmac.client_rand,
        }
    }

    pub fn itmac(&self) -> ItmacRequest {
        ItmacRequest {
            version: self.version,
            client_commit: self.client_commit,
            client_rand: self.client_rand,
        }
    }
}

/// The IT-MAC response plus the logged seq number and a signed receipt the
/// client keeps for fraud detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    #[serde(flatten)]
    pub itmac: ItmacResponse,
    pub seq_num: u64,
    pub receipt: SignedReceipt,
}

// -- /proof --

#[derive(Debug, Deserialize)]
pub struct ProofQuery {
    pub model_id: u32,
}

// -- /batches --

#[derive(Debug, Default, Deserialize)]
pub struct BatchesQuery {
    pub model_id: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchesResponse {
    pub batches: Vec<Batch>,
}

// -- /health --

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub models: Vec<u32>,
    pub provider_public_key: String,
    pub timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
