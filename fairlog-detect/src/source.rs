use async_trait::async_trait;
use fairlog_batch::BatchBuilder;
use fairlog_core::error::{FairlogError, Result};
use fairlog_core::record::{PROOF_RESPONSE_VERSION, ProofResponse};
use std::sync::Arc;
use std::time::Duration;

/// What a proof provider said about one seq number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofFetch {
    Found(ProofResponse),
    /// The provider has no proof for a seq it committed.
    Missing,
    /// The provider answered with something that is not a proof.
    Malformed(String),
}

/// Supplies fresh Merkle proofs for committed seq numbers. `Err` is reserved
/// for transport failures, which say nothing about the provider's honesty.
#[async_trait]
pub trait ProofSource: Send + Sync {
    async fn fetch_proof(&self, model_id: u32, seq_num: u64) -> Result<ProofFetch>;
}

/// `GET {base}/proof/{seq}?model_id={model}` against the provider's server.
pub struct HttpProofSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProofSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FairlogError::ProofSource(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ProofSource for HttpProofSource {
    async fn fetch_proof(&self, model_id: u32, seq_num: u64) -> Result<ProofFetch> {
        let url = format!("{}/proof/{seq_num}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("model_id", model_id)])
            .send()
            .await
            .map_err(|e| FairlogError::ProofSource(format!("GET {url}: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(ProofFetch::Missing);
        }
        if status.is_server_error() {
            return Err(FairlogError::ProofSource(format!("GET {url}: {status}")));
        }
        if !status.is_success() {
            return Ok(ProofFetch::Malformed(format!("unexpected status {status}")));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| FairlogError::ProofSource(format!("GET {url}: {e}")))?;
        Ok(match serde_json::from_slice::<ProofResponse>(&body) {
            Ok(p) if p.version == PROOF_RESPONSE_VERSION => ProofFetch::Found(p),
            Ok(p) => ProofFetch::Malformed(format!("unsupported proof version {}", p.version)),
            Err(e) => ProofFetch::Malformed(e.to_string()),
        })
    }
}

/// Proofs straight from an in-process batch builder.
pub struct LocalProofSource {
    builder: Arc<BatchBuilder>,
}

impl LocalProofSource {
    pub fn new(builder: Arc<BatchBuilder>) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl ProofSource for LocalProofSource {
    async fn fetch_proof(&self, model_id: u32, seq_num: u64) -> Result<ProofFetch> {
        match self.builder.proof_for(model_id, seq_num) {
            Ok(Some(p)) => Ok(ProofFetch::Found(p)),
            Ok(None) => Ok(ProofFetch::Missing),
            Err(e) if e.is_fatal() => Ok(ProofFetch::Malformed(e.to_string())),
            Err(e) => Err(e),
        }
    }
}
