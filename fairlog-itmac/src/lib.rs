//! Per-query interactive authentication between a querying client and the
//! inference provider: a commit-reveal coin flip, an HMAC over the agreed
//! transcript, and a provider signature the client can check offline.
//!
//! This proves who produced a transcript. It says nothing about whether the
//! model computed the prediction correctly.

pub mod client;
pub mod codec;
pub mod provider;
pub mod receipt;

use fairlog_core::digest::Digest;
use serde::{Deserialize, Serialize};

pub const ITMAC_VERSION: u32 = 1;

/// The tuple both parties agree was exchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTranscript {
    pub query_id: String,
    pub model_id: u32,
    /// Authentication-layer hash of the input, distinct from the leaf encoding.
    pub input_hash: Digest,
    pub prediction: f32,
    pub timestamp: u64,
    pub coins: Digest,
}

/// Provider's commitment to a transcript. Hex-encoded so a malformed bundle
/// surfaces as a verification failure rather than a decode panic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacBundle {
    pub mac: String,
    pub provider_signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinFlip {
    pub client_commit: Digest,
    pub client_rand: Digest,
    pub provider_rand: Digest,
    pub coins: Digest,
}

/// Client half of the exchange. `client_rand` is revealed in the same request
/// as its commitment to save a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItmacRequest {
    pub version: u32,
    pub client_commit: Digest,
    pub client_rand: Digest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItmacResponse {
    pub version: u32,
    pub provider_rand: Digest,
    pub transcript: QueryTranscript,
    pub bundle: MacBundle,
    pub provider_public_key: String,
}

/// Everything but the coins, supplied by the inference path.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptInput {
    pub query_id: String,
    pub model_id: u32,
    pub input_hash: Digest,
    pub prediction: f32,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl VerifyOutcome {
    pub fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}
