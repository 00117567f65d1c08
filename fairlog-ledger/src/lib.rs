//! The public commitment log the provider writes batch roots to and clients
//! file disputes against. Consensus is someone else's problem: anything that
//! implements [`Ledger`] will do.

pub mod memory;

use async_trait::async_trait;
use fairlog_core::digest::Digest;
use fairlog_core::error::Result;
use fairlog_core::record::{Batch, Position, ProofStep};
use fairlog_itmac::receipt::SignedReceipt;
use serde::{Deserialize, Serialize};

pub use memory::MemoryLedger;

/// `0x`-prefixed transaction hash.
pub type TxHash = String;

/// What the provider submits for one batch. Equal commitments are the same
/// submission, which is what makes retries idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchCommitment {
    pub model_id: u32,
    pub merkle_root: Digest,
    pub count: u64,
    pub start_seq: u64,
    pub end_seq: u64,
}

impl From<&Batch> for BatchCommitment {
    fn from(b: &Batch) -> Self {
        Self {
            model_id: b.model_id,
            merkle_root: b.merkle_root,
            count: b.record_count,
            start_seq: b.start_seq,
            end_seq: b.end_seq,
        }
    }
}

/// A batch as the ledger stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBatch {
    pub ledger_batch_id: u64,
    pub model_id: u32,
    pub seq_num_start: u64,
    pub seq_num_end: u64,
    pub merkle_root: Digest,
    pub committed_at: u64,
    pub tx_hash: TxHash,
}

impl LedgerBatch {
    pub fn contains(&self, seq_num: u64) -> bool {
        seq_num >= self.seq_num_start && seq_num <= self.seq_num_end
    }
}

/// "You signed a receipt for this query and never committed it."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonInclusionDispute {
    pub model_id: u32,
    pub seq_num: u64,
    pub timestamp: u64,
    pub features_hash: Digest,
    pub sensitive_attr: u32,
    /// Fixed-point, six decimals.
    pub prediction: i64,
    pub provider_signature: String,
}

/// "This batch claims my seq number, but my leaf is not under its root."
///
/// The bare fields say nothing about who produced `leaf_hash`: a ledger that
/// adjudicates on them alone accepts any leaf that fails to fold. Attach the
/// signed receipt the leaf was computed from so the ledger can tie the leaf
/// to a record the provider actually signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudulentInclusionDispute {
    pub ledger_batch_id: u64,
    pub seq_num: u64,
    pub leaf_hash: Digest,
    pub merkle_proof: Vec<Digest>,
    /// 0 = left, 1 = right, one per proof entry.
    pub proof_positions: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<SignedReceipt>,
}

impl FraudulentInclusionDispute {
    pub fn new(ledger_batch_id: u64, seq_num: u64, leaf_hash: Digest, proof: &[ProofStep]) -> Self {
        Self {
            ledger_batch_id,
            seq_num,
            leaf_hash,
            merkle_proof: proof.iter().map(|s| s.sibling).collect(),
            proof_positions: proof.iter().map(|s| s.position.as_u8()).collect(),
            receipt: None,
        }
    }

    pub fn with_receipt(mut self, receipt: SignedReceipt) -> Self {
        self.receipt = Some(receipt);
        self
    }

    /// Back to proof steps. `None` when the two arrays disagree in length or a
    /// position is neither 0 nor 1.
    pub fn proof_steps(&self) -> Option<Vec<ProofStep>> {
        if self.merkle_proof.len() != self.proof_positions.len() {
            return None;
        }
        self.merkle_proof
            .iter()
            .zip(&self.proof_positions)
            .map(|(sibling, pos)| {
                let position = match pos {
                    0 => Position::Left,
                    1 => Position::Right,
                    _ => return None,
                };
                Some(ProofStep {
                    sibling: *sibling,
                    position,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResolution {
    pub accepted: bool,
    pub tx_hash: TxHash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Opaque verdict from the fairness prover / attestation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub attestation_hash: Digest,
    pub signature: String,
    pub passed: bool,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Idempotent for an identical commitment: the original tx hash comes back.
    async fn commit_batch(&self, commitment: BatchCommitment) -> Result<TxHash>;

    async fn get_batch(&self, ledger_batch_id: u64) -> Result<Option<LedgerBatch>>;

    async fn batches_for_model(&self, model_id: u32) -> Result<Vec<LedgerBatch>>;

    async fn dispute_non_inclusion(&self, dispute: NonInclusionDispute) -> Result<DisputeResolution>;

    async fn dispute_fraudulent_inclusion(
        &self,
        dispute: FraudulentInclusionDispute,
    ) -> Result<DisputeResolution>;
}
