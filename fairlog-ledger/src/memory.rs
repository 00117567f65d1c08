use crate::{
    BatchCommitment, DisputeResolution, FraudulentInclusionDispute, Ledger, LedgerBatch,
    NonInclusionDispute, TxHash,
};
use async_trait::async_trait;
use fairlog_core::digest::{Digest, decode_hex_array};
use fairlog_core::error::{FairlogError, Result};
use fairlog_core::now_ms;
use fairlog_itmac::codec::sha256;
use fairlog_itmac::receipt::data_hash;
use fairlog_verify::merkle::MerkleTree;
use fairlog_verify::signature::SignatureVerifier;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum FiledDispute {
    NonInclusion(NonInclusionDispute),
    FraudulentInclusion(FraudulentInclusionDispute),
}

#[derive(Default)]
struct State {
    batches: Vec<LedgerBatch>,
    by_commitment: HashMap<BatchCommitment, u64>,
    fail_next: u32,
    disputes: Vec<(FiledDispute, DisputeResolution)>,
}

/// In-process ledger. Adjudicates disputes the way the on-chain contract does
/// and publishes every new commitment on a broadcast channel.
///
/// With a provider key pinned, every dispute must carry evidence the provider
/// signed. Without one, fraudulent-inclusion adjudication trusts the submitted
/// leaf, which is only sound if the submitter checked its receipt signature.
pub struct MemoryLedger {
    state: Mutex<State>,
    events: broadcast::Sender<LedgerBatch>,
    merkle: MerkleTree,
    provider_key: Option<[u8; 32]>,
    grace_period_ms: u64,
}

impl MemoryLedger {
    pub fn new(grace_period_ms: u64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
            merkle: MerkleTree::new(),
            provider_key: None,
            grace_period_ms,
        }
    }

    /// Key that dispute receipts are checked against.
    pub fn with_provider_key(mut self, key: [u8; 32]) -> Self {
        self.provider_key = Some(key);
        self
    }

    pub fn with_merkle(mut self, merkle: MerkleTree) -> Self {
        self.merkle = merkle;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerBatch> {
        self.events.subscribe()
    }

    /// The next `n` commits fail with `LedgerSubmission`.
    pub fn fail_next_commits(&self, n: u32) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_next = n;
        }
    }

    pub fn batches(&self) -> Vec<LedgerBatch> {
        self.state.lock().map(|s| s.batches.clone()).unwrap_or_default()
    }

    pub fn disputes(&self) -> Vec<(FiledDispute, DisputeResolution)> {
        self.state.lock().map(|s| s.disputes.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| FairlogError::Ledger("ledger state poisoned".into()))
    }

    /// `reason` is `None` when the dispute is accepted.
    fn record_dispute(&self, filed: FiledDispute, reason: Option<String>) -> Result<DisputeResolution> {
        let mut s = self.lock()?;
        let mut buf = b"dispute".to_vec();
        buf.extend_from_slice(&(s.disputes.len() as u64).to_be_bytes());
        let resolution = DisputeResolution {
            accepted: reason.is_none(),
            tx_hash: tx_hash_of(&buf),
            reason,
        };
        match &resolution.reason {
            None => tracing::info!(tx = %resolution.tx_hash, "dispute accepted"),
            Some(r) => tracing::warn!(tx = %resolution.tx_hash, reason = %r, "dispute rejected"),
        }
        s.disputes.push((filed, resolution.clone()));
        Ok(resolution)
    }

    fn judge_non_inclusion(&self, d: &NonInclusionDispute) -> std::result::Result<(), String> {
        self.check_receipt_signature(d)?;
        if now_ms().saturating_sub(d.timestamp) < self.grace_period_ms {
            return Err("grace period has not elapsed".into());
        }
        let s = self.lock().map_err(|e| e.to_string())?;
        match s
            .batches
            .iter()
            .find(|b| b.model_id == d.model_id && b.contains(d.seq_num))
        {
            Some(b) => Err(format!("seq {} is covered by batch {}", d.seq_num, b.ledger_batch_id)),
            None => Ok(()),
        }
    }

    fn judge_fraudulent_inclusion(&self, d: &FraudulentInclusionDispute) -> std::result::Result<(), String> {
        let batch = {
            let s = self.lock().map_err(|e| e.to_string())?;
            s.batches
                .iter()
                .find(|b| b.ledger_batch_id == d.ledger_batch_id)
                .cloned()
                .ok_or_else(|| format!("unknown batch {}", d.ledger_batch_id))?
        };
        if !batch.contains(d.seq_num) {
            return Err(format!("seq {} is outside batch {}", d.seq_num, d.ledger_batch_id));
        }
        self.check_disputed_leaf(d, &batch)?;
        let proof = d
            .proof_steps()
            .ok_or_else(|| "proof and positions disagree".to_string())?;
        if self.merkle.verify_proof(&d.leaf_hash, &batch.merkle_root, &proof) {
            return Err("leaf verifies against the committed root".into());
        }
        Ok(())
    }

    /// With a pinned key, the leaf must be the one of a record the provider signed.
    fn check_disputed_leaf(
        &self,
        d: &FraudulentInclusionDispute,
        batch: &LedgerBatch,
    ) -> std::result::Result<(), String> {
        let Some(key) = &self.provider_key else {
            return Ok(());
        };
        let receipt = d
            .receipt
            .as_ref()
            .ok_or_else(|| "no signed receipt for the disputed leaf".to_string())?;
        if !receipt.verify(key) {
            return Err("receipt signature invalid".into());
        }
        if receipt.model_id() != batch.model_id || receipt.seq_num() != d.seq_num {
            return Err(format!(
                "receipt is for {}:{}, dispute is for {}:{}",
                receipt.model_id(),
                receipt.seq_num(),
                batch.model_id,
                d.seq_num
            ));
        }
        if self.merkle.leaf(&receipt.record) != d.leaf_hash {
            return Err("leaf does not match the signed record".into());
        }
        Ok(())
    }

    fn check_receipt_signature(&self, d: &NonInclusionDispute) -> std::result::Result<(), String> {
        let Some(key) = &self.provider_key else {
            return Ok(());
        };
        let sig: [u8; 64] =
            decode_hex_array(&d.provider_signature, "signature").map_err(|e| e.to_string())?;
        let hash = data_hash(
            d.seq_num,
            d.model_id,
            &d.features_hash,
            d.sensitive_attr,
            d.prediction,
            d.timestamp,
        );
        match SignatureVerifier::new().verify_ed25519(key, hash.as_bytes(), &sig) {
            Ok(true) => Ok(()),
            Ok(false) => Err("receipt signature invalid".into()),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn tx_hash_of(bytes: &[u8]) -> TxHash {
    sha256(bytes).to_hex()
}

fn commitment_bytes(c: &BatchCommitment) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 32 + 24);
    buf.extend_from_slice(&c.model_id.to_be_bytes());
    buf.extend_from_slice(c.merkle_root.as_bytes());
    buf.extend_from_slice(&c.count.to_be_bytes());
    buf.extend_from_slice(&c.start_seq.to_be_bytes());
    buf.extend_from_slice(&c.end_seq.to_be_bytes());
    buf
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn commit_batch(&self, c: BatchCommitment) -> Result<TxHash> {
        let batch = {
            let mut s = self.lock()?;
            if let Some(id) = s.by_commitment.get(&c) {
                let existing = &s.batches[*id as usize - 1];
                tracing::debug!(model_id = c.model_id, ledger_batch_id = id, "duplicate commitment");
                return Ok(existing.tx_hash.clone());
            }
            if s.fail_next > 0 {
                s.fail_next -= 1;
                return Err(FairlogError::LedgerSubmission("injected failure".into()));
            }
            if c.end_seq < c.start_seq || c.count != c.end_seq - c.start_seq + 1 {
                return Err(FairlogError::LedgerSubmission(format!(
                    "count {} does not match range {}-{}",
                    c.count, c.start_seq, c.end_seq
                )));
            }
            if let Some(overlap) = s
                .batches
                .iter()
                .find(|b| b.model_id == c.model_id && b.seq_num_start <= c.end_seq && c.start_seq <= b.seq_num_end)
            {
                return Err(FairlogError::LedgerSubmission(format!(
                    "range {}-{} overlaps batch {}",
                    c.start_seq, c.end_seq, overlap.ledger_batch_id
                )));
            }

            let id = s.batches.len() as u64 + 1;
            let batch = LedgerBatch {
                ledger_batch_id: id,
                model_id: c.model_id,
                seq_num_start: c.start_seq,
                seq_num_end: c.end_seq,
                merkle_root: c.merkle_root,
                committed_at: now_ms(),
                tx_hash: tx_hash_of(&commitment_bytes(&c)),
            };
            s.batches.push(batch.clone());
            s.by_commitment.insert(c, id);
            batch
        };

        tracing::info!(
            model_id = batch.model_id,
            ledger_batch_id = batch.ledger_batch_id,
            start = batch.seq_num_start,
            end = batch.seq_num_end,
            "batch committed to ledger"
        );
        // no subscribers is fine
        let _ = self.events.send(batch.clone());
        Ok(batch.tx_hash)
    }

    async fn get_batch(&self, ledger_batch_id: u64) -> Result<Option<LedgerBatch>> {
        let s = self.lock()?;
        Ok(s.batches
            .iter()
            .find(|b| b.ledger_batch_id == ledger_batch_id)
            .cloned())
    }

    async fn batches_for_model(&self, model_id: u32) -> Result<Vec<LedgerBatch>> {
        let s = self.lock()?;
        Ok(s.batches
            .iter()
            .filter(|b| b.model_id == model_id)
            .cloned()
            .collect())
    }

    async fn dispute_non_inclusion(&self, d: NonInclusionDispute) -> Result<DisputeResolution> {
        let reason = self.judge_non_inclusion(&d).err();
        self.record_dispute(FiledDispute::NonInclusion(d), reason)
    }

    async fn dispute_fraudulent_inclusion(
        &self,
        d: FraudulentInclusionDispute,
    ) -> Result<DisputeResolution> {
        let reason = self.judge_fraudulent_inclusion(&d).err();
        self.record_dispute(FiledDispute::FraudulentInclusion(d), reason)
    }
}

impl std::fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLedger")
            .field("batches", &self.batches().len())
            .finish_non_exhaustive()
    }
}
