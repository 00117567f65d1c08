use crate::store::QueryStore;
use fairlog_core::config::BatchConfig;
use fairlog_core::digest::Digest;
use fairlog_core::error::{FairlogError, Result};
use fairlog_core::now_ms;
use fairlog_core::record::{Batch, PROOF_RESPONSE_VERSION, ProofResponse, QueryRecord};
use fairlog_ledger::{BatchCommitment, Ledger, TxHash};
use fairlog_verify::merkle::MerkleTree;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Check that `seq_nums` form one run with no holes or repeats.
/// Returns `(start, end)`; the error names the first break in sorted order.
pub fn validate_contiguity(seq_nums: &[u64]) -> Result<(u64, u64)> {
    let mut sorted = seq_nums.to_vec();
    sorted.sort_unstable();
    let (Some(&start), Some(&end)) = (sorted.first(), sorted.last()) else {
        return Err(FairlogError::Malformed("empty sequence window".into()));
    };
    for pair in sorted.windows(2) {
        if pair[1] != pair[0] + 1 {
            return Err(FairlogError::SequenceGap {
                expected: pair[0] + 1,
                found: pair[1],
            });
        }
    }
    debug_assert_eq!(end - start + 1, sorted.len() as u64);
    Ok((start, end))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub created: Vec<Batch>,
    pub committed: usize,
    pub failed_models: Vec<u32>,
}

/// Drains the unbatched backlog into Merkle-rooted batches and pushes their
/// roots to the ledger.
pub struct BatchBuilder {
    store: Arc<dyn QueryStore>,
    merkle: MerkleTree,
    config: BatchConfig,
    // one batch-creation section at a time
    creating: Mutex<()>,
}

impl BatchBuilder {
    pub fn new(store: Arc<dyn QueryStore>, merkle: MerkleTree, config: BatchConfig) -> Self {
        Self {
            store,
            merkle,
            config,
            creating: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn QueryStore> {
        &self.store
    }

    pub fn merkle(&self) -> &MerkleTree {
        &self.merkle
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Size or age trigger, whichever fires first.
    pub fn should_batch(&self, model_id: u32, now: u64) -> Result<bool> {
        let count = self.store.unbatched_count(model_id)?;
        if count == 0 {
            return Ok(false);
        }
        if count >= self.config.size_threshold as u64 {
            return Ok(true);
        }
        Ok(self
            .store
            .oldest_unbatched_timestamp(model_id)?
            .is_some_and(|oldest| now.saturating_sub(oldest) >= self.config.age_threshold_ms))
    }

    /// Turn the oldest unbatched window of `model_id` into a batch.
    ///
    /// `Ok(None)` when there is nothing to batch or a concurrent attempt already
    /// wrote the same batch. A gap in the window, or between the window and the
    /// previous batch, aborts the attempt with `SequenceGap`.
    pub async fn create_batch(&self, model_id: u32, now: u64) -> Result<Option<Batch>> {
        let _guard = self.creating.lock().await;

        let records = self.store.unbatched(model_id, self.config.max_window)?;
        if records.is_empty() {
            return Ok(None);
        }
        let seq_nums: Vec<u64> = records.iter().map(|r| r.seq_num).collect();
        let (start, end) = validate_contiguity(&seq_nums).inspect_err(|e| {
            tracing::error!(model_id, error = %e, "refusing to batch a broken window");
        })?;

        let expected = self.store.last_batched_seq(model_id)? + 1;
        if start != expected {
            let e = FairlogError::SequenceGap {
                expected,
                found: start,
            };
            tracing::error!(model_id, error = %e, "window does not continue the previous batch");
            return Err(e);
        }

        let root = self.merkle.root_of_records(&records)?;
        let batch = Batch {
            id: Batch::id_for(model_id, start, end),
            model_id,
            start_seq: start,
            end_seq: end,
            merkle_root: root,
            record_count: records.len() as u64,
            tx_hash: None,
            created_at: now,
            committed_at: None,
        };

        match self.store.insert_batch_with_assignment(&batch, &seq_nums) {
            Ok(()) => {}
            Err(FairlogError::BatchAlreadyExists(id)) => {
                tracing::warn!(batch_id = %id, "batch already exists, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            batch_id = %batch.id,
            model_id,
            start,
            end,
            root = %root.short(),
            "batch created"
        );
        Ok(Some(batch))
    }

    /// Submit one batch with bounded exponential backoff and record the tx hash.
    /// On final failure the batch stays uncommitted for the next sweep.
    pub async fn submit_batch(&self, ledger: &dyn Ledger, batch: &Batch) -> Result<TxHash> {
        let commitment = BatchCommitment::from(batch);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match ledger.commit_batch(commitment.clone()).await {
                Ok(tx) => {
                    self.store.mark_committed(&batch.id, &tx, now_ms())?;
                    tracing::info!(batch_id = %batch.id, tx = %tx, attempt, "batch committed");
                    return Ok(tx);
                }
                Err(e) if e.is_fatal() || attempt >= self.config.submit_max_attempts => {
                    tracing::warn!(batch_id = %batch.id, attempt, error = %e, "giving up on ledger submission");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self
                        .config
                        .submit_base_backoff_ms
                        .saturating_mul(1u64 << (attempt - 1).min(16));
                    tracing::warn!(batch_id = %batch.id, attempt, delay_ms = delay, error = %e, "ledger submission failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    /// Submit every batch whose `committed_at` is still unset. Returns how many landed.
    pub async fn submit_pending(&self, ledger: &dyn Ledger) -> Result<usize> {
        let mut committed = 0;
        for batch in self.store.uncommitted_batches()? {
            if self.submit_batch(ledger, &batch).await.is_ok() {
                committed += 1;
            }
        }
        Ok(committed)
    }

    /// Batch every model whose trigger fires, then push pending roots.
    pub async fn sweep(&self, ledger: &dyn Ledger, now: u64) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for model_id in self.store.models_with_backlog()? {
            while self.should_batch(model_id, now)? {
                match self.create_batch(model_id, now).await {
                    Ok(Some(batch)) => report.created.push(batch),
                    Ok(None) => break,
                    Err(e) if e.is_fatal() => {
                        // the model stays blocked until an operator looks at it
                        report.failed_models.push(model_id);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        report.committed = self.submit_pending(ledger).await?;
        tracing::debug!(
            created = report.created.len(),
            committed = report.committed,
            "sweep finished"
        );
        Ok(report)
    }

    /// Fresh inclusion proof for `seq_num`, rebuilt from the stored range of
    /// the batch that owns it. `None` when no batch covers it yet.
    pub fn proof_for(&self, model_id: u32, seq_num: u64) -> Result<Option<ProofResponse>> {
        let Some(batch) = self.store.batch_for_seq(model_id, seq_num)? else {
            return Ok(None);
        };
        let leaves = self.merkle.leaves(&self.batch_records(&batch)?);
        let index = (seq_num - batch.start_seq) as usize;
        let bundle = self.merkle.build_proof(&leaves, index)?;
        Ok(Some(ProofResponse {
            version: PROOF_RESPONSE_VERSION,
            model_id,
            seq_num,
            batch_id: batch.id,
            root: bundle.root,
            index: bundle.index,
            proof: bundle.proof,
        }))
    }

    /// Recompute a batch's root from stored records. Equal to the stored root
    /// unless the query log was altered after batching.
    pub fn rebuild_root(&self, batch: &Batch) -> Result<Digest> {
        self.merkle.root_of_records(&self.batch_records(batch)?)
    }

    fn batch_records(&self, batch: &Batch) -> Result<Vec<QueryRecord>> {
        let records = self
            .store
            .records_in_range(batch.model_id, batch.start_seq, batch.end_seq)?;
        if records.len() as u64 != batch.record_count {
            return Err(FairlogError::Storage(format!(
                "batch '{}' expects {} records, found {}",
                batch.id,
                batch.record_count,
                records.len()
            )));
        }
        Ok(records)
    }
}
