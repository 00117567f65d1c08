use crate::book::{FraudEvidence, FraudKind, HeldReceipt, ReceiptBook, ReceiptStatus};
use crate::source::{ProofFetch, ProofSource};
use fairlog_core::config::DetectorConfig;
use fairlog_core::error::{FairlogError, Result};
use fairlog_itmac::receipt::scaled_prediction;
use fairlog_ledger::{
    DisputeResolution, FraudulentInclusionDispute, Ledger, LedgerBatch, NonInclusionDispute,
};
use fairlog_verify::InclusionVerifier;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A receipt whose status moved during a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub key: String,
    pub seq_num: u64,
    pub status: ReceiptStatus,
    pub fraud: Option<FraudKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisputeRequest {
    NonInclusion(NonInclusionDispute),
    FraudulentInclusion(FraudulentInclusionDispute),
}

/// Client-side watcher. Compares held receipts against ledger commitments
/// and fresh proofs, and files disputes for what does not match.
///
/// Only receipts that verify under the pinned provider key count as
/// evidence. Anything else is marked `Rejected` before it is classified.
pub struct FraudDetector {
    book: ReceiptBook,
    source: Arc<dyn ProofSource>,
    ledger: Arc<dyn Ledger>,
    provider_key: [u8; 32],
    verifier: InclusionVerifier,
    config: DetectorConfig,
}

impl FraudDetector {
    pub fn new(
        book: ReceiptBook,
        source: Arc<dyn ProofSource>,
        ledger: Arc<dyn Ledger>,
        provider_key: [u8; 32],
        config: DetectorConfig,
    ) -> Self {
        Self {
            book,
            source,
            ledger,
            provider_key,
            verifier: InclusionVerifier::default(),
            config,
        }
    }

    /// Use a non-default leaf hash. Must match the provider's.
    pub fn with_verifier(mut self, verifier: InclusionVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn book(&self) -> &ReceiptBook {
        &self.book
    }

    pub fn book_mut(&mut self) -> &mut ReceiptBook {
        &mut self.book
    }

    pub fn into_book(self) -> ReceiptBook {
        self.book
    }

    /// Classify every open receipt of the batch's model.
    ///
    /// In range: verify a fresh proof against the committed root. Out of range
    /// and past the grace period: look for any other batch that covers it, and
    /// flag non-inclusion if there is none. Otherwise leave it pending.
    pub async fn on_batch_committed(&mut self, batch: &LedgerBatch, now: u64) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        let mut model_batches: Option<Vec<LedgerBatch>> = None;

        for key in self.book.pending_for_model(batch.model_id) {
            let Some(held) = self.book.get(&key) else { continue };
            let seq = held.receipt.seq_num();

            let covering = if batch.contains(seq) {
                Some(batch.clone())
            } else if self.past_grace(held, now) {
                if model_batches.is_none() {
                    model_batches = Some(self.ledger.batches_for_model(batch.model_id).await?);
                }
                model_batches
                    .as_ref()
                    .and_then(|bs| bs.iter().find(|b| b.contains(seq)).cloned())
            } else {
                continue;
            };

            if let Some(outcome) = self.settle(&key, covering.as_ref()).await? {
                outcomes.push(outcome);
            }
        }

        self.book.save()?;
        Ok(outcomes)
    }

    /// Re-check every open receipt against all ledger batches of its model.
    pub async fn check_all(&mut self, now: u64) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        let mut by_model: HashMap<u32, Vec<LedgerBatch>> = HashMap::new();
        for model_id in self.book.pending_models() {
            by_model.insert(model_id, self.ledger.batches_for_model(model_id).await?);
        }

        for (model_id, batches) in &by_model {
            for key in self.book.pending_for_model(*model_id) {
                let Some(held) = self.book.get(&key) else { continue };
                let seq = held.receipt.seq_num();
                let covering = batches.iter().find(|b| b.contains(seq));
                if covering.is_none() && !self.past_grace(held, now) {
                    continue;
                }
                if let Some(outcome) = self.settle(&key, covering).await? {
                    outcomes.push(outcome);
                }
            }
        }

        self.book.save()?;
        Ok(outcomes)
    }

    /// Consume ledger commitments until the stream closes.
    pub async fn run(&mut self, mut events: broadcast::Receiver<LedgerBatch>) -> Result<()> {
        loop {
            match events.recv().await {
                Ok(batch) => {
                    let now = fairlog_core::now_ms();
                    match self.on_batch_committed(&batch, now).await {
                        Ok(outcomes) => tracing::debug!(
                            ledger_batch_id = batch.ledger_batch_id,
                            changed = outcomes.len(),
                            "processed commitment"
                        ),
                        Err(e) => tracing::error!(
                            ledger_batch_id = batch.ledger_batch_id,
                            error = %e,
                            "failed to process commitment"
                        ),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "ledger event stream lagged, re-checking everything");
                    if let Err(e) = self.check_all(fairlog_core::now_ms()).await {
                        tracing::error!(error = %e, "re-check after lag failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// The ledger call a fraud-detected receipt warrants. `None` for any other status.
    pub fn build_dispute(held: &HeldReceipt) -> Option<DisputeRequest> {
        if held.status != ReceiptStatus::FraudDetected {
            return None;
        }
        let r = &held.receipt;
        match held.fraud? {
            FraudKind::NonInclusion => Some(DisputeRequest::NonInclusion(NonInclusionDispute {
                model_id: r.model_id(),
                seq_num: r.seq_num(),
                timestamp: r.record.timestamp,
                features_hash: r.features_hash,
                sensitive_attr: r.record.sensitive_attr,
                prediction: scaled_prediction(r.record.prediction),
                provider_signature: r.provider_signature.clone(),
            })),
            FraudKind::FraudulentInclusion => {
                let ev = held.evidence.as_ref()?;
                Some(DisputeRequest::FraudulentInclusion(FraudulentInclusionDispute::new(
                    ev.ledger_batch_id,
                    r.seq_num(),
                    ev.leaf_hash,
                    &ev.proof,
                )))
            }
        }
    }

    /// File the dispute for one receipt. Acceptance moves it to `Disputed`.
    pub async fn submit_dispute(&mut self, key: &str) -> Result<DisputeResolution> {
        let held = self
            .book
            .get(key)
            .ok_or_else(|| FairlogError::Malformed(format!("no receipt '{key}'")))?;
        if !self.authentic(held) {
            self.reject(key)?;
            self.book.save()?;
            return Err(FairlogError::Protocol(format!(
                "receipt '{key}' is not signed by the provider"
            )));
        }
        let request = Self::build_dispute(held).ok_or_else(|| {
            FairlogError::Protocol(format!("receipt '{key}' is {:?}, nothing to dispute", held.status))
        })?;

        let resolution = match request {
            DisputeRequest::NonInclusion(d) => self.ledger.dispute_non_inclusion(d).await?,
            DisputeRequest::FraudulentInclusion(d) => {
                self.ledger.dispute_fraudulent_inclusion(d).await?
            }
        };

        if resolution.accepted {
            let tx = resolution.tx_hash.clone();
            self.book.update(key, |h| {
                h.status = ReceiptStatus::Disputed;
                h.dispute_tx = Some(tx);
            })?;
            self.book.save()?;
            tracing::info!(receipt = key, tx = %resolution.tx_hash, "dispute accepted");
        } else {
            tracing::warn!(receipt = key, reason = ?resolution.reason, "dispute rejected");
        }
        Ok(resolution)
    }

    /// Dispute every fraud-detected receipt. Receipts whose signature no
    /// longer verifies are rejected instead of filed.
    pub async fn dispute_all(&mut self) -> Result<Vec<(String, DisputeResolution)>> {
        let flagged: Vec<(String, bool)> = self
            .book
            .iter()
            .filter(|h| h.status == ReceiptStatus::FraudDetected)
            .map(|h| (h.key(), self.authentic(h)))
            .collect();
        let mut keys = Vec::with_capacity(flagged.len());
        let mut forged = false;
        for (key, authentic) in flagged {
            if authentic {
                keys.push(key);
            } else {
                self.reject(&key)?;
                forged = true;
            }
        }
        if forged {
            self.book.save()?;
        }

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let resolution = self.submit_dispute(&key).await?;
            out.push((key, resolution));
        }
        Ok(out)
    }

    fn authentic(&self, held: &HeldReceipt) -> bool {
        held.receipt.verify(&self.provider_key)
    }

    fn reject(&mut self, key: &str) -> Result<Option<Outcome>> {
        tracing::warn!(receipt = key, "receipt signature does not verify, rejecting");
        self.mark(key, ReceiptStatus::Rejected, None, None, None)
    }

    fn past_grace(&self, held: &HeldReceipt, now: u64) -> bool {
        now.saturating_sub(held.receipt.record.timestamp) >= self.config.grace_period_ms
    }

    /// Resolve one receipt against the batch covering it, or against no batch.
    async fn settle(&mut self, key: &str, covering: Option<&LedgerBatch>) -> Result<Option<Outcome>> {
        let Some(held) = self.book.get(key) else {
            return Ok(None);
        };
        if !self.authentic(held) {
            return self.reject(key);
        }
        let record = held.receipt.record.clone();
        let seq = record.seq_num;

        let Some(batch) = covering else {
            tracing::warn!(model_id = record.model_id, seq_num = seq, "receipt omitted from every batch");
            return self.mark(key, ReceiptStatus::FraudDetected, Some(FraudKind::NonInclusion), None, None);
        };

        let leaf_hash = self.verifier.leaf_of(&record);
        let proof = match self.source.fetch_proof(record.model_id, seq).await {
            Err(e) => {
                tracing::warn!(seq_num = seq, error = %e, "proof fetch failed, will retry");
                return self.mark(key, ReceiptStatus::Batched, None, Some(batch.ledger_batch_id), None);
            }
            Ok(ProofFetch::Found(p)) if p.model_id == record.model_id && p.seq_num == seq => Some(p.proof),
            Ok(ProofFetch::Found(p)) => {
                tracing::warn!(seq_num = seq, served = p.seq_num, "provider served a proof for another query");
                None
            }
            Ok(ProofFetch::Missing) => None,
            Ok(ProofFetch::Malformed(why)) => {
                tracing::warn!(seq_num = seq, reason = %why, "malformed proof");
                None
            }
        };

        // the ledger's root is the one that counts, not whatever the provider echoes
        if let Some(steps) = &proof {
            if self.verifier.verify_record(&record, &batch.merkle_root, steps) {
                tracing::debug!(seq_num = seq, ledger_batch_id = batch.ledger_batch_id, "receipt verified");
                return self.mark(key, ReceiptStatus::Verified, None, Some(batch.ledger_batch_id), None);
            }
        }

        tracing::warn!(
            model_id = record.model_id,
            seq_num = seq,
            ledger_batch_id = batch.ledger_batch_id,
            "committed root does not contain the receipt"
        );
        let evidence = FraudEvidence {
            ledger_batch_id: batch.ledger_batch_id,
            leaf_hash,
            proof: proof.unwrap_or_default(),
        };
        self.mark(
            key,
            ReceiptStatus::FraudDetected,
            Some(FraudKind::FraudulentInclusion),
            Some(batch.ledger_batch_id),
            Some(evidence),
        )
    }

    fn mark(
        &mut self,
        key: &str,
        status: ReceiptStatus,
        fraud: Option<FraudKind>,
        ledger_batch_id: Option<u64>,
        evidence: Option<FraudEvidence>,
    ) -> Result<Option<Outcome>> {
        let mut seq_num = 0;
        let mut changed = false;
        self.book.update(key, |h| {
            seq_num = h.receipt.seq_num();
            changed = h.status != status;
            h.status = status;
            h.fraud = fraud;
            if ledger_batch_id.is_some() {
                h.ledger_batch_id = ledger_batch_id;
            }
            h.evidence = evidence;
        })?;
        Ok(changed.then(|| Outcome {
            key: key.to_string(),
            seq_num,
            status,
            fraud,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LocalProofSource;
    use async_trait::async_trait;
    use fairlog_batch::{BatchBuilder, QueryStore, SqliteStore};
    use fairlog_core::config::BatchConfig;
    use fairlog_core::record::{NewQuery, QueryRecord};
    use fairlog_itmac::provider::Provider;
    use fairlog_ledger::MemoryLedger;
    use fairlog_verify::keys::ProviderKeys;
    use fairlog_verify::merkle::MerkleTree;

    struct Harness {
        provider: Provider,
        store: Arc<SqliteStore>,
        builder: Arc<BatchBuilder>,
        ledger: Arc<MemoryLedger>,
    }

    fn harness(n: u64) -> Harness {
        let provider = Provider::new(ProviderKeys::generate().unwrap());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        for i in 1..=n {
            store
                .append(NewQuery {
                    query_id: format!("q-{i}"),
                    model_id: 1,
                    features: vec![i as f32, 0.25],
                    sensitive_attr: (i % 2) as u32,
                    prediction: (i % 2) as f32,
                    timestamp: 10_000 + i,
                })
                .unwrap();
        }
        let config = BatchConfig {
            size_threshold: 4,
            max_window: 4,
            submit_base_backoff_ms: 1,
            ..Default::default()
        };
        let builder = Arc::new(BatchBuilder::new(store.clone(), MerkleTree::new(), config));
        let ledger = Arc::new(
            MemoryLedger::new(0).with_provider_key(provider.keys().verifying_key().to_bytes()),
        );
        Harness {
            provider,
            store,
            builder,
            ledger,
        }
    }

    impl Harness {
        fn provider_key(&self) -> [u8; 32] {
            self.provider.keys().verifying_key().to_bytes()
        }

        fn record(&self, seq: u64) -> QueryRecord {
            self.store.record(1, seq).unwrap().unwrap()
        }

        fn book(&self, seqs: impl IntoIterator<Item = u64>) -> ReceiptBook {
            let mut book = ReceiptBook::in_memory();
            for seq in seqs {
                book.insert(self.provider.sign_receipt(&format!("q-{seq}"), self.record(seq)));
            }
            book
        }

        fn detector(&self, book: ReceiptBook) -> FraudDetector {
            FraudDetector::new(
                book,
                Arc::new(LocalProofSource::new(self.builder.clone())),
                self.ledger.clone(),
                self.provider_key(),
                DetectorConfig {
                    grace_period_ms: 1_000,
                    ..Default::default()
                },
            )
        }

        async fn commit_first_batch(&self) -> LedgerBatch {
            let batch = self.builder.create_batch(1, 20_000).await.unwrap().unwrap();
            self.builder.submit_batch(self.ledger.as_ref(), &batch).await.unwrap();
            self.ledger.batches().pop().unwrap()
        }
    }

    struct Unreachable;

    #[async_trait]
    impl ProofSource for Unreachable {
        async fn fetch_proof(&self, _: u32, _: u64) -> Result<ProofFetch> {
            Err(FairlogError::ProofSource("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn honest_batch_verifies_every_receipt() {
        let h = harness(4);
        let mut detector = h.detector(h.book(1..=4));
        let lb = h.commit_first_batch().await;

        let outcomes = detector.on_batch_committed(&lb, 20_000).await.unwrap();
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|o| o.status == ReceiptStatus::Verified && o.fraud.is_none()));
        let held = detector.book().get("1:3").unwrap();
        assert_eq!(held.ledger_batch_id, Some(lb.ledger_batch_id));
        assert!(FraudDetector::build_dispute(held).is_none());

        // nothing left to classify
        assert!(detector.on_batch_committed(&lb, 20_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn altered_receipt_is_fraudulent_inclusion_and_disputed() {
        let h = harness(4);
        let mut book = h.book([1, 2, 4]);
        // the client was told one thing, the log says another
        let mut told = h.record(3);
        told.prediction = 1.0 - told.prediction;
        book.insert(h.provider.sign_receipt("q-3", told));
        let mut detector = h.detector(book);
        let lb = h.commit_first_batch().await;

        let outcomes = detector.on_batch_committed(&lb, 20_000).await.unwrap();
        let flagged: Vec<_> = outcomes
            .iter()
            .filter(|o| o.status == ReceiptStatus::FraudDetected)
            .collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].seq_num, 3);
        assert_eq!(flagged[0].fraud, Some(FraudKind::FraudulentInclusion));

        let held = detector.book().get("1:3").unwrap();
        let evidence = held.evidence.as_ref().unwrap();
        assert_eq!(evidence.ledger_batch_id, lb.ledger_batch_id);
        assert_eq!(evidence.proof.len(), 2);

        let resolution = detector.submit_dispute("1:3").await.unwrap();
        assert!(resolution.accepted, "{:?}", resolution.reason);
        let held = detector.book().get("1:3").unwrap();
        assert_eq!(held.status, ReceiptStatus::Disputed);
        assert_eq!(held.dispute_tx.as_deref(), Some(resolution.tx_hash.as_str()));
    }

    #[tokio::test]
    async fn omitted_receipt_waits_out_the_grace_period() {
        let h = harness(5);
        let mut detector = h.detector(h.book(1..=5));
        let lb = h.commit_first_batch().await;
        assert_eq!(lb.seq_num_end, 4);

        let early = detector.on_batch_committed(&lb, 10_006).await.unwrap();
        assert_eq!(early.len(), 4);
        assert_eq!(detector.book().get("1:5").unwrap().status, ReceiptStatus::Pending);

        let late = detector.check_all(10_005 + 1_000).await.unwrap();
        assert_eq!(
            late,
            vec![Outcome {
                key: "1:5".into(),
                seq_num: 5,
                status: ReceiptStatus::FraudDetected,
                fraud: Some(FraudKind::NonInclusion),
            }]
        );

        let filed = detector.dispute_all().await.unwrap();
        assert_eq!(filed.len(), 1);
        assert!(filed[0].1.accepted, "{:?}", filed[0].1.reason);
        assert_eq!(detector.book().get("1:5").unwrap().status, ReceiptStatus::Disputed);
    }

    #[tokio::test]
    async fn later_batch_clears_an_overdue_receipt() {
        let h = harness(8);
        let mut detector = h.detector(h.book([6]));
        let first = h.commit_first_batch().await;
        let second = h.commit_first_batch().await;
        assert_eq!((second.seq_num_start, second.seq_num_end), (5, 8));

        // the event for the first batch arrives late, after the second is on the ledger
        let outcomes = detector.on_batch_committed(&first, 50_000).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, ReceiptStatus::Verified);
        assert_eq!(
            detector.book().get("1:6").unwrap().ledger_batch_id,
            Some(second.ledger_batch_id)
        );
    }

    #[tokio::test]
    async fn transport_failure_leaves_receipt_open() {
        let h = harness(4);
        let lb = h.commit_first_batch().await;
        let mut detector = FraudDetector::new(
            h.book(1..=4),
            Arc::new(Unreachable),
            h.ledger.clone(),
            h.provider_key(),
            DetectorConfig::default(),
        );

        let outcomes = detector.on_batch_committed(&lb, 20_000).await.unwrap();
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|o| o.status == ReceiptStatus::Batched));
        assert_eq!(detector.book().pending_for_model(1).len(), 4);
        assert!(detector.dispute_all().await.unwrap().is_empty());
        assert!(detector.submit_dispute("1:1").await.is_err());
    }

    #[tokio::test]
    async fn run_drains_the_stream() {
        let h = harness(4);
        let mut detector = h.detector(h.book(1..=4));
        let lb = h.commit_first_batch().await;

        let (tx, rx) = broadcast::channel(4);
        tx.send(lb).unwrap();
        drop(tx);
        detector.run(rx).await.unwrap();
        assert!(detector.book().iter().all(|r| r.status == ReceiptStatus::Verified));
    }

    #[tokio::test]
    async fn unsigned_receipts_are_rejected_not_flagged() {
        let h = harness(4);
        let mut book = h.book([1, 3, 4]);
        // edited on the client side after the provider signed it
        let mut edited = h.provider.sign_receipt("q-2", h.record(2));
        edited.record.prediction = 1.0 - edited.record.prediction;
        book.insert(edited);
        let mut detector = h.detector(book);
        let lb = h.commit_first_batch().await;

        let outcomes = detector.on_batch_committed(&lb, 20_000).await.unwrap();
        assert_eq!(outcomes.len(), 4);
        let held = detector.book().get("1:2").unwrap();
        assert_eq!(held.status, ReceiptStatus::Rejected);
        assert_eq!(held.fraud, None);
        assert!(FraudDetector::build_dispute(held).is_none());
        assert!(detector.dispute_all().await.unwrap().is_empty());
        assert!(h.ledger.disputes().is_empty());
    }

    #[tokio::test]
    async fn receipt_tampered_after_flagging_is_not_disputed() {
        let h = harness(5);
        let mut detector = h.detector(h.book(1..=5));
        let lb = h.commit_first_batch().await;
        detector.on_batch_committed(&lb, 10_005 + 1_000).await.unwrap();
        assert_eq!(detector.book().get("1:5").unwrap().status, ReceiptStatus::FraudDetected);

        detector
            .book_mut()
            .update("1:5", |held| held.receipt.record.timestamp += 1)
            .unwrap();
        assert!(detector.submit_dispute("1:5").await.is_err());
        assert_eq!(detector.book().get("1:5").unwrap().status, ReceiptStatus::Rejected);
        assert!(detector.dispute_all().await.unwrap().is_empty());
        assert!(h.ledger.disputes().is_empty());
    }

    /// Serves commitments but cannot list a model's history.
    struct NoHistory(Arc<MemoryLedger>);

    #[async_trait]
    impl Ledger for NoHistory {
        async fn commit_batch(&self, c: fairlog_ledger::BatchCommitment) -> Result<fairlog_ledger::TxHash> {
            self.0.commit_batch(c).await
        }

        async fn get_batch(&self, id: u64) -> Result<Option<LedgerBatch>> {
            self.0.get_batch(id).await
        }

        async fn batches_for_model(&self, _: u32) -> Result<Vec<LedgerBatch>> {
            Err(FairlogError::Ledger("history unavailable".into()))
        }

        async fn dispute_non_inclusion(&self, d: NonInclusionDispute) -> Result<DisputeResolution> {
            self.0.dispute_non_inclusion(d).await
        }

        async fn dispute_fraudulent_inclusion(
            &self,
            d: FraudulentInclusionDispute,
        ) -> Result<DisputeResolution> {
            self.0.dispute_fraudulent_inclusion(d).await
        }
    }

    #[tokio::test]
    async fn failed_recheck_after_lag_keeps_running() {
        let h = harness(4);
        let lb = h.commit_first_batch().await;
        let mut detector = FraudDetector::new(
            h.book(1..=4),
            Arc::new(LocalProofSource::new(h.builder.clone())),
            Arc::new(NoHistory(h.ledger.clone())),
            h.provider_key(),
            DetectorConfig::default(),
        );

        // capacity 1: the first send is overwritten, so the receiver lags
        let (tx, rx) = broadcast::channel(1);
        tx.send(lb.clone()).unwrap();
        tx.send(lb).unwrap();
        drop(tx);
        detector.run(rx).await.unwrap();
        assert!(detector.book().iter().all(|r| r.status == ReceiptStatus::Verified));
    }
}
