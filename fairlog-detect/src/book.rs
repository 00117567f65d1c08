use fairlog_core::digest::Digest;
use fairlog_core::error::{FairlogError, Result};
use fairlog_core::record::ProofStep;
use fairlog_itmac::receipt::SignedReceipt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptStatus {
    Pending,
    /// A committed batch covers the receipt but its proof has not been checked yet.
    Batched,
    Verified,
    FraudDetected,
    Disputed,
    /// Signature does not verify under the pinned provider key. Never
    /// classified or disputed.
    Rejected,
}

impl ReceiptStatus {
    /// Still waiting on the ledger or the proof provider.
    pub fn is_open(self) -> bool {
        matches!(self, ReceiptStatus::Pending | ReceiptStatus::Batched)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FraudKind {
    NonInclusion,
    FraudulentInclusion,
}

/// What a fraudulent-inclusion dispute needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudEvidence {
    pub ledger_batch_id: u64,
    pub leaf_hash: Digest,
    /// Proof the provider served, empty when it served none.
    pub proof: Vec<ProofStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldReceipt {
    pub receipt: SignedReceipt,
    pub status: ReceiptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraud: Option<FraudKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_batch_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<FraudEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispute_tx: Option<String>,
}

impl HeldReceipt {
    pub fn new(receipt: SignedReceipt) -> Self {
        Self {
            receipt,
            status: ReceiptStatus::Pending,
            fraud: None,
            ledger_batch_id: None,
            evidence: None,
            dispute_tx: None,
        }
    }

    pub fn key(&self) -> String {
        receipt_key(self.receipt.model_id(), self.receipt.seq_num())
    }
}

pub fn receipt_key(model_id: u32, seq_num: u64) -> String {
    format!("{model_id}:{seq_num}")
}

/// Client-held receipts, kept as pretty JSON on disk. The file is replaced
/// atomically on every save.
#[derive(Debug, Default)]
pub struct ReceiptBook {
    path: Option<PathBuf>,
    entries: BTreeMap<String, HeldReceipt>,
}

impl ReceiptBook {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the book at `path`, or start an empty one there.
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                FairlogError::Malformed(format!("receipt book {}: {e}", path.display()))
            })?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// `false` if a receipt for the same model and seq is already held.
    pub fn insert(&mut self, receipt: SignedReceipt) -> bool {
        let held = HeldReceipt::new(receipt);
        let key = held.key();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, held);
        true
    }

    pub fn get(&self, key: &str) -> Option<&HeldReceipt> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut HeldReceipt> {
        self.entries.get_mut(key)
    }

    pub fn update(&mut self, key: &str, f: impl FnOnce(&mut HeldReceipt)) -> Result<()> {
        let held = self
            .entries
            .get_mut(key)
            .ok_or_else(|| FairlogError::Malformed(format!("no receipt '{key}'")))?;
        f(held);
        Ok(())
    }

    /// Keys of Pending/Batched receipts for one model, in seq order.
    pub fn pending_for_model(&self, model_id: u32) -> Vec<String> {
        let mut held: Vec<&HeldReceipt> = self
            .entries
            .values()
            .filter(|h| h.receipt.model_id() == model_id && h.status.is_open())
            .collect();
        held.sort_by_key(|h| h.receipt.seq_num());
        held.into_iter().map(HeldReceipt::key).collect()
    }

    pub fn pending_models(&self) -> BTreeSet<u32> {
        self.entries
            .values()
            .filter(|h| h.status.is_open())
            .map(|h| h.receipt.model_id())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeldReceipt> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&self.entries)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
