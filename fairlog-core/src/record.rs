use crate::digest::Digest;
use serde::{Deserialize, Serialize};

/// One inference, as sequenced by the provider. Immutable once it has a seq number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub seq_num: u64,
    pub model_id: u32,
    pub features: Vec<f32>,
    pub sensitive_attr: u32,
    pub prediction: f32,
    /// Unix milliseconds.
    pub timestamp: u64,
}

/// A query before the sequencer has numbered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQuery {
    pub query_id: String,
    pub model_id: u32,
    pub features: Vec<f32>,
    pub sensitive_attr: u32,
    pub prediction: f32,
    pub timestamp: u64,
}

impl NewQuery {
    pub fn into_record(self, seq_num: u64) -> QueryRecord {
        QueryRecord {
            seq_num,
            model_id: self.model_id,
            features: self.features,
            sensitive_attr: self.sensitive_attr,
            prediction: self.prediction,
            timestamp: self.timestamp,
        }
    }
}

/// A contiguous, committed range of one model's sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub model_id: u32,
    pub start_seq: u64,
    pub end_seq: u64,
    pub merkle_root: Digest,
    pub record_count: u64,
    pub tx_hash: Option<String>,
    pub created_at: u64,
    pub committed_at: Option<u64>,
}

impl Batch {
    pub fn id_for(model_id: u32, start_seq: u64, end_seq: u64) -> String {
        format!("{model_id}:{start_seq}-{end_seq}")
    }

    pub fn contains(&self, seq_num: u64) -> bool {
        seq_num >= self.start_seq && seq_num <= self.end_seq
    }

    pub fn is_committed(&self) -> bool {
        self.committed_at.is_some()
    }

    /// `record_count == end - start + 1`
    pub fn is_well_formed(&self) -> bool {
        self.end_seq >= self.start_seq && self.record_count == self.end_seq - self.start_seq + 1
    }
}

/// Which side of the running hash the sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Right,
}

impl Position {
    /// Ledger encoding: 0 = left, 1 = right.
    pub fn as_u8(self) -> u8 {
        match self {
            Position::Left => 0,
            Position::Right => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Digest,
    pub position: Position,
}

/// Proof Provider payload for `GET /proof/{seq}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofResponse {
    pub version: u32,
    pub model_id: u32,
    pub seq_num: u64,
    pub batch_id: String,
    pub root: Digest,
    pub index: usize,
    pub proof: Vec<ProofStep>,
}

pub const PROOF_RESPONSE_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(start: u64, end: u64, count: u64) -> Batch {
        Batch {
            id: Batch::id_for(3, start, end),
            model_id: 3,
            start_seq: start,
            end_seq: end,
            merkle_root: Digest::ZERO,
            record_count: count,
            tx_hash: None,
            created_at: 0,
            committed_at: None,
        }
    }

    #[test]
    fn batch_range_and_count() {
        let b = batch(5, 8, 4);
        assert_eq!(b.id, "3:5-8");
        assert!(b.contains(5) && b.contains(8));
        assert!(!b.contains(4) && !b.contains(9));
        assert!(b.is_well_formed());
        assert!(!batch(5, 8, 3).is_well_formed());
        assert!(!b.is_committed());
    }

    #[test]
    fn position_wire_format() {
        let step = ProofStep {
            sibling: Digest::ZERO,
            position: Position::Left,
        };
        let json = serde_json::to_value(step).unwrap();
        assert_eq!(json["position"], "left");
        assert_eq!(Position::Right.as_u8(), 1);
    }
}
