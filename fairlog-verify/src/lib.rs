pub mod encode;
pub mod keys;
pub mod merkle;
pub mod signature;

use crate::merkle::MerkleTree;
use fairlog_core::digest::Digest;
use fairlog_core::record::{ProofStep, QueryRecord};

/// Checks a locally held record against a committed root.
pub struct InclusionVerifier {
    merkle: MerkleTree,
}

impl InclusionVerifier {
    pub fn new(merkle: MerkleTree) -> Self {
        Self { merkle }
    }

    pub fn leaf_of(&self, record: &QueryRecord) -> Digest {
        self.merkle.leaf(record)
    }

    /// Recompute the leaf from `record` and fold `proof` up to `root`.
    pub fn verify_record(&self, record: &QueryRecord, root: &Digest, proof: &[ProofStep]) -> bool {
        let leaf = self.merkle.leaf(record);
        self.merkle.verify_proof(&leaf, root, proof)
    }
}

impl Default for InclusionVerifier {
    fn default() -> Self {
        Self::new(MerkleTree::new())
    }
}
