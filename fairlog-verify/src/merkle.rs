use crate::encode::{
    Digester, Sha256Digester, SharedDigester, digester_by_name, hash_node, leaf_digest,
};
use fairlog_core::config::MerkleConfig;
use fairlog_core::digest::Digest;
use fairlog_core::error::{FairlogError, Result};
use fairlog_core::record::{Position, ProofStep, QueryRecord};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Binary Merkle tree over leaf digests. Odd levels duplicate their last node.
#[derive(Clone)]
pub struct MerkleTree {
    digester: SharedDigester,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofBundle {
    pub root: Digest,
    pub index: usize,
    pub proof: Vec<ProofStep>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self {
            digester: Arc::new(Sha256Digester),
        }
    }

    pub fn with_digester(digester: SharedDigester) -> Self {
        Self { digester }
    }

    /// Tree over the configured `merkle.digest`.
    pub fn from_config(config: &MerkleConfig) -> Result<Self> {
        let digester = digester_by_name(&config.digest).ok_or_else(|| {
            FairlogError::Config(format!("unknown merkle digest '{}'", config.digest))
        })?;
        Ok(Self::with_digester(digester))
    }

    pub fn digester(&self) -> &dyn Digester {
        self.digester.as_ref()
    }

    pub fn leaf(&self, record: &QueryRecord) -> Digest {
        leaf_digest(self.digester(), record)
    }

    pub fn leaves(&self, records: &[QueryRecord]) -> Vec<Digest> {
        records.iter().map(|r| self.leaf(r)).collect()
    }

    pub fn build_root(&self, leaves: &[Digest]) -> Result<Digest> {
        if leaves.is_empty() {
            return Err(FairlogError::EmptyTree);
        }

        let mut level = leaves.to_vec();
        while level.len() > 1 {
            level = self.next_level(&level);
        }
        Ok(level[0])
    }

    pub fn build_proof(&self, leaves: &[Digest], index: usize) -> Result<ProofBundle> {
        if leaves.is_empty() {
            return Err(FairlogError::EmptyTree);
        }
        if index >= leaves.len() {
            return Err(FairlogError::IndexOutOfRange {
                index,
                len: leaves.len(),
            });
        }

        let mut level = leaves.to_vec();
        let mut idx = index;
        let mut proof = Vec::new();

        while level.len() > 1 {
            let current = level[idx];
            let step = if idx % 2 == 0 {
                // right neighbour, or ourselves when we are the odd node out
                ProofStep {
                    sibling: level.get(idx + 1).copied().unwrap_or(current),
                    position: Position::Right,
                }
            } else {
                ProofStep {
                    sibling: level[idx - 1],
                    position: Position::Left,
                }
            };
            proof.push(step);

            level = self.next_level(&level);
            idx /= 2;
        }

        Ok(ProofBundle {
            root: level[0],
            index,
            proof,
        })
    }

    /// Fold the proof from `leaf` upward and compare with `root`.
    /// A mismatch is an expected outcome, not an error.
    pub fn verify_proof(&self, leaf: &Digest, root: &Digest, proof: &[ProofStep]) -> bool {
        let mut current = *leaf;
        for step in proof {
            current = match step.position {
                Position::Left => hash_node(self.digester(), &step.sibling, &current),
                Position::Right => hash_node(self.digester(), &current, &step.sibling),
            };
        }
        current.as_bytes().as_slice().ct_eq(root.as_bytes().as_slice()).into()
    }

    /// Root over a contiguous run of records, in the order given.
    pub fn root_of_records(&self, records: &[QueryRecord]) -> Result<Digest> {
        self.build_root(&self.leaves(records))
    }

    fn next_level(&self, level: &[Digest]) -> Vec<Digest> {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]); // odd node duplicated
            next.push(hash_node(self.digester(), &pair[0], right));
        }
        next
    }
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::Blake3Digester;

    fn leaves(n: usize) -> Vec<Digest> {
        (0..n)
            .map(|i| Sha256Digester.digest(&(i as u64).to_be_bytes()))
            .collect()
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let tree = MerkleTree::new();
        let l = leaves(1);
        assert_eq!(tree.build_root(&l).unwrap(), l[0]);
        let bundle = tree.build_proof(&l, 0).unwrap();
        assert!(bundle.proof.is_empty());
        assert!(tree.verify_proof(&l[0], &bundle.root, &bundle.proof));
    }

    #[test]
    fn two_leaves_hash_with_node_prefix() {
        let tree = MerkleTree::new();
        let l = leaves(2);
        let root = tree.build_root(&l).unwrap();
        assert_eq!(root, hash_node(&Sha256Digester, &l[0], &l[1]));
    }

    #[test]
    fn odd_level_duplicates_last_leaf() {
        let tree = MerkleTree::new();
        let l = leaves(3);
        let mut padded = l.clone();
        padded.push(l[2]);
        assert_eq!(tree.build_root(&l).unwrap(), tree.build_root(&padded).unwrap());

        let l5 = leaves(5);
        let mut padded5 = l5.clone();
        padded5.extend_from_slice(&[l5[4], l5[4], l5[4]]);
        assert_eq!(tree.build_root(&l5).unwrap(), tree.build_root(&padded5).unwrap());
    }

    #[test]
    fn odd_node_is_not_promoted() {
        let tree = MerkleTree::new();
        let l = leaves(3);
        let promoted = hash_node(&Sha256Digester, &hash_node(&Sha256Digester, &l[0], &l[1]), &l[2]);
        assert_ne!(tree.build_root(&l).unwrap(), promoted);
    }

    #[test]
    fn every_proof_round_trips() {
        let tree = MerkleTree::new();
        for n in 1..=33 {
            let l = leaves(n);
            let root = tree.build_root(&l).unwrap();
            for (i, leaf) in l.iter().enumerate() {
                let bundle = tree.build_proof(&l, i).unwrap();
                assert_eq!(bundle.root, root, "n={n} i={i}");
                assert!(tree.verify_proof(leaf, &root, &bundle.proof), "n={n} i={i}");
            }
        }
    }

    #[test]
    fn flipping_any_sibling_bit_breaks_the_proof() {
        let tree = MerkleTree::new();
        let l = leaves(11);
        for i in [0, 5, 10] {
            let bundle = tree.build_proof(&l, i).unwrap();
            for step in 0..bundle.proof.len() {
                for bit in [0, 7, 100, 255] {
                    let mut tampered = bundle.proof.clone();
                    tampered[step].sibling = tampered[step].sibling.with_bit_flipped(bit);
                    assert!(!tree.verify_proof(&l[i], &bundle.root, &tampered));
                }
            }
        }
    }

    #[test]
    fn wrong_leaf_or_position_fails() {
        let tree = MerkleTree::new();
        let l = leaves(8);
        let bundle = tree.build_proof(&l, 3).unwrap();
        assert!(!tree.verify_proof(&l[4], &bundle.root, &bundle.proof));

        let mut swapped = bundle.proof.clone();
        swapped[0].position = Position::Right;
        assert!(!tree.verify_proof(&l[3], &bundle.root, &swapped));
    }

    #[test]
    fn out_of_range_and_empty() {
        let tree = MerkleTree::new();
        let l = leaves(4);
        assert!(matches!(
            tree.build_proof(&l, 4),
            Err(FairlogError::IndexOutOfRange { index: 4, len: 4 })
        ));
        assert!(matches!(tree.build_root(&[]), Err(FairlogError::EmptyTree)));
        assert!(matches!(tree.build_proof(&[], 0), Err(FairlogError::EmptyTree)));
    }

    #[test]
    fn algorithms_never_mix() {
        let l = leaves(6);
        let sha = MerkleTree::new();
        let b3 = MerkleTree::with_digester(Arc::new(Blake3Digester));
        let root = sha.build_root(&l).unwrap();
        assert_ne!(root, b3.build_root(&l).unwrap());
        let bundle = sha.build_proof(&l, 2).unwrap();
        assert!(!b3.verify_proof(&l[2], &root, &bundle.proof));
    }

    #[test]
    fn config_picks_the_digester() {
        let l = leaves(3);
        let configured = MerkleTree::from_config(&MerkleConfig {
            digest: "blake3".into(),
        })
        .unwrap();
        assert_eq!(configured.digester().name(), "blake3");
        let b3 = MerkleTree::with_digester(Arc::new(Blake3Digester));
        assert_eq!(configured.build_root(&l).unwrap(), b3.build_root(&l).unwrap());

        let default = MerkleTree::from_config(&MerkleConfig::default()).unwrap();
        assert_eq!(default.digester().name(), "sha256");
        assert!(matches!(
            MerkleTree::from_config(&MerkleConfig { digest: "md5".into() }),
            Err(FairlogError::Config(_))
        ));
    }
}
