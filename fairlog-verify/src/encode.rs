use fairlog_core::digest::Digest;
use fairlog_core::record::QueryRecord;
use sha2::{Digest as _, Sha256};
use std::sync::Arc;

pub const RECORD_TAG: &[u8] = b"FAIRLOG:RECORD:V1";
pub const FEATURES_TAG: &[u8] = b"FAIRLOG:FEATURES:V1";
/// Prepended to `left || right` for every internal node.
pub const NODE_PREFIX: u8 = 0x01;

/// Collision-resistant hash used for leaves and nodes. One instance per tree.
pub trait Digester: Send + Sync {
    fn name(&self) -> &'static str;
    fn digest(&self, data: &[u8]) -> Digest;
}

pub type SharedDigester = Arc<dyn Digester>;

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Digester;

impl Digester for Sha256Digester {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn digest(&self, data: &[u8]) -> Digest {
        Digest(Sha256::digest(data).into())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Digester;

impl Digester for Blake3Digester {
    fn name(&self) -> &'static str {
        "blake3"
    }

    fn digest(&self, data: &[u8]) -> Digest {
        Digest(blake3::hash(data).into())
    }
}

/// Look up a digester by its configured name.
pub fn digester_by_name(name: &str) -> Option<SharedDigester> {
    match name {
        "sha256" => Some(Arc::new(Sha256Digester)),
        "blake3" => Some(Arc::new(Blake3Digester)),
        _ => None,
    }
}

/// `tag || n:u32 || f32 bits * n`, big-endian.
pub fn encode_f32_vector(tag: &[u8], values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tag.len() + 4 + values.len() * 4);
    out.extend_from_slice(tag);
    out.extend_from_slice(&(values.len() as u32).to_be_bytes());
    for v in values {
        out.extend_from_slice(&v.to_bits().to_be_bytes());
    }
    out
}

/// Stands in for the raw features inside a leaf so they stay private.
pub fn features_hash(digester: &dyn Digester, features: &[f32]) -> Digest {
    digester.digest(&encode_f32_vector(FEATURES_TAG, features))
}

/// Canonical leaf bytes:
/// `RECORD_TAG || seq:u64 || model:u32 || features_hash:[32] || prediction:u32 || timestamp:u64`
pub fn encode_leaf(digester: &dyn Digester, record: &QueryRecord) -> Vec<u8> {
    let fh = features_hash(digester, &record.features);
    let mut out = Vec::with_capacity(RECORD_TAG.len() + 8 + 4 + 32 + 4 + 8);
    out.extend_from_slice(RECORD_TAG);
    out.extend_from_slice(&record.seq_num.to_be_bytes());
    out.extend_from_slice(&record.model_id.to_be_bytes());
    out.extend_from_slice(fh.as_bytes());
    out.extend_from_slice(&record.prediction.to_bits().to_be_bytes());
    out.extend_from_slice(&record.timestamp.to_be_bytes());
    out
}

pub fn leaf_digest(digester: &dyn Digester, record: &QueryRecord) -> Digest {
    digester.digest(&encode_leaf(digester, record))
}

pub fn hash_node(digester: &dyn Digester, left: &Digest, right: &Digest) -> Digest {
    let mut buf = [0u8; 65];
    buf[0] = NODE_PREFIX;
    buf[1..33].copy_from_slice(left.as_bytes());
    buf[33..].copy_from_slice(right.as_bytes());
    digester.digest(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> QueryRecord {
        QueryRecord {
            seq_num: 42,
            model_id: 7,
            features: vec![0.5, 1.25, -3.0],
            sensitive_attr: 1,
            prediction: 1.0,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn leaf_layout_is_fixed() {
        let enc = encode_leaf(&Sha256Digester, &record());
        assert_eq!(enc.len(), RECORD_TAG.len() + 56);
        assert!(enc.starts_with(RECORD_TAG));
        let seq = &enc[RECORD_TAG.len()..RECORD_TAG.len() + 8];
        assert_eq!(seq, &42u64.to_be_bytes());
        let model = &enc[RECORD_TAG.len() + 8..RECORD_TAG.len() + 12];
        assert_eq!(model, &7u32.to_be_bytes());
    }

    #[test]
    fn raw_features_never_appear_in_leaf() {
        let r = record();
        let enc = encode_leaf(&Sha256Digester, &r);
        let raw = encode_f32_vector(FEATURES_TAG, &r.features);
        assert!(!enc.windows(raw.len()).any(|w| w == raw.as_slice()));
    }

    #[test]
    fn every_committed_field_changes_the_leaf() {
        let d = Sha256Digester;
        let base = leaf_digest(&d, &record());

        let mut r = record();
        r.prediction = 0.0;
        assert_ne!(leaf_digest(&d, &r), base);

        let mut r = record();
        r.features[2] = -3.5;
        assert_ne!(leaf_digest(&d, &r), base);

        let mut r = record();
        r.timestamp += 1;
        assert_ne!(leaf_digest(&d, &r), base);

        let mut r = record();
        r.seq_num += 1;
        assert_ne!(leaf_digest(&d, &r), base);
    }

    #[test]
    fn node_hash_is_domain_separated() {
        let d = Sha256Digester;
        let a = Digest([1u8; 32]);
        let b = Digest([2u8; 32]);
        let mut raw = Vec::new();
        raw.extend_from_slice(a.as_bytes());
        raw.extend_from_slice(b.as_bytes());
        assert_ne!(hash_node(&d, &a, &b), d.digest(&raw));

        let mut prefixed = vec![NODE_PREFIX];
        prefixed.extend_from_slice(&raw);
        assert_eq!(hash_node(&d, &a, &b), d.digest(&prefixed));
    }

    #[test]
    fn digesters_disagree() {
        let data = b"fairlog";
        assert_ne!(Sha256Digester.digest(data), Blake3Digester.digest(data));
        assert_eq!(digester_by_name("blake3").unwrap().name(), "blake3");
        assert!(digester_by_name("md5").is_none());
    }
}
