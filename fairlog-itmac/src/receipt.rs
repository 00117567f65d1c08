use crate::codec::sha256;
use ed25519_dalek::SigningKey;
use fairlog_core::digest::{Digest, decode_hex_array, encode_hex};
use fairlog_core::record::QueryRecord;
use fairlog_verify::encode::{Sha256Digester, features_hash};
use fairlog_verify::signature::{SignatureVerifier, sign_ed25519};
use serde::{Deserialize, Serialize};

pub const RECEIPT_TAG: &[u8] = b"FAIRLOG:RECEIPT:V1";

/// Client-held evidence for one query: the record's public fields plus a
/// provider signature over their deterministic hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedReceipt {
    pub query_id: String,
    #[serde(flatten)]
    pub record: QueryRecord,
    pub features_hash: Digest,
    pub data_hash: Digest,
    pub provider_signature: String,
}

/// Prediction as the ledger sees it: fixed-point with six decimals.
pub fn scaled_prediction(prediction: f32) -> i64 {
    (f64::from(prediction) * 1e6).round() as i64
}

/// Hash the provider signs. Takes the features hash, not the features, so a
/// verifier never needs the raw input.
pub fn data_hash(
    seq_num: u64,
    model_id: u32,
    features_hash: &Digest,
    sensitive_attr: u32,
    scaled_prediction: i64,
    timestamp: u64,
) -> Digest {
    let mut buf = Vec::with_capacity(RECEIPT_TAG.len() + 8 + 4 + 32 + 4 + 8 + 8);
    buf.extend_from_slice(RECEIPT_TAG);
    buf.extend_from_slice(&seq_num.to_be_bytes());
    buf.extend_from_slice(&model_id.to_be_bytes());
    buf.extend_from_slice(features_hash.as_bytes());
    buf.extend_from_slice(&sensitive_attr.to_be_bytes());
    buf.extend_from_slice(&scaled_prediction.to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    sha256(&buf)
}

/// `(features_hash, data_hash)` for a record.
pub fn receipt_hashes(record: &QueryRecord) -> (Digest, Digest) {
    let fh = features_hash(&Sha256Digester, &record.features);
    let dh = data_hash(
        record.seq_num,
        record.model_id,
        &fh,
        record.sensitive_attr,
        scaled_prediction(record.prediction),
        record.timestamp,
    );
    (fh, dh)
}

impl SignedReceipt {
    pub fn sign(signing_key: &SigningKey, query_id: impl Into<String>, record: QueryRecord) -> Self {
        let (features_hash, data_hash) = receipt_hashes(&record);
        let sig = sign_ed25519(signing_key, data_hash.as_bytes());
        Self {
            query_id: query_id.into(),
            record,
            features_hash,
            data_hash,
            provider_signature: encode_hex(&sig),
        }
    }

    pub fn seq_num(&self) -> u64 {
        self.record.seq_num
    }

    pub fn model_id(&self) -> u32 {
        self.record.model_id
    }

    /// Recompute both hashes from the held record and check the signature.
    /// Malformed hex counts as a failed check.
    pub fn verify(&self, public_key: &[u8; 32]) -> bool {
        let (fh, dh) = receipt_hashes(&self.record);
        if fh != self.features_hash || dh != self.data_hash {
            return false;
        }
        let Ok(sig) = decode_hex_array::<64>(&self.provider_signature, "signature") else {
            return false;
        };
        SignatureVerifier::new()
            .verify_ed25519(public_key, dh.as_bytes(), &sig)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SigningKey {
        let mut secret = [0u8; 32];
        getrandom::fill(&mut secret).unwrap();
        SigningKey::from_bytes(&secret)
    }

    fn record() -> QueryRecord {
        QueryRecord {
            seq_num: 42,
            model_id: 1,
            features: vec![0.5, 1.5, -2.0],
            sensitive_attr: 1,
            prediction: 1.0,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn signed_receipt_verifies() {
        let k = key();
        let receipt = SignedReceipt::sign(&k, "q-42", record());
        assert!(receipt.verify(&k.verifying_key().to_bytes()));
        assert!(!receipt.verify(&key().verifying_key().to_bytes()));
    }

    #[test]
    fn edited_fields_break_the_receipt() {
        let k = key();
        let pk = k.verifying_key().to_bytes();

        let mut receipt = SignedReceipt::sign(&k, "q-42", record());
        receipt.record.sensitive_attr = 0;
        assert!(!receipt.verify(&pk));

        let mut receipt = SignedReceipt::sign(&k, "q-42", record());
        receipt.provider_signature = "0xnothex".into();
        assert!(!receipt.verify(&pk));
    }

    #[test]
    fn prediction_scaling_rounds() {
        assert_eq!(scaled_prediction(1.0), 1_000_000);
        assert_eq!(scaled_prediction(0.0), 0);
        assert_eq!(scaled_prediction(0.25), 250_000);
    }

    #[test]
    fn json_is_flat() {
        let receipt = SignedReceipt::sign(&key(), "q-42", record());
        let json = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["seq_num"], 42);
        assert_eq!(json["query_id"], "q-42");
        let back: SignedReceipt = serde_json::from_value(json).unwrap();
        assert_eq!(back, receipt);
    }
}
