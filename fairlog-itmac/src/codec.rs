use crate::QueryTranscript;
use fairlog_core::digest::Digest;
use fairlog_core::error::{FairlogError, Result};
use fairlog_verify::encode::encode_f32_vector;
use hmac::{Hmac, Mac};
use sha2::{Digest as _, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const TRANSCRIPT_TAG: &[u8] = b"FAIRLOG:ITMAC:V1";
pub const INPUT_TAG: &[u8] = b"FAIRLOG:INPUT:V1";

pub fn sha256(data: &[u8]) -> Digest {
    Digest(Sha256::digest(data).into())
}

/// Positional, domain-tagged transcript bytes. Integers are big-endian and the
/// query id is length-prefixed so no two transcripts share an encoding.
pub fn encode_transcript(t: &QueryTranscript) -> Vec<u8> {
    let id = t.query_id.as_bytes();
    let mut out = Vec::with_capacity(TRANSCRIPT_TAG.len() + 4 + id.len() + 4 + 32 + 4 + 8 + 32);
    out.extend_from_slice(TRANSCRIPT_TAG);
    out.extend_from_slice(&(id.len() as u32).to_be_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(&t.model_id.to_be_bytes());
    out.extend_from_slice(t.input_hash.as_bytes());
    out.extend_from_slice(&t.prediction.to_bits().to_be_bytes());
    out.extend_from_slice(&t.timestamp.to_be_bytes());
    out.extend_from_slice(t.coins.as_bytes());
    out
}

pub fn transcript_hash(t: &QueryTranscript) -> Digest {
    sha256(&encode_transcript(t))
}

pub fn input_hash(features: &[f32]) -> Digest {
    sha256(&encode_f32_vector(INPUT_TAG, features))
}

/// `H(r_c)`
pub fn commit(client_rand: &Digest) -> Digest {
    sha256(client_rand.as_bytes())
}

/// `H(r_c || r_p)`
pub fn derive_coins(client_rand: &Digest, provider_rand: &Digest) -> Digest {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(client_rand.as_bytes());
    buf[32..].copy_from_slice(provider_rand.as_bytes());
    sha256(&buf)
}

pub fn compute_mac(mac_key: &[u8; 32], t: &QueryTranscript) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| FairlogError::Protocol(format!("invalid mac key: {e}")))?;
    mac.update(&encode_transcript(t));
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time MAC check.
pub fn verify_mac(mac_key: &[u8; 32], t: &QueryTranscript, mac: &[u8]) -> bool {
    let Ok(mut m) = <HmacSha256 as Mac>::new_from_slice(mac_key) else {
        return false;
    };
    m.update(&encode_transcript(t));
    m.verify_slice(mac).is_ok()
}

/// What the provider signs: `H(mac || H(encode(transcript)))`.
pub fn signing_payload(mac: &[u8], t: &QueryTranscript) -> Digest {
    let th = transcript_hash(t);
    let mut buf = Vec::with_capacity(mac.len() + 32);
    buf.extend_from_slice(mac);
    buf.extend_from_slice(th.as_bytes());
    sha256(&buf)
}
