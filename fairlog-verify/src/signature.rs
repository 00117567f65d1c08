use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use fairlog_core::digest::decode_hex_array;
use fairlog_core::error::{FairlogError, Result};

pub struct SignatureVerifier;

impl SignatureVerifier {
    pub fn new() -> Self {
        Self
    }

    pub fn verify_ed25519(
        &self,
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8; 64],
    ) -> Result<bool> {
        let key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| FairlogError::Malformed(format!("invalid public key: {e}")))?;

        let sig = Signature::from_bytes(signature);

        Ok(key.verify_strict(message, &sig).is_ok())
    }

    /// Same as [`verify_ed25519`](Self::verify_ed25519) for hex-encoded key and signature.
    pub fn verify_ed25519_hex(
        &self,
        public_key_hex: &str,
        message: &[u8],
        signature_hex: &str,
    ) -> Result<bool> {
        let key: [u8; 32] = decode_hex_array(public_key_hex, "public key")?;
        let sig: [u8; 64] = decode_hex_array(signature_hex, "signature")?;
        self.verify_ed25519(&key, message, &sig)
    }
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self::new()
    }
}

pub fn sign_ed25519(key: &SigningKey, message: &[u8]) -> [u8; 64] {
    key.sign(message).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SigningKey {
        let mut secret = [0u8; 32];
        getrandom::fill(&mut secret).unwrap();
        SigningKey::from_bytes(&secret)
    }

    #[test]
    fn sign_and_verify() {
        let k = key();
        let sig = sign_ed25519(&k, b"payload");
        let verifier = SignatureVerifier::new();
        let pk = k.verifying_key().to_bytes();
        assert!(verifier.verify_ed25519(&pk, b"payload", &sig).unwrap());
        assert!(!verifier.verify_ed25519(&pk, b"payload!", &sig).unwrap());
    }

    #[test]
    fn hex_variant_reports_malformed_input() {
        let verifier = SignatureVerifier::new();
        let err = verifier
            .verify_ed25519_hex("0x1234", b"m", &"00".repeat(64))
            .unwrap_err();
        assert!(matches!(err, FairlogError::Malformed(_)));
        assert!(verifier.verify_ed25519_hex("nothex", b"m", "nothex").is_err());
    }
}
