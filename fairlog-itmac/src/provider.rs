use crate::codec::{commit, compute_mac, derive_coins, signing_payload};
use crate::receipt::SignedReceipt;
use crate::{
    CoinFlip, ITMAC_VERSION, ItmacRequest, ItmacResponse, MacBundle, QueryTranscript,
    TranscriptInput,
};
use fairlog_core::digest::{Digest, encode_hex};
use fairlog_core::error::{FairlogError, Result};
use fairlog_core::record::QueryRecord;
use fairlog_verify::keys::{ProviderKeys, random_32};
use fairlog_verify::signature::sign_ed25519;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStage {
    ReceivedCommit,
    Flipped,
    TranscriptBuilt,
    MacComputed,
    Signed,
    Responded,
}

impl ProviderStage {
    fn next(self) -> Option<Self> {
        use ProviderStage::*;
        match self {
            ReceivedCommit => Some(Flipped),
            Flipped => Some(TranscriptBuilt),
            TranscriptBuilt => Some(MacComputed),
            MacComputed => Some(Signed),
            Signed => Some(Responded),
            Responded => None,
        }
    }
}

/// Tracks one request through the provider role. Stages only move forward.
#[derive(Debug)]
pub struct ProviderSession {
    query_id: String,
    stage: ProviderStage,
}

impl ProviderSession {
    pub fn new(query_id: impl Into<String>) -> Self {
        let query_id = query_id.into();
        tracing::debug!(query_id = %query_id, stage = ?ProviderStage::ReceivedCommit, "itmac stage");
        Self {
            query_id,
            stage: ProviderStage::ReceivedCommit,
        }
    }

    pub fn stage(&self) -> ProviderStage {
        self.stage
    }

    pub fn advance(&mut self, to: ProviderStage) -> Result<()> {
        if self.stage.next() != Some(to) {
            return Err(FairlogError::Protocol(format!(
                "cannot move from {:?} to {to:?}",
                self.stage
            )));
        }
        self.stage = to;
        tracing::debug!(query_id = %self.query_id, stage = ?to, "itmac stage");
        Ok(())
    }
}

/// Provider role. Holds the process-wide keys for its whole lifetime.
pub struct Provider {
    keys: ProviderKeys,
}

impl Provider {
    pub fn new(keys: ProviderKeys) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &ProviderKeys {
        &self.keys
    }

    pub fn public_key_hex(&self) -> String {
        self.keys.public_key_hex()
    }

    /// Check the client's commitment and mix in fresh provider randomness.
    pub fn perform_coin_flip(&self, client_commit: &Digest, client_rand: &Digest) -> Result<CoinFlip> {
        if commit(client_rand) != *client_commit {
            return Err(FairlogError::Protocol(
                "client commitment does not match revealed randomness".into(),
            ));
        }
        let provider_rand = Digest(random_32()?);
        Ok(CoinFlip {
            client_commit: *client_commit,
            client_rand: *client_rand,
            provider_rand,
            coins: derive_coins(client_rand, &provider_rand),
        })
    }

    pub fn compute_mac(&self, transcript: &QueryTranscript) -> Result<[u8; 32]> {
        compute_mac(&self.keys.mac_key, transcript)
    }

    pub fn sign_bundle(&self, mac: &[u8; 32], transcript: &QueryTranscript) -> MacBundle {
        let payload = signing_payload(mac, transcript);
        MacBundle {
            mac: encode_hex(mac),
            provider_signature: encode_hex(&sign_ed25519(&self.keys.signing_key, payload.as_bytes())),
        }
    }

    /// Full provider side of one exchange.
    pub fn respond(&self, req: &ItmacRequest, input: TranscriptInput) -> Result<ItmacResponse> {
        if req.version != ITMAC_VERSION {
            return Err(FairlogError::Protocol(format!(
                "unsupported itmac version {} (expected {ITMAC_VERSION})",
                req.version
            )));
        }

        let mut session = ProviderSession::new(input.query_id.clone());

        let flip = self.perform_coin_flip(&req.client_commit, &req.client_rand)?;
        session.advance(ProviderStage::Flipped)?;

        let transcript = QueryTranscript {
            query_id: input.query_id,
            model_id: input.model_id,
            input_hash: input.input_hash,
            prediction: input.prediction,
            timestamp: input.timestamp,
            coins: flip.coins,
        };
        session.advance(ProviderStage::TranscriptBuilt)?;

        let mac = self.compute_mac(&transcript)?;
        session.advance(ProviderStage::MacComputed)?;

        let bundle = self.sign_bundle(&mac, &transcript);
        session.advance(ProviderStage::Signed)?;

        let response = ItmacResponse {
            version: ITMAC_VERSION,
            provider_rand: flip.provider_rand,
            transcript,
            bundle,
            provider_public_key: self.public_key_hex(),
        };
        session.advance(ProviderStage::Responded)?;
        Ok(response)
    }

    pub fn sign_receipt(&self, query_id: &str, record: QueryRecord) -> SignedReceipt {
        SignedReceipt::sign(&self.keys.signing_key, query_id, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::input_hash;

    fn input() -> TranscriptInput {
        TranscriptInput {
            query_id: "q-7".into(),
            model_id: 2,
            input_hash: input_hash(&[1.0, 0.0]),
            prediction: 1.0,
            timestamp: 1_700_000_000_000,
        }
    }

    fn request() -> ItmacRequest {
        let rc = Digest(random_32().unwrap());
        ItmacRequest {
            version: ITMAC_VERSION,
            client_commit: commit(&rc),
            client_rand: rc,
        }
    }

    #[test]
    fn respond_binds_client_randomness() {
        let provider = Provider::new(ProviderKeys::generate().unwrap());
        let req = request();
        let resp = provider.respond(&req, input()).unwrap();
        assert_eq!(
            resp.transcript.coins,
            derive_coins(&req.client_rand, &resp.provider_rand)
        );
        assert_eq!(resp.provider_public_key, provider.public_key_hex());
        assert_eq!(resp.transcript.query_id, "q-7");
    }

    #[test]
    fn commitment_mismatch_is_rejected() {
        let provider = Provider::new(ProviderKeys::generate().unwrap());
        let mut req = request();
        req.client_rand = req.client_rand.with_bit_flipped(3);
        assert!(matches!(
            provider.respond(&req, input()),
            Err(FairlogError::Protocol(_))
        ));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let provider = Provider::new(ProviderKeys::generate().unwrap());
        let mut req = request();
        req.version = 99;
        assert!(provider.respond(&req, input()).is_err());
    }

    #[test]
    fn stages_only_move_forward() {
        let mut s = ProviderSession::new("q");
        assert!(s.advance(ProviderStage::MacComputed).is_err());
        s.advance(ProviderStage::Flipped).unwrap();
        s.advance(ProviderStage::TranscriptBuilt).unwrap();
        assert!(s.advance(ProviderStage::Flipped).is_err());
        assert_eq!(s.stage(), ProviderStage::TranscriptBuilt);
    }

    #[test]
    fn fresh_provider_randomness_per_request() {
        let provider = Provider::new(ProviderKeys::generate().unwrap());
        let req = request();
        let a = provider.respond(&req, input()).unwrap();
        let b = provider.respond(&req, input()).unwrap();
        assert_ne!(a.provider_rand, b.provider_rand);
        assert_ne!(a.bundle, b.bundle);
    }
}
