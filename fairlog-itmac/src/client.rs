use crate::codec::{commit, derive_coins, signing_payload, verify_mac};
use crate::{ITMAC_VERSION, ItmacRequest, ItmacResponse, MacBundle, QueryTranscript, VerifyOutcome};
use fairlog_core::digest::{Digest, decode_hex, decode_hex_array};
use fairlog_core::error::{FairlogError, Result};
use fairlog_verify::keys::random_32;
use fairlog_verify::signature::SignatureVerifier;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Committed,
    AwaitingResponse,
    Verified,
    Rejected,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    /// Recompute the MAC as well. Ignored unless the client holds the MAC key.
    pub verify_mac: bool,
}

/// Client role, pinned to one provider public key.
#[derive(Debug, Clone)]
pub struct Client {
    provider_public_key: [u8; 32],
    mac_key: Option<[u8; 32]>,
}

impl Client {
    pub fn new(provider_public_key: [u8; 32]) -> Self {
        Self {
            provider_public_key,
            mac_key: None,
        }
    }

    pub fn from_public_key_hex(hex: &str) -> Result<Self> {
        Ok(Self::new(decode_hex_array(hex, "provider public key")?))
    }

    pub fn with_mac_key(mut self, mac_key: [u8; 32]) -> Self {
        self.mac_key = Some(mac_key);
        self
    }

    pub fn provider_public_key(&self) -> &[u8; 32] {
        &self.provider_public_key
    }

    /// Fresh `r_c` and its commitment `H(r_c)`.
    pub fn generate_commitment() -> Result<(Digest, Digest)> {
        let rc = Digest(random_32()?);
        Ok((rc, commit(&rc)))
    }

    pub fn derive_coins(client_rand: &Digest, provider_rand: &Digest) -> Digest {
        derive_coins(client_rand, provider_rand)
    }

    /// Check a bundle against the pinned key. Every failure, malformed input
    /// included, comes back as a rejected outcome.
    pub fn verify_bundle(
        &self,
        transcript: &QueryTranscript,
        bundle: &MacBundle,
        opts: VerifyOptions,
    ) -> VerifyOutcome {
        let mac = match decode_hex(&bundle.mac) {
            Ok(m) if m.len() == 32 => m,
            Ok(m) => return VerifyOutcome::reject(format!("mac is {} bytes, expected 32", m.len())),
            Err(e) => return VerifyOutcome::reject(format!("malformed mac: {e}")),
        };
        let sig: [u8; 64] = match decode_hex_array(&bundle.provider_signature, "signature") {
            Ok(s) => s,
            Err(e) => return VerifyOutcome::reject(format!("malformed signature: {e}")),
        };

        let payload = signing_payload(&mac, transcript);
        match SignatureVerifier::new().verify_ed25519(&self.provider_public_key, payload.as_bytes(), &sig)
        {
            Ok(true) => {}
            Ok(false) => return VerifyOutcome::reject("signature verification failed"),
            Err(e) => return VerifyOutcome::reject(e.to_string()),
        }

        if let (true, Some(key)) = (opts.verify_mac, &self.mac_key) {
            if !verify_mac(key, transcript, &mac) {
                return VerifyOutcome::reject("mac mismatch");
            }
        }

        VerifyOutcome::ok()
    }

    pub fn begin(&self) -> QuerySession {
        QuerySession::new()
    }
}

/// One query from the client's side.
#[derive(Debug)]
pub struct QuerySession {
    state: ClientState,
    client_rand: Digest,
    client_commit: Digest,
}

impl QuerySession {
    pub fn new() -> Self {
        Self {
            state: ClientState::Init,
            client_rand: Digest::ZERO,
            client_commit: Digest::ZERO,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// `Init -> Committed`
    pub fn commit(&mut self) -> Result<Digest> {
        self.expect(ClientState::Init)?;
        let (rc, c) = Client::generate_commitment()?;
        self.client_rand = rc;
        self.client_commit = c;
        self.state = ClientState::Committed;
        Ok(c)
    }

    /// `Committed -> AwaitingResponse`. The reveal travels with the commitment.
    pub fn request(&mut self) -> Result<ItmacRequest> {
        self.expect(ClientState::Committed)?;
        self.state = ClientState::AwaitingResponse;
        Ok(ItmacRequest {
            version: ITMAC_VERSION,
            client_commit: self.client_commit,
            client_rand: self.client_rand,
        })
    }

    /// `AwaitingResponse -> Verified | Rejected`
    pub fn accept(
        &mut self,
        client: &Client,
        resp: &ItmacResponse,
        opts: VerifyOptions,
    ) -> Result<VerifyOutcome> {
        self.expect(ClientState::AwaitingResponse)?;
        let outcome = self.check(client, resp, opts);
        self.state = if outcome.valid {
            ClientState::Verified
        } else {
            ClientState::Rejected
        };
        match &outcome.reason {
            None => tracing::debug!(query_id = %resp.transcript.query_id, "bundle verified"),
            Some(reason) => {
                tracing::warn!(query_id = %resp.transcript.query_id, reason = %reason, "bundle rejected")
            }
        }
        Ok(outcome)
    }

    /// No response within the deadline: the query yields no receipt.
    pub fn timed_out(&mut self) {
        if self.state == ClientState::AwaitingResponse {
            self.state = ClientState::Rejected;
        }
    }

    fn check(&self, client: &Client, resp: &ItmacResponse, opts: VerifyOptions) -> VerifyOutcome {
        if resp.version != ITMAC_VERSION {
            return VerifyOutcome::reject(format!("unsupported itmac version {}", resp.version));
        }
        match decode_hex_array::<32>(&resp.provider_public_key, "provider public key") {
            Ok(pk) if bool::from(pk.as_slice().ct_eq(client.provider_public_key().as_slice())) => {}
            Ok(_) => return VerifyOutcome::reject("provider public key does not match pinned key"),
            Err(e) => return VerifyOutcome::reject(e.to_string()),
        }
        let coins = derive_coins(&self.client_rand, &resp.provider_rand);
        if coins != resp.transcript.coins {
            return VerifyOutcome::reject("coins do not match H(r_c || r_p)");
        }
        client.verify_bundle(&resp.transcript, &resp.bundle, opts)
    }

    fn expect(&self, state: ClientState) -> Result<()> {
        if self.state != state {
            return Err(FairlogError::Protocol(format!(
                "query session is {:?}, expected {state:?}",
                self.state
            )));
        }
        Ok(())
    }
}

impl Default for QuerySession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TranscriptInput;
    use crate::codec::input_hash;
    use crate::provider::Provider;
    use fairlog_verify::keys::ProviderKeys;

    fn setup() -> (Provider, Client) {
        let keys = ProviderKeys::generate().unwrap();
        let client = Client::new(keys.verifying_key().to_bytes()).with_mac_key(keys.mac_key);
        (Provider::new(keys), client)
    }

    fn input(prediction: f32) -> TranscriptInput {
        TranscriptInput {
            query_id: "q-1".into(),
            model_id: 1,
            input_hash: input_hash(&[3.0, 4.0]),
            prediction,
            timestamp: 1_700_000_000_123,
        }
    }

    fn exchange(provider: &Provider, client: &Client) -> (QuerySession, ItmacResponse) {
        let mut session = client.begin();
        session.commit().unwrap();
        let req = session.request().unwrap();
        let resp = provider.respond(&req, input(1.0)).unwrap();
        (session, resp)
    }

    #[test]
    fn honest_exchange_verifies() {
        let (provider, client) = setup();
        let (mut session, resp) = exchange(&provider, &client);
        let outcome = session
            .accept(&client, &resp, VerifyOptions { verify_mac: true })
            .unwrap();
        assert!(outcome.valid, "{outcome:?}");
        assert_eq!(session.state(), ClientState::Verified);
    }

    #[test]
    fn changed_prediction_fails_even_when_resigned_by_another_key() {
        let (provider, client) = setup();
        let (_, resp) = exchange(&provider, &client);

        let mut changed = resp.transcript.clone();
        changed.prediction = 0.0;
        let outcome = client.verify_bundle(&changed, &resp.bundle, VerifyOptions::default());
        assert!(!outcome.valid);

        let impostor = Provider::new(ProviderKeys::generate().unwrap());
        let mac = impostor.compute_mac(&changed).unwrap();
        let resigned = impostor.sign_bundle(&mac, &changed);
        assert!(!client.verify_bundle(&changed, &resigned, VerifyOptions::default()).valid);
    }

    #[test]
    fn bad_mac_is_caught_only_when_requested() {
        let (provider, client) = setup();
        let (_, resp) = exchange(&provider, &client);

        // signature covers the tampered mac, so only the mac recomputation notices
        let bogus = [9u8; 32];
        let forged = provider.sign_bundle(&bogus, &resp.transcript);
        assert!(client.verify_bundle(&resp.transcript, &forged, VerifyOptions::default()).valid);
        let outcome =
            client.verify_bundle(&resp.transcript, &forged, VerifyOptions { verify_mac: true });
        assert_eq!(outcome.reason.as_deref(), Some("mac mismatch"));

        let keyless = Client::new(*client.provider_public_key());
        assert!(keyless.verify_bundle(&resp.transcript, &forged, VerifyOptions { verify_mac: true }).valid);
    }

    #[test]
    fn malformed_hex_is_a_reason_not_a_panic() {
        let (provider, client) = setup();
        let (_, resp) = exchange(&provider, &client);

        let mut bundle = resp.bundle.clone();
        bundle.provider_signature = "0xzz".into();
        let outcome = client.verify_bundle(&resp.transcript, &bundle, VerifyOptions::default());
        assert!(!outcome.valid);
        assert!(outcome.reason.unwrap().contains("malformed signature"));

        let mut bundle = resp.bundle.clone();
        bundle.mac = "0x00".into();
        assert!(!client.verify_bundle(&resp.transcript, &bundle, VerifyOptions::default()).valid);
    }

    #[test]
    fn unpinned_provider_key_is_rejected() {
        let (provider, client) = setup();
        let (mut session, mut resp) = exchange(&provider, &client);
        resp.provider_public_key = ProviderKeys::generate().unwrap().public_key_hex();
        let outcome = session.accept(&client, &resp, VerifyOptions::default()).unwrap();
        assert!(!outcome.valid);
        assert_eq!(session.state(), ClientState::Rejected);
    }

    #[test]
    fn swapped_provider_rand_is_rejected() {
        let (provider, client) = setup();
        let (mut session, mut resp) = exchange(&provider, &client);
        resp.provider_rand = resp.provider_rand.with_bit_flipped(0);
        let outcome = session.accept(&client, &resp, VerifyOptions::default()).unwrap();
        assert!(outcome.reason.unwrap().contains("coins"));
    }

    #[test]
    fn out_of_order_and_timeout() {
        let mut session = QuerySession::new();
        assert!(session.request().is_err());
        session.commit().unwrap();
        assert!(session.commit().is_err());
        session.request().unwrap();
        session.timed_out();
        assert_eq!(session.state(), ClientState::Rejected);
    }
}
