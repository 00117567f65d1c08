use ed25519_dalek::{SigningKey, VerifyingKey};
use fairlog_core::digest::encode_hex;
use fairlog_core::error::{FairlogError, Result};
use std::path::{Path, PathBuf};

/// The provider's process-wide secrets: loaded once at startup, never rotated
/// while batches are in flight.
#[derive(Clone)]
pub struct ProviderKeys {
    pub signing_key: SigningKey,
    /// HMAC key. Stays inside the provider's trust boundary.
    pub mac_key: [u8; 32],
}

impl ProviderKeys {
    pub fn generate() -> Result<Self> {
        Ok(Self {
            signing_key: SigningKey::from_bytes(&random_32()?),
            mac_key: random_32()?,
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        encode_hex(&self.verifying_key().to_bytes())
    }
}

impl std::fmt::Debug for ProviderKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderKeys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Manages the provider key pair, the MAC key, and pinned provider keys on the client side.
pub struct KeyStore {
    base_dir: PathBuf,
}

impl KeyStore {
    /// Open key store at a specific directory, creating it if needed.
    pub fn open_at(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self { base_dir: path })
    }

    pub fn dir(&self) -> &Path {
        &self.base_dir
    }

    /// Load or generate the provider keys.
    /// Generated on first run, persisted for all future sessions.
    pub fn provider_keys(&self) -> Result<ProviderKeys> {
        let key_path = self.base_dir.join("provider.key");
        let mac_path = self.base_dir.join("mac.key");
        if key_path.exists() && mac_path.exists() {
            Ok(ProviderKeys {
                signing_key: SigningKey::from_bytes(&read_32(&key_path, "provider key")?),
                mac_key: read_32(&mac_path, "mac key")?,
            })
        } else {
            let keys = ProviderKeys::generate()?;
            std::fs::write(&key_path, keys.signing_key.to_bytes())?;
            std::fs::write(&mac_path, keys.mac_key)?;
            // public key alongside for reference
            std::fs::write(
                key_path.with_extension("pub"),
                keys.verifying_key().to_bytes(),
            )?;
            tracing::info!(public_key = %keys.public_key_hex(), "generated new provider keys");
            Ok(keys)
        }
    }

    /// Pin a provider's public key (saves to `{name}.pub`).
    pub fn trust_provider(&self, name: &str, public_key: &[u8; 32]) -> Result<()> {
        if name == "provider" {
            return Err(FairlogError::Config("'provider' is reserved for the local key".into()));
        }
        let path = self.base_dir.join(format!("{name}.pub"));
        std::fs::write(&path, public_key)?;
        tracing::info!(provider = name, "pinned provider key");
        Ok(())
    }

    /// Load a pinned provider key.
    pub fn trusted_provider(&self, name: &str) -> Result<Option<VerifyingKey>> {
        let path = self.base_dir.join(format!("{name}.pub"));
        if !path.exists() {
            return Ok(None);
        }
        let bytes = read_32(&path, "provider public key")?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| FairlogError::Malformed(format!("invalid provider key '{name}': {e}")))?;
        Ok(Some(key))
    }
}

pub fn random_32() -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    getrandom::fill(&mut out).map_err(|e| FairlogError::Protocol(format!("CSPRNG failed: {e}")))?;
    Ok(out)
}

fn read_32(path: &Path, what: &str) -> Result<[u8; 32]> {
    let bytes = std::fs::read(path)?;
    bytes.as_slice().try_into().map_err(|_| {
        FairlogError::Malformed(format!("{what} is {} bytes, expected 32", bytes.len()))
    })
}
