//! Configuration for the provider server, the batch builder and the client-side
//! fraud detector. Everything is passed explicitly at construction; nothing here
//! reads secrets from the environment.

use crate::error::{FairlogError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound on records pulled into one batch window.
pub const MAX_UNBATCHED_WINDOW: usize = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FairlogConfig {
    pub server: ServerConfig,
    pub batch: BatchConfig,
    pub detector: DetectorConfig,
    pub merkle: MerkleConfig,
}

impl FairlogConfig {
    /// Load and validate a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: FairlogConfig =
            toml::from_str(content).map_err(|e| FairlogError::Config(format!("parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.batch.validate()?;
        self.detector.validate()?;
        self.merkle.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Holds `fairlog.db` and the provider key directory.
    pub data_dir: PathBuf,
    /// Provider-side limit on building one IT-MAC bundle.
    pub bundle_timeout_ms: u64,
    /// JSON threshold model; a built-in demo model is used when unset.
    pub model_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".into(),
            data_dir: PathBuf::from(".fairlog"),
            bundle_timeout_ms: 2_000,
            model_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Batch as soon as this many queries are unbatched.
    pub size_threshold: usize,
    /// Batch once the oldest unbatched query is this old, whatever the count.
    pub age_threshold_ms: u64,
    /// Largest window a single batch may consume.
    pub max_window: usize,
    pub sweep_interval_ms: u64,
    /// The ledger's own dispute grace period. `age_threshold_ms` must stay below it.
    pub ledger_grace_period_ms: u64,
    pub submit_max_attempts: u32,
    pub submit_base_backoff_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size_threshold: 100,
            age_threshold_ms: 15 * 60 * 1000,
            max_window: 100,
            sweep_interval_ms: 60 * 1000,
            ledger_grace_period_ms: 60 * 60 * 1000,
            submit_max_attempts: 5,
            submit_base_backoff_ms: 500,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.size_threshold == 0 {
            return Err(FairlogError::Config("batch.size_threshold must be >= 1".into()));
        }
        if self.max_window < self.size_threshold {
            return Err(FairlogError::Config(format!(
                "batch.max_window ({}) must be >= batch.size_threshold ({})",
                self.max_window, self.size_threshold
            )));
        }
        if self.max_window > MAX_UNBATCHED_WINDOW {
            return Err(FairlogError::Config(format!(
                "batch.max_window ({}) exceeds the hard cap of {MAX_UNBATCHED_WINDOW}",
                self.max_window
            )));
        }
        if self.age_threshold_ms >= self.ledger_grace_period_ms {
            return Err(FairlogError::Config(format!(
                "batch.age_threshold_ms ({}) must be below the ledger grace period ({})",
                self.age_threshold_ms, self.ledger_grace_period_ms
            )));
        }
        if self.submit_max_attempts == 0 {
            return Err(FairlogError::Config("batch.submit_max_attempts must be >= 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// How long a receipt may stay outside every committed batch before it
    /// counts as omitted.
    pub grace_period_ms: u64,
    /// The ledger's dispute-eligibility window.
    pub ledger_dispute_window_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 60 * 60 * 1000,
            ledger_dispute_window_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.grace_period_ms > self.ledger_dispute_window_ms {
            return Err(FairlogError::Config(format!(
                "detector.grace_period_ms ({}) must not exceed the ledger dispute window ({})",
                self.grace_period_ms, self.ledger_dispute_window_ms
            )));
        }
        Ok(())
    }
}

/// Digest names a tree can be built with.
pub const DIGESTS: &[&str] = &["sha256", "blake3"];

/// Leaf and node hash for every batch tree. Provider, ledger and clients must agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MerkleConfig {
    pub digest: String,
}

impl Default for MerkleConfig {
    fn default() -> Self {
        Self {
            digest: "sha256".into(),
        }
    }
}

impl MerkleConfig {
    pub fn validate(&self) -> Result<()> {
        if !DIGESTS.contains(&self.digest.as_str()) {
            return Err(FairlogError::Config(format!(
                "merkle.digest '{}' is not one of {}",
                self.digest,
                DIGESTS.join(", ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        FairlogConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg = FairlogConfig::from_toml(
            r#"
            [batch]
            size_threshold = 10
            max_window = 50

            [server]
            bind = "0.0.0.0:8080"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.batch.size_threshold, 10);
        assert_eq!(cfg.batch.max_window, 50);
        assert_eq!(cfg.batch.submit_max_attempts, 5);
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.detector.grace_period_ms, 60 * 60 * 1000);
        assert_eq!(cfg.merkle.digest, "sha256");
    }

    #[test]
    fn merkle_digest_is_selectable() {
        let cfg = FairlogConfig::from_toml("[merkle]\ndigest = \"blake3\"\n").unwrap();
        assert_eq!(cfg.merkle.digest, "blake3");
        let err = FairlogConfig::from_toml("[merkle]\ndigest = \"md5\"\n").unwrap_err();
        assert!(err.to_string().contains("merkle.digest"));
    }

    #[test]
    fn age_threshold_must_undercut_ledger_grace() {
        let cfg = BatchConfig {
            age_threshold_ms: 60 * 60 * 1000,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(FairlogError::Config(_))));
    }

    #[test]
    fn grace_period_bounded_by_dispute_window() {
        let cfg = DetectorConfig {
            grace_period_ms: 10_000,
            ledger_dispute_window_ms: 5_000,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn window_smaller_than_threshold_rejected() {
        let err = FairlogConfig::from_toml("[batch]\nsize_threshold = 20\nmax_window = 10\n")
            .unwrap_err();
        assert!(err.to_string().contains("max_window"));
    }

    #[test]
    fn garbage_toml_is_config_error() {
        assert!(matches!(
            FairlogConfig::from_toml("batch = ["),
            Err(FairlogError::Config(_))
        ));
    }
}
