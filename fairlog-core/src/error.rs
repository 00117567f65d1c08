use thiserror::Error;

#[derive(Error, Debug)]
pub enum FairlogError {
    #[error("sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("leaf index {index} out of range for {len} leaves")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("cannot build a merkle tree from zero leaves")]
    EmptyTree,

    #[error("malformed encoding: {0}")]
    Malformed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("batch '{0}' already exists")]
    BatchAlreadyExists(String),

    #[error("ledger submission failed: {0}")]
    LedgerSubmission(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("proof source error: {0}")]
    ProofSource(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FairlogError {
    /// Structural invariant violations that must abort the current operation
    /// instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FairlogError::SequenceGap { .. }
                | FairlogError::IndexOutOfRange { .. }
                | FairlogError::EmptyTree
                | FairlogError::Malformed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FairlogError>;
