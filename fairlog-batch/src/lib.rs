//! Provider-side query log and batching: sequencing, contiguous windowing,
//! Merkle roots, ledger submission and proof serving.

pub mod builder;
pub mod sequencer;
pub mod store;

pub use builder::{BatchBuilder, SweepReport, validate_contiguity};
pub use sequencer::Sequencer;
pub use store::{QueryStore, SqliteStore};
