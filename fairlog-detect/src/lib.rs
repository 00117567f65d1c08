//! Client-side fraud detection.
//!
//! A client keeps every signed receipt it was handed in a [`ReceiptBook`].
//! When the ledger commits a batch, [`FraudDetector`] fetches a fresh proof
//! for each covered receipt and checks it against the committed root. A
//! receipt that fails is fraudulent inclusion; one that no batch covers after
//! the grace period is non-inclusion. Both can be disputed on the ledger.
//! Receipts that do not verify under the provider's key are rejected first
//! and never count against it.

pub mod book;
pub mod detector;
pub mod source;

pub use book::{FraudEvidence, FraudKind, HeldReceipt, ReceiptBook, ReceiptStatus, receipt_key};
pub use detector::{DisputeRequest, FraudDetector, Outcome};
pub use source::{HttpProofSource, LocalProofSource, ProofFetch, ProofSource};
