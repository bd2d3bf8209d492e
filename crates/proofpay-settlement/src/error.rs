//! Settlement errors
//!
//! Rejections that are part of normal operation (invalid intent, PoSP below
//! threshold, lease held elsewhere, nothing to settle) are outcomes, not
//! errors. Errors here stop the attempt.

use proofpay_mandate::MandateError;
use proofpay_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SettlementError>;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Mandate(#[from] MandateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A quote or payment would break an intent constraint
    #[error("Settlement constraint violated: {0}")]
    Constraint(String),

    #[error("PoSP proof I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
