//! Mandate errors
//!
//! Verification problems with an envelope are reported as violations, not
//! errors. Errors here are the hard failures: no key for a `kid`, a key that
//! cannot be parsed, or a payload that cannot be signed at all.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MandateError>;

#[derive(Debug, Error)]
pub enum MandateError {
    /// No public key is configured for the kid; verification fails closed
    #[error("No public key configured for kid {0:?}")]
    UnknownKid(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid mandate payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid mandate envelope: {0}")]
    InvalidEnvelope(String),

    #[error(transparent)]
    Crypto(#[from] proofpay_crypto::CryptoError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
