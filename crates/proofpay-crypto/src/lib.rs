//! ProofPay Crypto - the mandate codec
//!
//! This crate provides:
//! - Canonical JSON (`stable_stringify`) used for every hash and signature
//! - SHA-256 hashing, including the `sha256:`-prefixed mandate payload hash
//! - base64url (no padding) encoding for signatures
//! - Ed25519 key loading from PEM
//!
//! # Invariant
//!
//! **Two deep-equal JSON values always produce the same canonical bytes,
//! whatever the insertion order of their object keys.**

pub mod canonical;
pub mod encoding;
pub mod hash;
pub mod keys;

pub use canonical::*;
pub use encoding::*;
pub use hash::*;
pub use keys::*;

use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
