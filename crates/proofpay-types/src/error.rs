//! Error types for ProofPay domain values

use thiserror::Error;

/// Result type for domain conversions
pub type Result<T> = std::result::Result<T, TypesError>;

/// Errors raised while interpreting domain values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypesError {
    /// A currency code was empty or malformed
    #[error("Invalid currency code: {0:?}")]
    InvalidCurrency(String),

    /// A JSON value could not be read as an exact decimal amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// A proof object is missing a required field or carries a bad value
    #[error("Malformed proof: {0}")]
    MalformedProof(String),
}
