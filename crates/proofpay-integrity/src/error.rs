//! Integrity errors

use proofpay_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IntegrityError>;

/// A failed invariant. Its breaker has already been tripped when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("INVARIANT_FAIL: {reason}")]
pub struct InvariantViolation {
    /// Name of the tripped breaker
    pub invariant: String,
    /// Machine-readable reason
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    /// Every failure from a full invariant battery
    #[error("INVARIANT_FAIL: {} checks failed: {}", .0.len(), join_reasons(.0))]
    Compound(Vec<InvariantViolation>),

    #[error("Evidence chain I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Proof lookup or chain verification could not run
    #[error("Verification unavailable: {0}")]
    VerifierUnavailable(String),
}

impl IntegrityError {
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant(_) | Self::Compound(_))
    }

    /// Violations carried by this error (empty for operational errors)
    pub fn violations(&self) -> Vec<&InvariantViolation> {
        match self {
            Self::Invariant(v) => vec![v],
            Self::Compound(all) => all.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Stable reason string for structured `ok:false` output
    pub fn reason(&self) -> String {
        match self {
            Self::Invariant(v) => v.reason.clone(),
            Self::Compound(all) => join_reasons(all),
            Self::Io(_) => "evidence_io_error".to_string(),
            Self::Serialization(_) => "serialization_error".to_string(),
            Self::Store(_) => "store_error".to_string(),
            Self::VerifierUnavailable(_) => "verifier_unavailable".to_string(),
        }
    }
}

fn join_reasons(violations: &[InvariantViolation]) -> String {
    violations
        .iter()
        .map(|v| v.reason.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
