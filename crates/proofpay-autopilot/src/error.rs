//! Control loop errors

use proofpay_integrity::IntegrityError;
use proofpay_resilience::ResilienceError;
use proofpay_settlement::SettlementError;
use proofpay_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AutopilotError>;

#[derive(Debug, Error)]
pub enum AutopilotError {
    /// An invariant breaker is tripped; the loop must stop
    #[error("Invariant halt: {}", .breakers.join(", "))]
    InvariantHalt { breakers: Vec<String> },

    #[error(transparent)]
    Integrity(IntegrityError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Processor(#[from] ResilienceError),

    /// The processor answered with something we cannot use
    #[error("Invalid processor response: {0}")]
    ProcessorResponse(String),

    #[error("Loop state I/O error: {0}")]
    StateIo(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AutopilotError {
    pub fn is_invariant_halt(&self) -> bool {
        matches!(self, Self::InvariantHalt { .. })
    }
}

impl From<IntegrityError> for AutopilotError {
    fn from(err: IntegrityError) -> Self {
        match err {
            IntegrityError::Invariant(v) => Self::InvariantHalt {
                breakers: vec![v.invariant],
            },
            IntegrityError::Compound(vs) => Self::InvariantHalt {
                breakers: vs.into_iter().map(|v| v.invariant).collect(),
            },
            other => Self::Integrity(other),
        }
    }
}
