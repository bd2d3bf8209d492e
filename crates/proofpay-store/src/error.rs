//! Store errors

use proofpay_resilience::ResilienceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Invalid field map: {0}")]
    InvalidFieldMap(String),

    #[error("{entity} record is missing required field {field}")]
    MissingField { entity: String, field: String },

    #[error("{entity} record not found: {id}")]
    NotFound { entity: String, id: String },

    /// Unique constraint or version mismatch
    #[error("Conflict on {entity}: {message}")]
    Conflict { entity: String, message: String },

    /// The backend could not be reached
    #[error("Store unreachable: {0}")]
    Network(String),

    #[error("Store backend error (HTTP {status}): {message}")]
    Backend { status: u16, message: String },

    #[error("Store I/O error: {0}")]
    Io(String),

    #[error("Failed to decode {entity} record: {message}")]
    Decode { entity: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Network-shaped failures trigger the offline fallback
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl StoreError {
    pub(crate) fn from_http(entity: &str, id: Option<&str>, e: ResilienceError) -> Self {
        match e {
            ResilienceError::Transport { message, .. } => StoreError::Network(message),
            ResilienceError::CircuitOpen { name } => {
                StoreError::Network(format!("circuit breaker {name:?} is open"))
            }
            ResilienceError::ProcessorRequestFailure { status: 404, .. } => StoreError::NotFound {
                entity: entity.to_string(),
                id: id.unwrap_or_default().to_string(),
            },
            ResilienceError::ProcessorRequestFailure {
                status: status @ (409 | 412),
                body,
                ..
            } => StoreError::Conflict {
                entity: entity.to_string(),
                message: format!("HTTP {status}: {body}"),
            },
            ResilienceError::ProcessorRequestFailure { status, body, .. } => StoreError::Backend {
                status,
                message: body,
            },
            other => StoreError::Backend {
                status: 0,
                message: other.to_string(),
            },
        }
    }
}
