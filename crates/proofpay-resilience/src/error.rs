//! Resilience errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResilienceError>;

/// HTTP statuses that are retried
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    #[error("Circuit breaker {name:?} is open")]
    CircuitOpen { name: String },

    /// Non-2xx response after retries were exhausted (or not allowed)
    #[error("Processor request failed with HTTP {status} after {attempts} attempt(s): {body}")]
    ProcessorRequestFailure {
        status: u16,
        body: String,
        attempts: u32,
    },

    #[error("Transport error after {attempts} attempt(s): {message}")]
    Transport {
        message: String,
        attempts: u32,
        timed_out: bool,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Dedupe cache I/O failed: {0}")]
    CacheIo(String),
}

impl ResilienceError {
    /// Failures that say something about the remote's health.
    ///
    /// Only these count against a circuit breaker.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ProcessorRequestFailure { status, .. } => RETRYABLE_STATUSES.contains(status),
            Self::Transport { .. } => true,
            _ => false,
        }
    }

    /// The remote could not be reached at all
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// HTTP status, when the remote answered
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ProcessorRequestFailure { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Truncate a response body for error reports (512 characters)
pub fn truncate_body(body: &str) -> String {
    const MAX_CHARS: usize = 512;
    match body.char_indices().nth(MAX_CHARS) {
        Some((idx, _)) => body[..idx].to_string(),
        None => body.to_string(),
    }
}
