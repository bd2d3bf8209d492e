//! ProofPay Resilience - failure containment for outbound calls
//!
//! - [`CircuitBreaker`]: named closed/open/half-open breaker
//! - [`RetryingClient`]: bounded retry with jittered backoff, inside a breaker
//! - [`DedupeCache`]: TTL'd key set persisted to a JSON file
//!
//! All three are constructed once at process start and shared through
//! `Arc`; their local state sits behind `parking_lot` mutexes.

pub mod breaker;
pub mod dedupe;
pub mod error;
pub mod retry;

pub use breaker::*;
pub use dedupe::*;
pub use error::{ResilienceError, Result};
pub use retry::*;
