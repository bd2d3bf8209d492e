//! ProofPay Mandate - signed, hash-chained authorization messages
//!
//! A settlement is authorized by three mandates, each an Ed25519-signed
//! envelope around a JSON payload:
//!
//! ```text
//! ap2.intent  ──prev_hash──▶  ap2.quote  ──prev_hash──▶  ap2.payment
//! ```
//!
//! # Invariants
//!
//! 1. `prev_hash` of mandate N equals the payload hash of mandate N-1
//! 2. Envelopes are immutable once signed
//! 3. A signer without a configured public key never verifies (fail closed)

pub mod envelope;
pub mod error;
pub mod keys;
pub mod signer;
pub mod verifier;

pub use envelope::*;
pub use error::{MandateError, Result};
pub use keys::*;
pub use signer::*;
pub use verifier::*;
