//! ProofPay Integrity - nothing counts as paid without proof
//!
//! - [`InvariantCore`]: named invariant breakers that stay tripped for the
//!   process lifetime, with a JSON-lines failure log
//! - [`EvidenceIntegrityChain`]: append-only, hash-chained proof ledger
//! - [`ProofValidator`]: structural, amount, recipient and temporal checks on
//!   a payment proof, with PSP and chain confirmation behind traits
//! - [`MoneyMovedGate`]: the single check every settlement path passes
//! - [`classify_event`] / [`ingest_event`]: the hallucination rule at ingestion
//!
//! Invariant failures are errors whose `Display` is `INVARIANT_FAIL: <reason>`.
//! They are never swallowed in the settlement path; a tripped breaker halts
//! the control loop.

pub mod error;
pub mod evidence;
pub mod gate;
pub mod ingest;
pub mod invariant;
pub mod proof;

pub use error::{IntegrityError, InvariantViolation, Result};
pub use evidence::*;
pub use gate::*;
pub use ingest::*;
pub use invariant::*;
pub use proof::*;
