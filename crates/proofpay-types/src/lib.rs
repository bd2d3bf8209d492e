//! ProofPay Types - Canonical domain types for proof-gated settlement
//!
//! This crate contains the foundational types shared by every proofpay crate:
//!
//! - Money helpers (decimal amounts, currency codes)
//! - Ledger events and their lifecycle status
//! - Payment proofs (PSP transactions, on-chain transfers, bank references)
//! - Payout requests and payout batches
//! - Settlement receipts consumed by the reputation gate
//!
//! # Invariants
//!
//! 1. Amounts are exact decimals, never floats
//! 2. An event without a resolvable payment reference is a hallucination
//! 3. A proof is bound to exactly one ledger event

pub mod money;
pub mod event;
pub mod proof;
pub mod payout;
pub mod receipt;
pub mod error;

pub use money::*;
pub use event::*;
pub use proof::*;
pub use payout::*;
pub use receipt::*;
pub use error::*;

/// Version of the proofpay types schema
pub const TYPES_VERSION: &str = "0.1.0";
