//! ProofPay Settlement - from a signed intent to a payout request
//!
//! - [`SettlementOrchestrator`]: verifies an AP2 intent, takes a work lease,
//!   selects eligible ledger events, signs the quote and payment mandates and
//!   emits exactly one payout request per quote
//! - [`ReputationGate`]: Proof-of-Settled-Performance scoring over settlement
//!   receipts, enforced before any settlement work starts
//! - [`SettlementIndex`]: marks events settled once their payout completes

pub mod error;
pub mod index;
pub mod orchestrator;
pub mod posp;
pub mod record;

pub use error::{Result, SettlementError};
pub use index::SettlementIndex;
pub use orchestrator::*;
pub use posp::*;
pub use record::MandateRecord;
