//! ProofPay Autopilot - the payout control loop
//!
//! [`AutonomousControlLoop`] turns payout requests emitted by settlement into
//! processor batches and reconciles them, one tick at a time. Every event a
//! batch pays out must pass the money-moved gate first; a tripped invariant
//! stops the loop.

pub mod config;
pub mod control;
pub mod error;
pub mod processor;
pub mod report;
pub mod state;

pub use config::AutopilotConfig;
pub use control::{AutonomousControlLoop, PAYOUT_LEASE_KEY};
pub use error::{AutopilotError, Result};
pub use processor::*;
pub use report::*;
pub use state::LoopState;
