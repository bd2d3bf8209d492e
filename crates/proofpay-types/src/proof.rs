//! Payment proofs
//!
//! A payment proof is the evidence that money actually moved for a ledger
//! event. Proofs arrive as loose JSON attached to event metadata; [`PaymentProof`]
//! is the typed view produced once the required fields are known to exist.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::event::EventMetadata;

/// Kind of payment proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofType {
    /// Payment-service-provider transaction (off-chain)
    PspTransaction,
    /// On-chain transfer
    OnchainTx,
    /// Bank transfer reference (off-chain)
    BankReference,
}

impl ProofType {
    /// Parse the wire name of a proof type
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "psp_transaction" => Some(Self::PspTransaction),
            "onchain_tx" => Some(Self::OnchainTx),
            "bank_reference" => Some(Self::BankReference),
            _ => None,
        }
    }

    /// Wire name of the proof type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PspTransaction => "psp_transaction",
            Self::OnchainTx => "onchain_tx",
            Self::BankReference => "bank_reference",
        }
    }

    /// On-chain proofs are verified against a chain, not a PSP
    pub fn is_onchain(&self) -> bool {
        matches!(self, Self::OnchainTx)
    }
}

/// Typed view of a validated payment proof
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentProof {
    #[serde(rename = "type")]
    pub proof_type: ProofType,
    pub amount: Decimal,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psp_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
}

/// Build a proof object from the references carried in event metadata.
///
/// Returns `None` when the metadata has no reference to build from. The
/// synthesized proof is off-chain; a PSP id yields `psp_transaction`, a
/// settlement batch or bank reference yields `bank_reference`.
pub fn synthesize_proof(
    metadata: &EventMetadata,
    amount: Decimal,
    currency: &str,
    timestamp: Option<DateTime<Utc>>,
) -> Option<Value> {
    let psp = metadata
        .psp_transaction_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let (proof_type, psp_id) = match psp {
        Some(id) => (ProofType::PspTransaction, id),
        None => (ProofType::BankReference, metadata.reference_id()?),
    };

    let mut proof = json!({
        "type": proof_type.as_str(),
        "amount": amount.to_string(),
        "currency": currency,
        "psp_id": psp_id,
        "synthesized": true,
    });
    if let Some(ts) = timestamp {
        proof["timestamp"] = Value::String(ts.to_rfc3339());
    }
    Some(proof)
}
