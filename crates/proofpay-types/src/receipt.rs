//! Settlement receipts and auxiliary settlement records

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Payer attached to a settlement receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Receipt for settled work performed by an agent
///
/// Receipts are the input to the proof-of-settled-performance scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub agent_id: String,
    /// Number of settled items covered by the receipt
    #[serde(default)]
    pub count: u64,
    pub amount_total_usd: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<Payer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<DateTime<Utc>>,
}

impl SettlementReceipt {
    /// Normalized payer email, if any
    pub fn payer_email(&self) -> Option<String> {
        self.payer
            .as_ref()
            .and_then(|p| p.email.as_deref())
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
    }
}

/// Marks one ledger event as settled by a payout batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementIndexMark {
    pub event_id: String,
    pub payout_batch_id: String,
    pub marked_at: DateTime<Utc>,
}

/// Independent confirmation, received from a PSP, that a transaction exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub psp_id: String,
    pub event_type: String,
    pub received_at: DateTime<Utc>,
}
