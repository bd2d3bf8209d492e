//! Ledger events
//!
//! A ledger event is a single revenue record owned by the external record
//! store. ProofPay never trusts an event on its own: an event only becomes
//! settlement-eligible once it carries a resolvable payment reference.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a ledger event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Recorded but not yet confirmed by the processor
    Pending,
    /// Confirmed revenue
    Confirmed,
    /// No verifiable payment reference; never eligible for settlement
    Hallucination,
    /// Matched against a processor statement
    Reconciled,
    /// Included in a completed payout batch
    PaidOut,
    /// Included in a payout batch the processor rejected
    PayoutFailed,
    /// Reversed by the payer
    Refunded,
}

impl EventStatus {
    /// Wire name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Hallucination => "hallucination",
            Self::Reconciled => "reconciled",
            Self::PaidOut => "paid_out",
            Self::PayoutFailed => "payout_failed",
            Self::Refunded => "refunded",
        }
    }

    /// Statuses that count as recognized revenue
    pub fn is_revenue(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Reconciled | Self::PaidOut)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata attached to a ledger event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Payment-service-provider transaction id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psp_transaction_id: Option<String>,
    /// Processor settlement batch id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_batch_id: Option<String>,
    /// Bank transfer reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_reference: Option<String>,
    /// Attached payment proof, kept raw until validated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Value>,
    /// Payer contact, when the processor reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer_email: Option<String>,
    /// Everything else the upstream system attached
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventMetadata {
    /// First non-empty reference id, in PSP → settlement batch → bank order
    pub fn reference_id(&self) -> Option<&str> {
        [
            self.psp_transaction_id.as_deref(),
            self.settlement_batch_id.as_deref(),
            self.bank_reference.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
    }

    /// Reference carried by the attached proof object (`psp_id` or `tx_hash`)
    pub fn proof_reference(&self) -> Option<&str> {
        let proof = self.proof.as_ref()?.as_object()?;
        ["psp_id", "tx_hash"]
            .into_iter()
            .filter_map(|k| proof.get(k).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

/// A revenue event stored in the external ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Store-assigned record id (empty before the record is created)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Upstream dedupe key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Gross amount
    pub amount: Decimal,
    /// Currency code
    pub currency: String,
    /// Lifecycle status; may be unset on ingestion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    /// When the revenue occurred upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    /// Store-assigned creation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<DateTime<Utc>>,
    /// Payment references and attached proof
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl LedgerEvent {
    /// Build a new event with no status and empty metadata
    pub fn new(amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            external_id: None,
            amount,
            currency: currency.into(),
            status: None,
            occurred_at: None,
            created_date: None,
            metadata: EventMetadata::default(),
        }
    }

    /// Does the event carry any payment reference that can be resolved?
    pub fn has_resolvable_reference(&self) -> bool {
        self.metadata.reference_id().is_some() || self.metadata.proof_reference().is_some()
    }

    /// Non-empty external id, if any
    pub fn resolvable_external_id(&self) -> Option<&str> {
        self.external_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Is the event flagged as a hallucination?
    pub fn is_hallucination(&self) -> bool {
        self.status == Some(EventStatus::Hallucination)
    }

    /// Timestamp used for temporal checks: upstream time, else creation time
    pub fn effective_time(&self) -> Option<DateTime<Utc>> {
        self.occurred_at.or(self.created_date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_reference_resolution_order() {
        let mut meta = EventMetadata::default();
        assert_eq!(meta.reference_id(), None);

        meta.bank_reference = Some("BANK-1".to_string());
        meta.psp_transaction_id = Some("  ".to_string());
        assert_eq!(meta.reference_id(), Some("BANK-1"));

        meta.psp_transaction_id = Some("pi_123".to_string());
        assert_eq!(meta.reference_id(), Some("pi_123"));
    }

    #[test]
    fn test_proof_reference_counts_as_resolvable() {
        let mut event = LedgerEvent::new(dec!(10), "USD");
        assert!(!event.has_resolvable_reference());

        event.metadata.proof = Some(json!({"type": "onchain_tx", "tx_hash": "0xabc"}));
        assert!(event.has_resolvable_reference());
    }

    #[test]
    fn test_event_roundtrip_keeps_extra_metadata() {
        let raw = json!({
            "id": "rec_1",
            "external_id": "ext_1",
            "amount": "150",
            "currency": "USD",
            "status": "confirmed",
            "metadata": {"psp_transaction_id": "pi_1", "channel": "web"}
        });
        let event: LedgerEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.status, Some(EventStatus::Confirmed));
        assert_eq!(event.metadata.extra.get("channel"), Some(&json!("web")));
        assert_eq!(event.amount, dec!(150));
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_value(EventStatus::PayoutFailed).unwrap(),
            json!("payout_failed")
        );
        assert!(EventStatus::Reconciled.is_revenue());
        assert!(!EventStatus::Hallucination.is_revenue());
    }
}
