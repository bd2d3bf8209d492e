//! Payout requests and payout batches
//!
//! A payout request is emitted by the settlement orchestrator once a payment
//! mandate is signed. The control loop groups requests into batches, gets
//! them approved, submits them to the processor and reconciles the result.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Status of a payout request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutRequestStatus {
    Requested,
    Batched,
    Paid,
    Failed,
}

impl PayoutRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Batched => "BATCHED",
            Self::Paid => "PAID",
            Self::Failed => "FAILED",
        }
    }
}

/// Status of a payout batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutBatchStatus {
    PendingApproval,
    Approved,
    NeedsReview,
    Submitted,
    Completed,
    Failed,
}

impl PayoutBatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingApproval => "PENDING_APPROVAL",
            Self::Approved => "APPROVED",
            Self::NeedsReview => "NEEDS_REVIEW",
            Self::Submitted => "SUBMITTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Batches in these states still commit funds
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::PendingApproval | Self::Approved | Self::NeedsReview | Self::Submitted
        )
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A request to pay out settled revenue to a destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Derived from the quote id; unique per settlement
    pub idempotency_key: String,
    pub intent_id: String,
    pub quote_id: String,
    pub payment_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub destination: String,
    pub route: String,
    pub event_ids: Vec<String>,
    pub status: PayoutRequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout_batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<DateTime<Utc>>,
}

impl PayoutRequest {
    /// Key used to group requests into one batch
    pub fn grouping_key(&self) -> (String, String, String) {
        (
            self.destination.clone(),
            self.currency.to_ascii_uppercase(),
            self.route.clone(),
        )
    }
}

/// A group of payout requests submitted to the processor together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutBatch {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Deterministic key over the member request ids
    pub batch_key: String,
    pub recipient: String,
    pub currency: String,
    pub route: String,
    pub total: Decimal,
    pub request_ids: Vec<String>,
    pub event_ids: Vec<String>,
    pub status: PayoutBatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor_batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<DateTime<Utc>>,
}
