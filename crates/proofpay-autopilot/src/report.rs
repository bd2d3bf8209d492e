//! What one tick saw and did

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub processor_ok: bool,
    pub store_ok: bool,
    /// Serving from the offline fallback
    pub store_offline: bool,
    /// Backend serving requests after the check (`http`, `file`, ...)
    pub store_backend: String,
}

/// Balance of one currency
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyBalance {
    /// Confirmed, reconciled and paid-out revenue with an evidence block
    pub revenue: Decimal,
    pub paid_out: Decimal,
    /// Totals of batches that are not yet terminal
    pub committed: Decimal,
    /// Revenue not yet bound into the evidence chain; never available
    pub unproven: Decimal,
    pub available: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    StuckBatch,
    StuckRequest,
    BatchNeedsReview,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StuckBatch => "stuck_batch",
            Self::StuckRequest => "stuck_request",
            Self::BatchNeedsReview => "batch_needs_review",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub subject_id: String,
    pub age_secs: i64,
    pub message: String,
}

impl Alert {
    /// Dedupe key
    pub fn subject(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.subject_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: u64,
    pub started_at: DateTime<Utc>,
    pub health: HealthReport,
    pub balances: BTreeMap<String, CurrencyBalance>,
    pub alerts: Vec<Alert>,
    pub batches_created: Vec<String>,
    pub approved: Vec<String>,
    pub needs_review: Vec<String>,
    pub submitted: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Tasks that did not run and why
    pub skipped: Vec<String>,
}

impl TickReport {
    pub fn new(tick: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            tick,
            started_at,
            health: HealthReport::default(),
            balances: BTreeMap::new(),
            alerts: Vec::new(),
            batches_created: Vec::new(),
            approved: Vec::new(),
            needs_review: Vec::new(),
            submitted: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn available(&self, currency: &str) -> Decimal {
        self.balances
            .get(&currency.to_ascii_uppercase())
            .map_or(Decimal::ZERO, |b| b.available)
    }

    pub(crate) fn skip(&mut self, task: &str, reason: impl AsRef<str>) {
        self.skipped.push(format!("{task}: {}", reason.as_ref()));
    }
}
