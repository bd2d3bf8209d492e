//! Settlement index
//!
//! One mark per settled ledger event. Marks are written when a payout batch
//! reconciles as completed; an event with a mark is never selected again.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use proofpay_store::{create_idempotent, Collection, CreateOutcome, Filter, ListQuery};
use proofpay_types::SettlementIndexMark;
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct SettlementIndex {
    marks: Collection<SettlementIndexMark>,
}

impl SettlementIndex {
    pub fn new(marks: Collection<SettlementIndexMark>) -> Self {
        Self { marks }
    }

    pub async fn is_settled(&self, event_id: &str) -> Result<bool> {
        Ok(self
            .marks
            .find_one(&Filter::new().eq("event_id", event_id))
            .await?
            .is_some())
    }

    pub async fn settled_event_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .marks
            .list(&ListQuery::new())
            .await?
            .into_iter()
            .map(|d| d.value.event_id)
            .collect())
    }

    /// Mark an event settled; repeated marks for one event are deduped
    pub async fn mark_settled(
        &self,
        event_id: &str,
        payout_batch_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome<SettlementIndexMark>> {
        let mark = SettlementIndexMark {
            event_id: event_id.to_string(),
            payout_batch_id: payout_batch_id.to_string(),
            marked_at: now,
        };
        let outcome = create_idempotent(&self.marks, "event_id", event_id, &mark).await?;
        debug!(
            event_id = %event_id,
            payout_batch_id = %payout_batch_id,
            deduped = outcome.deduped,
            "Settlement index mark"
        );
        Ok(outcome)
    }
}
