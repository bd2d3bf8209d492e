//! Ledger event ingestion
//!
//! An event without any resolvable PSP, settlement batch or bank reference
//! is stored with status `hallucination`, whatever status it arrived with.

use proofpay_store::{create_idempotent, Collection, CreateOutcome};
use proofpay_types::{EventStatus, LedgerEvent};
use tracing::warn;

use crate::error::Result;

/// Apply the hallucination rule to an incoming event
pub fn classify_event(mut event: LedgerEvent) -> LedgerEvent {
    if !event.has_resolvable_reference() && !event.is_hallucination() {
        warn!(
            external_id = event.external_id.as_deref().unwrap_or(""),
            amount = %event.amount,
            previous_status = event.status.map_or("unset", |s| s.as_str()),
            "Event has no payment reference, marking as hallucination"
        );
        event.status = Some(EventStatus::Hallucination);
    }
    event
}

/// Classify and store an event, deduplicating on `external_id`
pub async fn ingest_event(
    events: &Collection<LedgerEvent>,
    event: LedgerEvent,
) -> Result<CreateOutcome<LedgerEvent>> {
    let event = classify_event(event);
    let outcome = match event.resolvable_external_id().map(str::to_string) {
        Some(external_id) => create_idempotent(events, "external_id", &external_id, &event).await?,
        None => CreateOutcome {
            document: events.create(&event).await?,
            deduped: false,
        },
    };
    Ok(outcome)
}
