//! Ingest → settle → batch → reconcile, with an unreferenced event in the ledger

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use proofpay_autopilot::*;
use proofpay_integrity::{
    ingest_event, EvidenceIntegrityChain, InvariantCore, MoneyMovedGate, ProofValidator,
    WebhookConfirmation,
};
use proofpay_mandate::{
    IntentConstraints, IntentMandate, KeyResolver, MandateClaims, MandateSigner, StaticKeyResolver,
};
use proofpay_resilience::DedupeCache;
use proofpay_settlement::{OrchestratorConfig, SettlementIndex, SettlementOrchestrator};
use proofpay_store::{
    Collection, Collections, ListQuery, MemoryStore, LEDGER_EVENT, PAYOUT_BATCH, SETTLEMENT_INDEX,
    WEBHOOK_EVENT,
};
use proofpay_types::{EventStatus, LedgerEvent, PayoutBatch, PayoutBatchStatus, WebhookEvent};
use rand::rngs::OsRng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Accepts every batch and reports whatever status the test sets
struct Processor {
    status: Mutex<ProcessorBatchStatus>,
}

#[async_trait]
impl ProcessorClient for Processor {
    async fn health(&self) -> Result<()> {
        Ok(())
    }

    async fn submit_batch(
        &self,
        batch: &PayoutBatch,
        _idempotency_key: &str,
    ) -> Result<SubmittedBatch> {
        Ok(SubmittedBatch {
            processor_batch_id: format!("pb_{}", batch.id),
        })
    }

    async fn batch_status(&self, _processor_batch_id: &str) -> Result<ProcessorBatchStatus> {
        Ok(self.status.lock().clone())
    }
}

async fn ingest(
    collections: &Collections,
    external_id: &str,
    amount: Decimal,
    psp_id: Option<&str>,
) -> String {
    let events: Collection<LedgerEvent> = collections.collection(LEDGER_EVENT).unwrap();
    let mut event = LedgerEvent::new(amount, "USD");
    event.external_id = Some(external_id.to_string());
    event.status = Some(EventStatus::Confirmed);
    event.occurred_at = Some(Utc::now() - Duration::minutes(30));
    event.metadata.psp_transaction_id = psp_id.map(str::to_string);
    if let Some(psp_id) = psp_id {
        let webhooks: Collection<WebhookEvent> = collections.collection(WEBHOOK_EVENT).unwrap();
        webhooks
            .create(&WebhookEvent {
                psp_id: psp_id.to_string(),
                event_type: "payment_intent.succeeded".into(),
                received_at: Utc::now(),
            })
            .await
            .unwrap();
    }
    ingest_event(&events, event).await.unwrap().document.id
}

#[tokio::test]
async fn test_unreferenced_revenue_never_reaches_a_payout() {
    let dir = tempfile::tempdir().unwrap();
    let collections = Collections::standard(Arc::new(MemoryStore::new()));

    let paid = vec![
        ingest(&collections, "ch_1", dec!(150), Some("pi_1")).await,
        ingest(&collections, "ch_2", dec!(200), Some("pi_2")).await,
    ];
    // Claims to be confirmed but carries no payment reference
    let ghost = ingest(&collections, "ch_ghost", dec!(100), None).await;
    let events: Collection<LedgerEvent> = collections.collection(LEDGER_EVENT).unwrap();
    let stored = events.get(&ghost).await.unwrap().unwrap().value;
    assert_eq!(stored.status, Some(EventStatus::Hallucination));

    // Settlement
    let agent = MandateSigner::new("agent#1", SigningKey::generate(&mut OsRng));
    let settler = Arc::new(MandateSigner::new("settler#1", SigningKey::generate(&mut OsRng)));
    let resolver: Arc<dyn KeyResolver> = Arc::new(
        StaticKeyResolver::new()
            .with_key("agent#1", agent.verifying_key())
            .with_key("settler#1", settler.verifying_key()),
    );
    let orchestrator = SettlementOrchestrator::new(
        &collections,
        resolver,
        settler,
        OrchestratorConfig {
            holder: "worker-a".to_string(),
            ..OrchestratorConfig::default()
        },
    )
    .unwrap();
    let now = Utc::now();
    let intent = IntentMandate::new(
        MandateClaims {
            id: "urn:uuid:intent-flow".to_string(),
            iss: "did:web:agent.example".to_string(),
            sub: "did:web:agent.example".to_string(),
            aud: "did:web:proofpay.local".to_string(),
            iat: now,
            exp: now + Duration::minutes(15),
        },
        IntentConstraints {
            currency: "USD".to_string(),
            max_amount: dec!(1000),
            route_preference: "ach".to_string(),
            destination: "acct_owner".to_string(),
        },
    );
    let outcome = orchestrator
        .settle(&agent.sign_typed(&intent).unwrap())
        .await
        .unwrap();
    let payout = outcome.payout().expect("payout emitted").payout.clone();
    assert_eq!(payout.event_ids, paid);
    assert_eq!(payout.amount, dec!(350));

    // Autopilot
    let invariants = Arc::new(InvariantCore::new());
    let confirmation = WebhookConfirmation::new(collections.collection(WEBHOOK_EVENT).unwrap());
    let validator = Arc::new(ProofValidator::new(invariants.clone(), Arc::new(confirmation)));
    let evidence = Arc::new(
        EvidenceIntegrityChain::open(dir.path().join("evidence.json"), invariants.clone())
            .await
            .unwrap(),
    );
    let gate = Arc::new(MoneyMovedGate::new(invariants.clone(), validator, evidence.clone()));
    let submissions = Arc::new(
        DedupeCache::load(dir.path().join("submissions.json"), Duration::days(7))
            .await
            .unwrap(),
    );
    let processor = Arc::new(Processor {
        status: Mutex::new(ProcessorBatchStatus::Pending),
    });
    let autopilot = AutonomousControlLoop::new(
        &collections,
        gate,
        invariants.clone(),
        processor.clone(),
        submissions,
        AutopilotConfig {
            approval_delay_secs: 0,
            holder: "autopilot-a".into(),
            ..AutopilotConfig::default()
        },
    )
    .unwrap();

    let first = autopilot.tick_at(Utc::now()).await.unwrap();
    assert_eq!(first.submitted.len(), 1);
    assert_eq!(first.balances["USD"].revenue, dec!(350));
    *processor.status.lock() = ProcessorBatchStatus::Completed;
    let second = autopilot.tick_at(Utc::now()).await.unwrap();
    assert_eq!(second.completed, first.submitted);
    assert!(invariants.tripped_breakers().is_empty());

    let batches: Collection<PayoutBatch> = collections.collection(PAYOUT_BATCH).unwrap();
    let all = batches.list(&ListQuery::new()).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].value.status, PayoutBatchStatus::Completed);
    for batch in &all {
        assert!(!batch.value.event_ids.contains(&ghost));
    }
    assert!(!payout.event_ids.contains(&ghost));

    assert!(!evidence.contains(&ghost).await);
    let index = SettlementIndex::new(collections.collection(SETTLEMENT_INDEX).unwrap());
    assert!(!index.is_settled(&ghost).await.unwrap());
    let ghost_after = events.get(&ghost).await.unwrap().unwrap().value;
    assert_eq!(ghost_after.status, Some(EventStatus::Hallucination));
}
