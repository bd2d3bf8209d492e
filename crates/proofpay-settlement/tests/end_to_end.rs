//! Intent → quote → payment → payout against an in-memory store

use std::sync::Arc;

use chrono::{Duration, Utc};
use ed25519_dalek::SigningKey;
use proofpay_mandate::*;
use proofpay_settlement::*;
use proofpay_store::{
    acquire_work_lease, Collection, Collections, LeaseRequest, ListQuery, MemoryStore,
    LEDGER_EVENT, MANDATE_RECORD, PAYOUT_REQUEST, SETTLEMENT_RECEIPT, WORK_LEASE,
};
use proofpay_types::{EventStatus, LedgerEvent, PayoutRequest, PayoutRequestStatus, SettlementReceipt};
use rand::rngs::OsRng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const AGENT: &str = "did:web:agent.example";

struct Harness {
    collections: Collections,
    agent: MandateSigner,
    orchestrator: SettlementOrchestrator,
}

fn harness(config: OrchestratorConfig) -> Harness {
    let collections = Collections::standard(Arc::new(MemoryStore::new()));
    let agent = MandateSigner::new("agent#1", SigningKey::generate(&mut OsRng));
    let settler = Arc::new(MandateSigner::new(
        "settler#1",
        SigningKey::generate(&mut OsRng),
    ));
    let resolver: Arc<dyn KeyResolver> = Arc::new(
        StaticKeyResolver::new()
            .with_key("agent#1", agent.verifying_key())
            .with_key("settler#1", settler.verifying_key()),
    );
    let orchestrator =
        SettlementOrchestrator::new(&collections, resolver, settler, config).unwrap();
    Harness {
        collections,
        agent,
        orchestrator,
    }
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        holder: "worker-a".to_string(),
        ..OrchestratorConfig::default()
    }
}

fn intent(signer: &MandateSigner, id: &str, currency: &str, max: Decimal) -> MandateEnvelope {
    let now = Utc::now();
    let intent = IntentMandate::new(
        MandateClaims {
            id: id.to_string(),
            iss: AGENT.to_string(),
            sub: AGENT.to_string(),
            aud: "did:web:proofpay.local".to_string(),
            iat: now,
            exp: now + Duration::minutes(15),
        },
        IntentConstraints {
            currency: currency.to_string(),
            max_amount: max,
            route_preference: "ach".to_string(),
            destination: "acct_owner".to_string(),
        },
    );
    signer.sign_typed(&intent).unwrap()
}

async fn add_event(
    events: &Collection<LedgerEvent>,
    external_id: &str,
    amount: Decimal,
    currency: &str,
    psp_id: Option<&str>,
) -> String {
    let mut event = LedgerEvent::new(amount, currency);
    event.external_id = Some(external_id.to_string());
    event.status = Some(EventStatus::Confirmed);
    event.metadata.psp_transaction_id = psp_id.map(str::to_string);
    events.create(&event).await.unwrap().id
}

#[tokio::test]
async fn test_settles_eligible_revenue_once() {
    let h = harness(config());
    let events: Collection<LedgerEvent> = h.collections.collection(LEDGER_EVENT).unwrap();
    let first = add_event(&events, "ch_1", dec!(150), "USD", Some("pi_1")).await;
    let second = add_event(&events, "ch_2", dec!(150), "USD", Some("pi_2")).await;
    add_event(&events, "ch_3", dec!(200), "EUR", Some("pi_3")).await;
    // No payment reference: never eligible
    add_event(&events, "ch_4", dec!(100), "USD", None).await;
    // Would exceed the intent's maximum
    add_event(&events, "ch_5", dec!(400), "USD", Some("pi_5")).await;

    let envelope = intent(&h.agent, "urn:uuid:intent-1", "USD", dec!(500));
    let outcome = h.orchestrator.settle(&envelope).await.unwrap();
    let settled = outcome.payout().expect("payout emitted");

    assert_eq!(settled.payout.amount, dec!(300));
    assert_eq!(settled.payout.currency, "USD");
    assert_eq!(settled.payout.route, "ach");
    assert_eq!(settled.payout.status, PayoutRequestStatus::Requested);
    assert_eq!(settled.payout.event_ids, vec![first, second]);
    assert!(!settled.deduped);
    assert_eq!(
        settled.states,
        vec![
            SettlementState::IntentVerified,
            SettlementState::LeaseAcquired,
            SettlementState::ItemsSelected,
            SettlementState::QuoteSigned,
            SettlementState::PaymentSigned,
            SettlementState::PayoutEmitted,
        ]
    );

    // The three mandates form one hash chain
    assert_eq!(
        verify_chain(&[envelope.clone(), settled.quote.clone(), settled.payment.clone()]),
        vec![]
    );
    let payment: PaymentMandate = settled.payment.payload_as().unwrap();
    assert_eq!(payment.settlement.amount, dec!(300));
    assert_eq!(
        payment.action.idempotency_key,
        payout_idempotency_key(&settled.payout.quote_id)
    );

    let report = outcome.report();
    assert_eq!(report["ok"], true);
    assert_eq!(report["reason"], "payout_emitted");

    // Re-running the same intent finds everything already written
    let again = h.orchestrator.settle(&envelope).await.unwrap();
    let again = again.payout().expect("payout emitted");
    assert!(again.deduped);
    assert_eq!(again.payout.id, settled.payout.id);
    assert_eq!(again.quote, settled.quote);

    let payouts: Collection<PayoutRequest> = h.collections.collection(PAYOUT_REQUEST).unwrap();
    assert_eq!(payouts.list(&ListQuery::new()).await.unwrap().len(), 1);
    let mandates: Collection<MandateRecord> = h.collections.collection(MANDATE_RECORD).unwrap();
    assert_eq!(mandates.list(&ListQuery::new()).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_events_committed_to_another_intent_are_skipped() {
    let h = harness(config());
    let events: Collection<LedgerEvent> = h.collections.collection(LEDGER_EVENT).unwrap();
    add_event(&events, "ch_1", dec!(150), "USD", Some("pi_1")).await;

    let first = h
        .orchestrator
        .settle(&intent(&h.agent, "urn:uuid:intent-a", "USD", dec!(500)))
        .await
        .unwrap();
    assert!(first.is_emitted());

    let second = h
        .orchestrator
        .settle(&intent(&h.agent, "urn:uuid:intent-b", "USD", dec!(500)))
        .await
        .unwrap();
    assert_eq!(
        second,
        SettlementOutcome::NoEligibleRevenue {
            intent_id: "urn:uuid:intent-b".to_string()
        }
    );
}

#[tokio::test]
async fn test_repeat_settlement_only_commits_new_events_within_cap() {
    let h = harness(config());
    let events: Collection<LedgerEvent> = h.collections.collection(LEDGER_EVENT).unwrap();
    let e1 = add_event(&events, "ch_1", dec!(150), "USD", Some("pi_1")).await;
    let e2 = add_event(&events, "ch_2", dec!(150), "USD", Some("pi_2")).await;
    let envelope = intent(&h.agent, "urn:uuid:intent-1", "USD", dec!(500));

    let first = h.orchestrator.settle(&envelope).await.unwrap();
    let first = first.payout().expect("payout emitted").payout.clone();
    assert_eq!(first.event_ids, vec![e1.clone(), e2.clone()]);

    // New revenue lands between runs of the same intent
    let e3 = add_event(&events, "ch_3", dec!(150), "USD", Some("pi_3")).await;
    add_event(&events, "ch_4", dec!(150), "USD", Some("pi_4")).await;
    let second = h.orchestrator.settle(&envelope).await.unwrap();
    let second = second.payout().expect("payout emitted");
    assert!(!second.deduped);
    assert_ne!(second.payout.id, first.id);
    // Only 200 of the cap is left, so one more event fits
    assert_eq!(second.payout.event_ids, vec![e3]);
    assert_eq!(second.payout.amount, dec!(150));

    // Nothing else fits: a third run replays the latest request
    let third = h.orchestrator.settle(&envelope).await.unwrap();
    let third = third.payout().expect("payout emitted");
    assert!(third.deduped);
    assert_eq!(third.payout.id, second.payout.id);

    let payouts: Collection<PayoutRequest> = h.collections.collection(PAYOUT_REQUEST).unwrap();
    let all = payouts.list(&ListQuery::new()).await.unwrap();
    assert_eq!(all.len(), 2);
    let total: Decimal = all.iter().map(|d| d.value.amount).sum();
    assert_eq!(total, dec!(450));
    let mut held: Vec<String> = all.into_iter().flat_map(|d| d.value.event_ids).collect();
    let count = held.len();
    held.sort();
    held.dedup();
    assert_eq!(held.len(), count);
}

#[tokio::test]
async fn test_rejects_tampered_and_malformed_intents() {
    let h = harness(config());

    let mut tampered = intent(&h.agent, "urn:uuid:intent-t", "USD", dec!(500));
    tampered.payload["constraints"]["max_amount"] = serde_json::json!("5000");
    let outcome = h.orchestrator.settle(&tampered).await.unwrap();
    match outcome {
        SettlementOutcome::IntentInvalid { violations, .. } => {
            assert!(violations.contains(&Violation::BadSignature.as_str().to_string()));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let zero = intent(&h.agent, "urn:uuid:intent-z", "USD", dec!(0));
    let outcome = h.orchestrator.settle(&zero).await.unwrap();
    assert_eq!(outcome.reason(), "intent_invalid");

    let stranger = MandateSigner::new("stranger#1", SigningKey::generate(&mut OsRng));
    let err = h
        .orchestrator
        .settle(&intent(&stranger, "urn:uuid:intent-s", "USD", dec!(500)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SettlementError::Mandate(MandateError::UnknownKid(_))
    ));
}

#[tokio::test]
async fn test_posp_gate_runs_before_any_work() {
    let mut config = config();
    config.posp.min_tx = 1;
    let h = harness(config);
    let events: Collection<LedgerEvent> = h.collections.collection(LEDGER_EVENT).unwrap();
    add_event(&events, "ch_1", dec!(150), "USD", Some("pi_1")).await;
    let envelope = intent(&h.agent, "urn:uuid:intent-p", "USD", dec!(500));

    let outcome = h.orchestrator.settle(&envelope).await.unwrap();
    match &outcome {
        SettlementOutcome::PospInsufficient { enforcement, .. } => {
            assert_eq!(enforcement.reason.as_deref(), Some(POSP_INSUFFICIENT));
            assert_eq!(enforcement.posp.basis.tx_count, 0);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let leases: Collection<proofpay_store::LeaseRecord> =
        h.collections.collection(WORK_LEASE).unwrap();
    assert!(leases.list(&ListQuery::new()).await.unwrap().is_empty());

    let receipts: Collection<SettlementReceipt> =
        h.collections.collection(SETTLEMENT_RECEIPT).unwrap();
    receipts
        .create(&SettlementReceipt {
            id: String::new(),
            agent_id: AGENT.to_string(),
            count: 3,
            amount_total_usd: dec!(120),
            payer: None,
            created_date: None,
        })
        .await
        .unwrap();
    assert!(h.orchestrator.settle(&envelope).await.unwrap().is_emitted());
}

#[tokio::test]
async fn test_lease_held_elsewhere_blocks_settlement() {
    let h = harness(config());
    let events: Collection<LedgerEvent> = h.collections.collection(LEDGER_EVENT).unwrap();
    add_event(&events, "ch_1", dec!(150), "USD", Some("pi_1")).await;

    let leases = h.collections.collection(WORK_LEASE).unwrap();
    let held = acquire_work_lease(
        &leases,
        &LeaseRequest::new("settle:urn:uuid:intent-l", "worker-b", Duration::minutes(5)),
        Utc::now(),
    )
    .await
    .unwrap();
    assert!(held.acquired());

    let outcome = h
        .orchestrator
        .settle(&intent(&h.agent, "urn:uuid:intent-l", "USD", dec!(500)))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SettlementOutcome::LeaseUnavailable {
            intent_id: "urn:uuid:intent-l".to_string(),
            held_by: Some("worker-b".to_string()),
        }
    );
    let payouts: Collection<PayoutRequest> = h.collections.collection(PAYOUT_REQUEST).unwrap();
    assert!(payouts.list(&ListQuery::new()).await.unwrap().is_empty());
}
