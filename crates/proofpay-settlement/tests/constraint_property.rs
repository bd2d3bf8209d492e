//! Property tests: a payout never breaks the intent's currency or amount cap.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::SigningKey;
use proofpay_mandate::{
    IntentConstraints, IntentMandate, KeyResolver, MandateClaims, MandateEnvelope, MandateSigner,
    StaticKeyResolver,
};
use proofpay_settlement::{OrchestratorConfig, SettlementOrchestrator, SettlementOutcome};
use proofpay_store::{Collection, Collections, ListQuery, MemoryStore, LEDGER_EVENT, PAYOUT_REQUEST};
use proofpay_types::{EventStatus, LedgerEvent, PayoutRequest};
use proptest::prelude::*;
use rand::rngs::OsRng;
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
struct GeneratedEvent {
    cents: i64,
    currency: &'static str,
    referenced: bool,
}

fn arb_event() -> impl Strategy<Value = GeneratedEvent> {
    (
        1i64..50_000,
        prop_oneof![Just("USD"), Just("usd"), Just("EUR")],
        prop::bool::weighted(0.8),
    )
        .prop_map(|(cents, currency, referenced)| GeneratedEvent {
            cents,
            currency,
            referenced,
        })
}

async fn insert_events(
    events: &Collection<LedgerEvent>,
    generated: Vec<GeneratedEvent>,
    offset: usize,
    by_id: &mut HashMap<String, GeneratedEvent>,
) {
    for (n, event_def) in generated.into_iter().enumerate() {
        let n = n + offset;
        let mut event = LedgerEvent::new(Decimal::new(event_def.cents, 2), event_def.currency);
        event.external_id = Some(format!("ch_{n}"));
        event.status = Some(EventStatus::Confirmed);
        if event_def.referenced {
            event.metadata.psp_transaction_id = Some(format!("pi_{n}"));
        }
        let id = events.create(&event).await.unwrap().id;
        by_id.insert(id, event_def);
    }
}

fn orchestrator(collections: &Collections) -> (MandateSigner, SettlementOrchestrator) {
    let agent = MandateSigner::new("agent#1", SigningKey::generate(&mut OsRng));
    let settler = Arc::new(MandateSigner::new("settler#1", SigningKey::generate(&mut OsRng)));
    let resolver: Arc<dyn KeyResolver> = Arc::new(
        StaticKeyResolver::new()
            .with_key("agent#1", agent.verifying_key())
            .with_key("settler#1", settler.verifying_key()),
    );
    let orchestrator =
        SettlementOrchestrator::new(collections, resolver, settler, OrchestratorConfig::default())
            .unwrap();
    (agent, orchestrator)
}

fn intent_envelope(agent: &MandateSigner, max_cents: i64, now: DateTime<Utc>) -> MandateEnvelope {
    let intent = IntentMandate::new(
        MandateClaims {
            id: "urn:uuid:intent-prop".to_string(),
            iss: "did:web:agent.example".to_string(),
            sub: "did:web:agent.example".to_string(),
            aud: "did:web:proofpay.local".to_string(),
            iat: now,
            exp: now + Duration::minutes(15),
        },
        IntentConstraints {
            currency: "USD".to_string(),
            max_amount: Decimal::new(max_cents, 2),
            route_preference: String::new(),
            destination: "acct_owner".to_string(),
        },
    );
    agent.sign_typed(&intent).unwrap()
}

/// Settle one intent, add more revenue, settle it again; returns every payout request
async fn run_twice(
    first: Vec<GeneratedEvent>,
    later: Vec<GeneratedEvent>,
    max_cents: i64,
) -> (HashMap<String, GeneratedEvent>, Vec<PayoutRequest>) {
    let collections = Collections::standard(Arc::new(MemoryStore::new()));
    let events: Collection<LedgerEvent> = collections.collection(LEDGER_EVENT).unwrap();
    let mut by_id = HashMap::new();
    let offset = first.len();
    insert_events(&events, first, 0, &mut by_id).await;

    let (agent, orchestrator) = orchestrator(&collections);
    let now = Utc::now();
    let envelope = intent_envelope(&agent, max_cents, now);
    orchestrator.settle_at(&envelope, now).await.unwrap();
    insert_events(&events, later, offset, &mut by_id).await;
    orchestrator.settle_at(&envelope, now).await.unwrap();

    let payouts: Collection<PayoutRequest> = collections.collection(PAYOUT_REQUEST).unwrap();
    let requests = payouts
        .list(&ListQuery::new())
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.value)
        .collect();
    (by_id, requests)
}

async fn run(generated: Vec<GeneratedEvent>, max_cents: i64) -> (HashMap<String, GeneratedEvent>, SettlementOutcome) {
    let collections = Collections::standard(Arc::new(MemoryStore::new()));
    let events: Collection<LedgerEvent> = collections.collection(LEDGER_EVENT).unwrap();
    let mut by_id = HashMap::new();
    insert_events(&events, generated, 0, &mut by_id).await;

    let (agent, orchestrator) = orchestrator(&collections);
    let now = Utc::now();
    let envelope = intent_envelope(&agent, max_cents, now);
    let outcome = orchestrator.settle_at(&envelope, now).await.unwrap();
    (by_id, outcome)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Payouts are in the intent currency, within the cap, and exactly the
    /// sum of referenced events in that currency.
    #[test]
    fn payout_respects_intent_constraints(
        generated in prop::collection::vec(arb_event(), 0..12),
        max_cents in 1i64..150_000,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (by_id, outcome) = runtime.block_on(run(generated.clone(), max_cents));
        let max = Decimal::new(max_cents, 2);

        match outcome {
            SettlementOutcome::PayoutEmitted(settled) => {
                let payout = &settled.payout;
                prop_assert_eq!(payout.currency.as_str(), "USD");
                prop_assert_eq!(payout.route.as_str(), "standard");
                prop_assert!(payout.amount <= max);
                prop_assert!(!payout.event_ids.is_empty());

                let mut sum = Decimal::ZERO;
                for id in &payout.event_ids {
                    let event_def = &by_id[id];
                    prop_assert!(event_def.referenced);
                    prop_assert!(event_def.currency.eq_ignore_ascii_case("USD"));
                    sum += Decimal::new(event_def.cents, 2);
                }
                prop_assert_eq!(sum, payout.amount);
            }
            SettlementOutcome::NoEligibleRevenue { .. } => {
                // Nothing eligible fits under the cap
                let fits = generated.iter().any(|s| {
                    s.referenced
                        && s.currency.eq_ignore_ascii_case("USD")
                        && Decimal::new(s.cents, 2) <= max
                });
                prop_assert!(!fits);
            }
            other => prop_assert!(false, "unexpected outcome {:?}", other),
        }
    }

    /// Re-running an intent after new revenue arrives never commits an
    /// event twice or lets the intent's requests exceed its cap.
    #[test]
    fn repeat_settlement_stays_within_cap(
        first in prop::collection::vec(arb_event(), 0..8),
        later in prop::collection::vec(arb_event(), 0..8),
        max_cents in 1i64..150_000,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (by_id, requests) = runtime.block_on(run_twice(first, later, max_cents));
        let max = Decimal::new(max_cents, 2);

        prop_assert!(requests.len() <= 2);
        let total: Decimal = requests.iter().map(|r| r.amount).sum();
        prop_assert!(total <= max);

        let mut seen = HashSet::new();
        for request in &requests {
            let mut sum = Decimal::ZERO;
            for id in &request.event_ids {
                prop_assert!(seen.insert(id.clone()), "event {} committed twice", id);
                let event_def = &by_id[id];
                prop_assert!(event_def.referenced);
                prop_assert!(event_def.currency.eq_ignore_ascii_case("USD"));
                sum += Decimal::new(event_def.cents, 2);
            }
            prop_assert_eq!(sum, request.amount);
        }
    }
}
