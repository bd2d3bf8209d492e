//! Settlement orchestration
//!
//! Drives one signed intent through the settlement state machine:
//!
//! ```text
//! INTENT_VERIFIED → LEASE_ACQUIRED → ITEMS_SELECTED → QUOTE_SIGNED
//!                 → PAYMENT_SIGNED → PAYOUT_EMITTED
//! ```
//!
//! The intent must verify and its issuer must pass the PoSP gate before a
//! lease is attempted. Quote and payment ids are derived from the intent id
//! and the selected event ids, so a re-run over the same items finds the
//! records written by the first run instead of emitting a second payout.
//!
//! An event held by any payout request that has not failed is never selected
//! again. A re-run of an intent only picks up new events, within whatever is
//! left of its `max_amount`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use proofpay_crypto::{sha256_hex, HASH_PREFIX};
use proofpay_mandate::{
    urn_uuid, Cart, CartItem, IntentMandate, KeyResolver, MandateAction, MandateClaims,
    MandateEnvelope, MandateKind, MandateSigner, MandateVerifier, PaymentMandate, QuoteMandate,
    SettlementTerms, VerifyOptions, DEFAULT_CLOCK_SKEW_MS,
};
use proofpay_store::{
    acquire_work_lease, create_idempotent, Collection, Collections, Document, Filter, LeaseOutcome,
    LeaseRecord, LeaseRequest, ListQuery, LEDGER_EVENT, MANDATE_RECORD, PAYOUT_REQUEST,
    SETTLEMENT_INDEX, SETTLEMENT_RECEIPT, WORK_LEASE,
};
use proofpay_types::{
    normalize_currency, same_currency, EventStatus, LedgerEvent, PayoutRequest,
    PayoutRequestStatus,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SettlementError};
use crate::index::SettlementIndex;
use crate::posp::{PospEnforcement, PospPolicy, ReputationGate};
use crate::record::MandateRecord;

/// Namespace for quote and payment ids
pub const SETTLEMENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a9e_53d4_4b7a_9c0e_8d21_7a4f_b305);

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// DID written as `iss` of quotes and payments
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// Lease holder identity of this process
    #[serde(default = "default_holder")]
    pub holder: String,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: i64,
    #[serde(default = "default_mandate_ttl_secs")]
    pub mandate_ttl_secs: i64,
    #[serde(default = "default_clock_skew_ms")]
    pub clock_skew_ms: i64,
    #[serde(default = "default_settlement_method")]
    pub settlement_method: String,
    /// Route used when the intent states no preference
    #[serde(default = "default_route")]
    pub default_route: String,
    #[serde(default)]
    pub posp: PospPolicy,
}

fn default_issuer() -> String {
    "did:web:proofpay.local".to_string()
}

fn default_holder() -> String {
    format!("proofpay-{}", Uuid::new_v4())
}

fn default_lease_ttl_secs() -> i64 {
    300
}

fn default_mandate_ttl_secs() -> i64 {
    900
}

fn default_clock_skew_ms() -> i64 {
    DEFAULT_CLOCK_SKEW_MS
}

fn default_settlement_method() -> String {
    "payout".to_string()
}

fn default_route() -> String {
    "standard".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            holder: default_holder(),
            lease_ttl_secs: default_lease_ttl_secs(),
            mandate_ttl_secs: default_mandate_ttl_secs(),
            clock_skew_ms: default_clock_skew_ms(),
            settlement_method: default_settlement_method(),
            default_route: default_route(),
            posp: PospPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementState {
    IntentVerified,
    LeaseAcquired,
    ItemsSelected,
    QuoteSigned,
    PaymentSigned,
    PayoutEmitted,
}

/// A completed run
#[derive(Debug, Clone, PartialEq)]
pub struct SettledPayout {
    pub intent_id: String,
    pub quote: MandateEnvelope,
    pub payment: MandateEnvelope,
    pub payout: PayoutRequest,
    /// The payout request already existed
    pub deduped: bool,
    pub states: Vec<SettlementState>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    IntentInvalid {
        intent_id: Option<String>,
        violations: Vec<String>,
    },
    PospInsufficient {
        intent_id: String,
        enforcement: PospEnforcement,
    },
    LeaseUnavailable {
        intent_id: String,
        held_by: Option<String>,
    },
    NoEligibleRevenue {
        intent_id: String,
    },
    PayoutEmitted(Box<SettledPayout>),
}

impl SettlementOutcome {
    pub fn is_emitted(&self) -> bool {
        matches!(self, Self::PayoutEmitted(_))
    }

    pub fn payout(&self) -> Option<&SettledPayout> {
        match self {
            Self::PayoutEmitted(settled) => Some(settled),
            _ => None,
        }
    }

    /// Machine-readable outcome name
    pub fn reason(&self) -> &'static str {
        match self {
            Self::IntentInvalid { .. } => "intent_invalid",
            Self::PospInsufficient { .. } => "posp_insufficient",
            Self::LeaseUnavailable { .. } => "lease_unavailable",
            Self::NoEligibleRevenue { .. } => "no_eligible_revenue",
            Self::PayoutEmitted(_) => "payout_emitted",
        }
    }

    /// Structured `{ok, reason, ...}` report for operators
    pub fn report(&self) -> Value {
        match self {
            Self::IntentInvalid {
                intent_id,
                violations,
            } => json!({
                "ok": false,
                "reason": self.reason(),
                "intentId": intent_id,
                "violations": violations,
            }),
            Self::PospInsufficient {
                intent_id,
                enforcement,
            } => json!({
                "ok": false,
                "reason": self.reason(),
                "intentId": intent_id,
                "posp": enforcement.posp,
            }),
            Self::LeaseUnavailable { intent_id, held_by } => json!({
                "ok": false,
                "reason": self.reason(),
                "intentId": intent_id,
                "heldBy": held_by,
            }),
            Self::NoEligibleRevenue { intent_id } => json!({
                "ok": false,
                "reason": self.reason(),
                "intentId": intent_id,
            }),
            Self::PayoutEmitted(settled) => json!({
                "ok": true,
                "reason": self.reason(),
                "intentId": settled.intent_id,
                "quoteId": settled.payout.quote_id,
                "paymentId": settled.payout.payment_id,
                "payoutRequestId": settled.payout.id,
                "amount": settled.payout.amount,
                "currency": settled.payout.currency,
                "deduped": settled.deduped,
                "states": settled.states,
            }),
        }
    }
}

pub struct SettlementOrchestrator {
    verifier: MandateVerifier<Arc<dyn KeyResolver>>,
    signer: Arc<MandateSigner>,
    events: Collection<LedgerEvent>,
    mandates: Collection<MandateRecord>,
    payouts: Collection<PayoutRequest>,
    leases: Collection<LeaseRecord>,
    index: SettlementIndex,
    reputation: ReputationGate,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for SettlementOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementOrchestrator")
            .field("signer", &self.signer)
            .field("config", &self.config)
            .finish()
    }
}

impl SettlementOrchestrator {
    pub fn new(
        collections: &Collections,
        resolver: Arc<dyn KeyResolver>,
        signer: Arc<MandateSigner>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        Ok(Self {
            verifier: MandateVerifier::new(resolver),
            signer,
            events: collections.collection(LEDGER_EVENT)?,
            mandates: collections.collection(MANDATE_RECORD)?,
            payouts: collections.collection(PAYOUT_REQUEST)?,
            leases: collections.collection(WORK_LEASE)?,
            index: SettlementIndex::new(collections.collection(SETTLEMENT_INDEX)?),
            reputation: ReputationGate::new(
                collections.collection(SETTLEMENT_RECEIPT)?,
                config.posp.clone(),
            ),
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn settle(&self, intent: &MandateEnvelope) -> Result<SettlementOutcome> {
        self.settle_at(intent, Utc::now()).await
    }

    pub async fn settle_at(
        &self,
        intent_envelope: &MandateEnvelope,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome> {
        let mut states = Vec::new();

        // Verification; an unknown kid is an error, not a violation
        let options =
            VerifyOptions::at(now).with_clock_skew(Duration::milliseconds(self.config.clock_skew_ms));
        let report = self.verifier.verify_envelope(intent_envelope, options)?;
        let intent_id = intent_envelope.mandate_id().map(str::to_string);
        if !report.ok {
            let violations = report.violations.iter().map(|v| v.as_str().to_string()).collect();
            warn!(intent_id = ?intent_id, violations = ?report.violations, "Intent rejected");
            return Ok(SettlementOutcome::IntentInvalid {
                intent_id,
                violations,
            });
        }
        let intent = match parse_intent(intent_envelope) {
            Ok(intent) => intent,
            Err(problem) => {
                warn!(intent_id = ?intent_id, problem = %problem, "Intent rejected");
                return Ok(SettlementOutcome::IntentInvalid {
                    intent_id,
                    violations: vec![problem],
                });
            }
        };
        let intent_id = intent.claims.id.clone();
        states.push(SettlementState::IntentVerified);
        info!(intent_id = %intent_id, kid = ?report.kid, "Intent verified");

        let enforcement = self.reputation.evaluate(&intent.claims.iss, now).await?;
        if !enforcement.ok {
            return Ok(SettlementOutcome::PospInsufficient {
                intent_id,
                enforcement,
            });
        }

        let lease_request = LeaseRequest::new(
            format!("settle:{intent_id}"),
            self.config.holder.clone(),
            Duration::seconds(self.config.lease_ttl_secs),
        )
        .with_meta(json!({"intent_id": intent_id}));
        match acquire_work_lease(&self.leases, &lease_request, now).await? {
            LeaseOutcome::Acquired { .. } => {}
            LeaseOutcome::Unavailable { held_by, reason, .. } => {
                info!(intent_id = %intent_id, held_by = ?held_by, reason = ?reason, "Settlement lease unavailable");
                return Ok(SettlementOutcome::LeaseUnavailable { intent_id, held_by });
            }
        }
        states.push(SettlementState::LeaseAcquired);
        self.persist_mandate(&intent_id, intent_envelope.clone())
            .await?;

        let constraints = &intent.constraints;
        let currency = normalize_currency(&constraints.currency)
            .map_err(|e| SettlementError::Constraint(e.to_string()))?;
        let live = self.live_payouts().await?;
        let own: Vec<&Document<PayoutRequest>> =
            live.iter().filter(|d| d.value.intent_id == intent_id).collect();
        let requested: Decimal = own.iter().map(|d| d.value.amount).sum();
        let remaining = constraints.max_amount - requested;
        let committed: HashSet<&str> = live
            .iter()
            .flat_map(|d| d.value.event_ids.iter().map(String::as_str))
            .collect();

        let candidates = self
            .eligible_events(&constraints.currency, &committed)
            .await?;
        let selected = select_items(&candidates, remaining);
        let items: Vec<CartItem> = if !selected.is_empty() {
            selected
                .iter()
                .map(|e| cart_item(e, &currency))
                .collect()
        } else if let Some(latest) = own.iter().max_by_key(|d| (d.created_date, d.id.clone())) {
            // Nothing new fits; replay the intent's latest request so retries dedupe
            debug!(
                intent_id = %intent_id,
                payout_request_id = %latest.id,
                "Replaying existing payout request"
            );
            self.request_items(&latest.value, &currency).await?
        } else {
            info!(
                intent_id = %intent_id,
                candidates = candidates.len(),
                max_amount = %constraints.max_amount,
                "No eligible revenue"
            );
            return Ok(SettlementOutcome::NoEligibleRevenue { intent_id });
        };
        let cart = Cart::from_items(currency.clone(), items);
        check_cart(&cart, &intent)?;
        states.push(SettlementState::ItemsSelected);
        debug!(intent_id = %intent_id, items = cart.items.len(), total = %cart.total, "Items selected");

        let event_ids: Vec<String> = cart.items.iter().map(|i| i.event_id.clone()).collect();
        let (quote_id, payment_id) = derive_mandate_ids(&intent_id, &event_ids);

        let quote = QuoteMandate::new(
            self.claims(quote_id.clone(), &intent, now),
            intent_envelope.payload_hash(),
            intent_id.clone(),
            cart,
        );
        let quote_envelope = self
            .persist_mandate(&intent_id, self.signer.sign_typed(&quote)?)
            .await?;
        let quote: QuoteMandate = quote_envelope.payload_as()?;
        check_cart(&quote.cart, &intent)?;
        states.push(SettlementState::QuoteSigned);
        info!(intent_id = %intent_id, quote_id = %quote_id, total = %quote.cart.total, "Quote signed");

        let route = if constraints.route_preference.trim().is_empty() {
            self.config.default_route.clone()
        } else {
            constraints.route_preference.clone()
        };
        let payout_key = payout_idempotency_key(&quote_id);
        let payment = PaymentMandate::new(
            self.claims(payment_id.clone(), &intent, now),
            quote_envelope.payload_hash(),
            intent_id.clone(),
            quote_id.clone(),
            SettlementTerms {
                method: self.config.settlement_method.clone(),
                currency: currency.clone(),
                amount: quote.cart.total,
                destination_hash: destination_hash(&constraints.destination),
            },
            MandateAction {
                kind: "create".to_string(),
                entity: PAYOUT_REQUEST.to_string(),
                idempotency_key: payout_key.clone(),
                data: json!({
                    "amount": quote.cart.total,
                    "currency": currency,
                    "destination": constraints.destination,
                    "route": route,
                    "event_ids": event_ids,
                }),
            },
        );
        let payment_envelope = self
            .persist_mandate(&intent_id, self.signer.sign_typed(&payment)?)
            .await?;
        let payment: PaymentMandate = payment_envelope.payload_as()?;
        if payment.settlement.amount != quote.cart.total
            || !same_currency(&payment.settlement.currency, &quote.cart.currency)
        {
            return Err(SettlementError::Constraint(format!(
                "payment {} {} does not match quote total {} {}",
                payment.settlement.amount,
                payment.settlement.currency,
                quote.cart.total,
                quote.cart.currency
            )));
        }
        states.push(SettlementState::PaymentSigned);
        info!(intent_id = %intent_id, payment_id = %payment_id, amount = %payment.settlement.amount, "Payment signed");

        let request = PayoutRequest {
            id: String::new(),
            idempotency_key: payout_key.clone(),
            intent_id: intent_id.clone(),
            quote_id: quote_id.clone(),
            payment_id: payment_id.clone(),
            amount: payment.settlement.amount,
            currency: payment.settlement.currency.clone(),
            destination: constraints.destination.clone(),
            route,
            event_ids,
            status: PayoutRequestStatus::Requested,
            payout_batch_id: None,
            created_date: None,
        };
        let outcome =
            create_idempotent(&self.payouts, "idempotency_key", &payout_key, &request).await?;
        let payout = outcome.document.value;
        if payout.amount != payment.settlement.amount || payout.amount > constraints.max_amount {
            return Err(SettlementError::Constraint(format!(
                "payout {} does not match payment {}",
                payout.amount, payment.settlement.amount
            )));
        }
        states.push(SettlementState::PayoutEmitted);
        info!(
            intent_id = %intent_id,
            payout_request_id = %payout.id,
            amount = %payout.amount,
            currency = %payout.currency,
            deduped = outcome.deduped,
            "Payout request emitted"
        );

        Ok(SettlementOutcome::PayoutEmitted(Box::new(SettledPayout {
            intent_id,
            quote: quote_envelope,
            payment: payment_envelope,
            payout,
            deduped: outcome.deduped,
            states,
        })))
    }

    fn claims(&self, id: String, intent: &IntentMandate, now: DateTime<Utc>) -> MandateClaims {
        MandateClaims {
            id,
            iss: self.config.issuer.clone(),
            sub: intent.claims.sub.clone(),
            aud: intent.claims.iss.clone(),
            iat: now,
            exp: now + Duration::seconds(self.config.mandate_ttl_secs),
        }
    }

    /// Store a signed mandate once; returns the stored envelope
    async fn persist_mandate(
        &self,
        intent_id: &str,
        envelope: MandateEnvelope,
    ) -> Result<MandateEnvelope> {
        let record = MandateRecord::new(intent_id, envelope).ok_or_else(|| {
            SettlementError::Constraint("signed mandate has no id or type".to_string())
        })?;
        let key = record.idempotency_key.clone();
        let outcome = create_idempotent(&self.mandates, "idempotency_key", &key, &record).await?;
        if outcome.deduped {
            debug!(mandate_id = %record.mandate_id, "Mandate already stored");
        }
        Ok(outcome.document.value.envelope)
    }

    /// Confirmed or reconciled events in creation order, minus settled and
    /// committed ones
    async fn eligible_events(
        &self,
        currency: &str,
        committed: &HashSet<&str>,
    ) -> Result<Vec<LedgerEvent>> {
        let mut candidates = Vec::new();
        for status in [EventStatus::Confirmed, EventStatus::Reconciled] {
            candidates.extend(
                self.events
                    .filter(
                        &Filter::new().eq("status", status.as_str()),
                        &ListQuery::oldest_first(),
                    )
                    .await?,
            );
        }
        candidates.sort_by(|a, b| {
            a.created_date
                .cmp(&b.created_date)
                .then_with(|| a.id.cmp(&b.id))
        });

        let settled = self.index.settled_event_ids().await?;
        Ok(candidates
            .into_iter()
            .map(|doc| doc.value)
            .filter(|e| {
                !e.is_hallucination()
                    && e.has_resolvable_reference()
                    && e.resolvable_external_id().is_some()
                    && same_currency(&e.currency, currency)
                    && e.amount > Decimal::ZERO
                    && !settled.contains(&e.id)
                    && !committed.contains(e.id.as_str())
            })
            .collect())
    }

    /// Payout requests of any intent that still hold their events
    async fn live_payouts(&self) -> Result<Vec<Document<PayoutRequest>>> {
        Ok(self
            .payouts
            .list(&ListQuery::oldest_first())
            .await?
            .into_iter()
            .filter(|doc| doc.value.status != PayoutRequestStatus::Failed)
            .collect())
    }

    /// Cart items of a stored request, in its event order
    async fn request_items(
        &self,
        request: &PayoutRequest,
        currency: &str,
    ) -> Result<Vec<CartItem>> {
        let mut items = Vec::with_capacity(request.event_ids.len());
        for event_id in &request.event_ids {
            let event = self.events.get(event_id).await?.ok_or_else(|| {
                SettlementError::Constraint(format!(
                    "payout request {} references missing event {event_id}",
                    request.id
                ))
            })?;
            let mut event = event.value;
            event.id = event_id.clone();
            items.push(cart_item(&event, currency));
        }
        Ok(items)
    }
}

fn cart_item(event: &LedgerEvent, currency: &str) -> CartItem {
    CartItem {
        event_id: event.id.clone(),
        external_id: event.external_id.clone(),
        amount: event.amount,
        currency: currency.to_string(),
    }
}

fn parse_intent(envelope: &MandateEnvelope) -> std::result::Result<IntentMandate, String> {
    if envelope.kind() != Some(MandateKind::Intent) {
        return Err("not_an_intent".to_string());
    }
    let intent: IntentMandate = envelope
        .payload_as()
        .map_err(|e| format!("invalid_intent_payload: {e}"))?;
    let constraints = &intent.constraints;
    if normalize_currency(&constraints.currency).is_err() {
        return Err(format!("invalid_currency: {}", constraints.currency));
    }
    if constraints.max_amount <= Decimal::ZERO {
        return Err(format!("invalid_max_amount: {}", constraints.max_amount));
    }
    if constraints.destination.trim().is_empty() {
        return Err("missing_destination".to_string());
    }
    Ok(intent)
}

/// Greedy selection in the given order, skipping items that would exceed `max_amount`
pub fn select_items(candidates: &[LedgerEvent], max_amount: Decimal) -> Vec<&LedgerEvent> {
    let mut total = Decimal::ZERO;
    let mut selected = Vec::new();
    for event in candidates {
        if event.amount <= Decimal::ZERO {
            continue;
        }
        if total + event.amount <= max_amount {
            total += event.amount;
            selected.push(event);
        }
    }
    selected
}

fn check_cart(cart: &Cart, intent: &IntentMandate) -> Result<()> {
    let constraints = &intent.constraints;
    if let Some(item) = cart
        .items
        .iter()
        .find(|i| !same_currency(&i.currency, &constraints.currency))
    {
        return Err(SettlementError::Constraint(format!(
            "item {} is in {}, intent allows {}",
            item.event_id, item.currency, constraints.currency
        )));
    }
    if !same_currency(&cart.currency, &constraints.currency) {
        return Err(SettlementError::Constraint(format!(
            "cart currency {} does not match intent currency {}",
            cart.currency, constraints.currency
        )));
    }
    if !cart.is_balanced() {
        return Err(SettlementError::Constraint(
            "cart total is not the sum of its items".to_string(),
        ));
    }
    if cart.total > constraints.max_amount {
        return Err(SettlementError::Constraint(format!(
            "cart total {} exceeds max_amount {}",
            cart.total, constraints.max_amount
        )));
    }
    Ok(())
}

/// Quote and payment ids for an intent and a set of events
pub fn derive_mandate_ids(intent_id: &str, event_ids: &[String]) -> (String, String) {
    let mut sorted: Vec<&str> = event_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let basis = format!("{intent_id}|{}", sorted.join(","));
    let quote = Uuid::new_v5(&SETTLEMENT_NAMESPACE, format!("quote|{basis}").as_bytes());
    let payment = Uuid::new_v5(&SETTLEMENT_NAMESPACE, format!("payment|{basis}").as_bytes());
    (urn_uuid(quote), urn_uuid(payment))
}

pub fn payout_idempotency_key(quote_id: &str) -> String {
    format!("payout:{quote_id}")
}

fn destination_hash(destination: &str) -> String {
    format!("{HASH_PREFIX}{}", sha256_hex(destination.trim().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn event(id: &str, amount: Decimal) -> LedgerEvent {
        let mut e = LedgerEvent::new(amount, "USD");
        e.id = id.to_string();
        e
    }

    #[test]
    fn test_greedy_selection_skips_oversized_items() {
        let events = [
            event("a", dec!(150)),
            event("b", dec!(400)),
            event("c", dec!(150)),
            event("d", dec!(250)),
        ];
        let ids: Vec<_> = select_items(&events, dec!(500))
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(ids, ["a", "c"]);
        assert!(select_items(&events, dec!(100)).is_empty());
    }

    #[test]
    fn test_mandate_ids_ignore_event_order() {
        let a = derive_mandate_ids("urn:uuid:i", &["e2".into(), "e1".into()]);
        let b = derive_mandate_ids("urn:uuid:i", &["e1".into(), "e2".into()]);
        assert_eq!(a, b);
        assert_ne!(a.0, a.1);
        assert!(a.0.starts_with("urn:uuid:"));
        assert_ne!(a, derive_mandate_ids("urn:uuid:j", &["e1".into(), "e2".into()]));
    }

    #[test]
    fn test_outcome_reports() {
        let outcome = SettlementOutcome::LeaseUnavailable {
            intent_id: "i".into(),
            held_by: Some("h".into()),
        };
        let report = outcome.report();
        assert_eq!(report["ok"], false);
        assert_eq!(report["reason"], "lease_unavailable");
        assert_eq!(report["heldBy"], "h");
    }
}
