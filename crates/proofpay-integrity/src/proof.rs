//! Payment proof validation
//!
//! [`ProofValidator::assert_valid`] decides whether the proof attached to a
//! ledger event is evidence that money moved. Checks run in a fixed order
//! and the first failure trips its invariant breaker:
//!
//! 1. proof present (synthesized once from metadata references if absent)
//! 2. `type`, numeric `amount`, non-empty `currency`
//! 3. on-chain: `tx_hash` and `recipient`, confirmed by a [`ChainVerifier`];
//!    off-chain: `psp_id`, confirmed by a [`PspConfirmation`] source
//! 4. event amount equals proof amount exactly
//! 5. `recipient`, when present, is on the owner allow-list
//! 6. `timestamp` present, parseable and not in the future

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use proofpay_store::{Collection, Filter};
use proofpay_types::{
    decimal_from_json, same_currency, synthesize_proof, LedgerEvent, PaymentProof, ProofType,
    WebhookEvent,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{IntegrityError, InvariantViolation, Result};
use crate::invariant::InvariantCore;

/// Allowed drift between a proof timestamp and the local clock
pub const DEFAULT_PROOF_CLOCK_SKEW_MS: i64 = 300_000;

/// How a proof that predates its event is treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalPolicy {
    /// Reject the proof
    Strict,
    /// Log a warning and accept
    #[default]
    Advisory,
}

/// An on-chain transfer to confirm
#[derive(Debug, Clone, PartialEq)]
pub struct OnchainTransfer {
    pub tx_hash: String,
    pub recipient: String,
    pub amount: Decimal,
    pub currency: String,
    pub chain: Option<String>,
}

#[async_trait]
pub trait ChainVerifier: Send + Sync {
    /// Does the transfer exist on chain as described?
    async fn verify_transfer(&self, transfer: &OnchainTransfer) -> Result<bool>;
}

/// Chain verifier for deployments without chain access; every on-chain proof fails
#[derive(Debug, Default, Clone, Copy)]
pub struct NoChainVerifier;

#[async_trait]
impl ChainVerifier for NoChainVerifier {
    async fn verify_transfer(&self, _transfer: &OnchainTransfer) -> Result<bool> {
        Err(IntegrityError::VerifierUnavailable(
            "no chain verifier configured".to_string(),
        ))
    }
}

#[async_trait]
pub trait PspConfirmation: Send + Sync {
    /// Has the PSP independently confirmed this transaction?
    async fn is_confirmed(&self, psp_id: &str) -> Result<bool>;
}

/// Confirms PSP transactions through received webhook events
#[derive(Debug, Clone)]
pub struct WebhookConfirmation {
    webhooks: Collection<WebhookEvent>,
}

impl WebhookConfirmation {
    pub fn new(webhooks: Collection<WebhookEvent>) -> Self {
        Self { webhooks }
    }
}

#[async_trait]
impl PspConfirmation for WebhookConfirmation {
    async fn is_confirmed(&self, psp_id: &str) -> Result<bool> {
        Ok(self
            .webhooks
            .find_one(&Filter::new().eq("psp_id", psp_id))
            .await?
            .is_some())
    }
}

pub struct ProofValidator {
    invariants: Arc<InvariantCore>,
    psp: Arc<dyn PspConfirmation>,
    chain: Arc<dyn ChainVerifier>,
    allowed_recipients: HashSet<String>,
    temporal: TemporalPolicy,
    clock_skew: Duration,
}

impl ProofValidator {
    pub fn new(invariants: Arc<InvariantCore>, psp: Arc<dyn PspConfirmation>) -> Self {
        Self {
            invariants,
            psp,
            chain: Arc::new(NoChainVerifier),
            allowed_recipients: HashSet::new(),
            temporal: TemporalPolicy::default(),
            clock_skew: Duration::milliseconds(DEFAULT_PROOF_CLOCK_SKEW_MS),
        }
    }

    pub fn with_chain_verifier(mut self, chain: Arc<dyn ChainVerifier>) -> Self {
        self.chain = chain;
        self
    }

    /// Recipients (addresses or account ids) owned by the operator
    pub fn with_allowed_recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_recipients = recipients
            .into_iter()
            .map(|r| r.as_ref().trim().to_ascii_lowercase())
            .filter(|r| !r.is_empty())
            .collect();
        self
    }

    pub fn with_temporal_policy(mut self, policy: TemporalPolicy) -> Self {
        self.temporal = policy;
        self
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    pub fn invariants(&self) -> &Arc<InvariantCore> {
        &self.invariants
    }

    /// Proof attached to the event, or one synthesized from its references
    pub fn effective_proof(event: &LedgerEvent) -> Option<Value> {
        event.metadata.proof.clone().or_else(|| {
            synthesize_proof(
                &event.metadata,
                event.amount,
                &event.currency,
                event.effective_time(),
            )
        })
    }

    pub async fn assert_valid(&self, event: &LedgerEvent) -> Result<PaymentProof> {
        self.assert_valid_at(event, Utc::now()).await
    }

    pub async fn assert_valid_at(
        &self,
        event: &LedgerEvent,
        now: DateTime<Utc>,
    ) -> Result<PaymentProof> {
        let proof = Self::effective_proof(event)
            .ok_or_else(|| self.fail("proof_present", format!("proof_missing: {}", event.id)))?;
        let fields = proof
            .as_object()
            .ok_or_else(|| self.fail("proof_shape", "proof_not_object"))?;

        let proof_type = match str_field(fields, "type") {
            None => return Err(self.fail("proof_type", "proof_type_missing").into()),
            Some(t) => ProofType::parse(t)
                .ok_or_else(|| self.fail("proof_type", format!("proof_type_unknown: {t}")))?,
        };
        let amount = fields
            .get("amount")
            .and_then(|a| decimal_from_json(a).ok())
            .ok_or_else(|| self.fail("proof_amount", "proof_amount_not_numeric"))?;
        let currency = str_field(fields, "currency")
            .ok_or_else(|| self.fail("proof_currency", "proof_currency_missing"))?;

        let recipient = str_field(fields, "recipient");
        let mut psp_id = None;
        let mut tx_hash = None;
        if proof_type.is_onchain() {
            let (Some(hash), Some(to)) = (str_field(fields, "tx_hash"), recipient) else {
                return Err(self
                    .fail("onchain_reference", "onchain_proof_incomplete")
                    .into());
            };
            let transfer = OnchainTransfer {
                tx_hash: hash.to_string(),
                recipient: to.to_string(),
                amount,
                currency: currency.to_string(),
                chain: str_field(fields, "chain").map(str::to_string),
            };
            let verified = self.chain.verify_transfer(&transfer).await.map_err(|e| {
                IntegrityError::from(self.fail("onchain_verified", format!("onchain_verifier_error: {e}")))
            })?;
            self.invariants.assert_invariant(
                "onchain_verified",
                verified,
                format!("onchain_tx_unverified: {hash}"),
            )?;
            tx_hash = Some(hash.to_string());
        } else {
            let id = str_field(fields, "psp_id")
                .ok_or_else(|| self.fail("psp_reference", "psp_id_missing"))?;
            // Lookup failures propagate without tripping; the next attempt retries
            let confirmed = self.psp.is_confirmed(id).await?;
            self.invariants.assert_invariant(
                "psp_confirmed",
                confirmed,
                format!("psp_unconfirmed: {id}"),
            )?;
            psp_id = Some(id.to_string());
        }

        self.invariants.assert_invariant(
            "amount_match",
            event.amount == amount,
            format!("amount_mismatch: event {} proof {amount}", event.amount),
        )?;
        self.invariants.assert_invariant(
            "currency_match",
            same_currency(&event.currency, currency),
            format!("currency_mismatch: event {} proof {currency}", event.currency),
        )?;

        if let Some(to) = recipient {
            self.invariants.assert_invariant(
                "recipient_allowed",
                self.allowed_recipients.contains(&to.to_ascii_lowercase()),
                format!("recipient_not_allowed: {to}"),
            )?;
        }

        let timestamp = match str_field(fields, "timestamp") {
            None => return Err(self.fail("proof_timestamp", "proof_timestamp_missing").into()),
            Some(ts) => DateTime::parse_from_rfc3339(ts)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| self.fail("proof_timestamp", format!("proof_timestamp_invalid: {ts}")))?,
        };
        self.invariants.assert_invariant(
            "proof_timestamp",
            timestamp <= now + self.clock_skew,
            format!("proof_timestamp_in_future: {timestamp}"),
        )?;
        if let Some(event_time) = event.effective_time() {
            if timestamp + self.clock_skew < event_time {
                match self.temporal {
                    TemporalPolicy::Strict => {
                        return Err(self
                            .fail(
                                "proof_temporal_order",
                                format!("proof_predates_event: {timestamp} < {event_time}"),
                            )
                            .into())
                    }
                    TemporalPolicy::Advisory => warn!(
                        event_id = %event.id,
                        proof_timestamp = %timestamp,
                        event_time = %event_time,
                        "Proof timestamp predates event"
                    ),
                }
            }
        }

        debug!(event_id = %event.id, proof_type = proof_type.as_str(), "Proof valid");
        Ok(PaymentProof {
            proof_type,
            amount,
            currency: currency.to_string(),
            timestamp,
            psp_id,
            tx_hash,
            recipient: recipient.map(str::to_string),
            chain: str_field(fields, "chain").map(str::to_string),
        })
    }

    fn fail(&self, name: &str, reason: impl Into<String>) -> InvariantViolation {
        self.invariants.fail(name, reason)
    }
}

fn str_field<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

impl std::fmt::Debug for ProofValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofValidator")
            .field("allowed_recipients", &self.allowed_recipients.len())
            .field("temporal", &self.temporal)
            .field("clock_skew_ms", &self.clock_skew.num_milliseconds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use proofpay_types::EventStatus;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[derive(Default)]
    struct Confirmed(Mutex<HashSet<String>>);

    impl Confirmed {
        fn with(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(ids.iter().map(|s| s.to_string()).collect())))
        }
    }

    #[async_trait]
    impl PspConfirmation for Confirmed {
        async fn is_confirmed(&self, psp_id: &str) -> Result<bool> {
            Ok(self.0.lock().contains(psp_id))
        }
    }

    struct ApproveAll;

    #[async_trait]
    impl ChainVerifier for ApproveAll {
        async fn verify_transfer(&self, _t: &OnchainTransfer) -> Result<bool> {
            Ok(true)
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn event(proof: Option<Value>) -> LedgerEvent {
        let mut event = LedgerEvent::new(dec!(150), "USD");
        event.id = "evt_1".into();
        event.status = Some(EventStatus::Confirmed);
        event.created_date = Some(now() - Duration::hours(1));
        event.metadata.proof = proof;
        event
    }

    fn validator() -> ProofValidator {
        ProofValidator::new(Arc::new(InvariantCore::new()), Confirmed::with(&["pi_1"]))
    }

    #[tokio::test]
    async fn test_valid_psp_proof() {
        let proof = json!({
            "type": "psp_transaction",
            "amount": 150,
            "currency": "usd",
            "psp_id": "pi_1",
            "timestamp": "2026-03-01T11:30:00Z"
        });
        let valid = validator()
            .assert_valid_at(&event(Some(proof)), now())
            .await
            .unwrap();
        assert_eq!(valid.psp_id.as_deref(), Some("pi_1"));
        assert_eq!(valid.amount, dec!(150));
    }

    #[tokio::test]
    async fn test_synthesized_from_metadata_reference() {
        let mut e = event(None);
        e.metadata.psp_transaction_id = Some("pi_1".into());
        let valid = validator().assert_valid_at(&e, now()).await.unwrap();
        assert_eq!(valid.proof_type, ProofType::PspTransaction);

        let mut bare = event(None);
        bare.metadata.psp_transaction_id = None;
        let v = validator();
        let err = v.assert_valid_at(&bare, now()).await.unwrap_err();
        assert_eq!(err.reason(), "proof_missing: evt_1");
        assert!(v.invariants().is_tripped("proof_present"));
    }

    #[tokio::test]
    async fn test_check_order_and_reasons() {
        let base = json!({
            "type": "psp_transaction",
            "amount": "150",
            "currency": "USD",
            "psp_id": "pi_1",
            "timestamp": "2026-03-01T11:30:00Z"
        });
        let cases = [
            ("type", json!(null), "proof_type_missing"),
            ("amount", json!("lots"), "proof_amount_not_numeric"),
            ("currency", json!(""), "proof_currency_missing"),
            ("psp_id", json!(null), "psp_id_missing"),
            ("psp_id", json!("pi_unknown"), "psp_unconfirmed: pi_unknown"),
            ("amount", json!("150.01"), "amount_mismatch: event 150 proof 150.01"),
            ("timestamp", json!(null), "proof_timestamp_missing"),
            ("timestamp", json!("2026-03-02T12:00:00Z"), "proof_timestamp_in_future: 2026-03-02 12:00:00 UTC"),
        ];
        for (field, value, reason) in cases {
            let mut proof = base.clone();
            proof[field] = value;
            let err = validator()
                .assert_valid_at(&event(Some(proof)), now())
                .await
                .unwrap_err();
            assert_eq!(err.reason(), reason, "field {field}");
        }
    }

    #[tokio::test]
    async fn test_onchain_requires_allowed_recipient() {
        let proof = json!({
            "type": "onchain_tx",
            "amount": "150",
            "currency": "USD",
            "tx_hash": "0xabc",
            "recipient": "0xOWNER",
            "timestamp": "2026-03-01T11:30:00Z"
        });

        let unverifiable = validator();
        let err = unverifiable
            .assert_valid_at(&event(Some(proof.clone())), now())
            .await
            .unwrap_err();
        assert!(err.reason().starts_with("onchain_verifier_error"));

        let not_owner = validator().with_chain_verifier(Arc::new(ApproveAll));
        let err = not_owner
            .assert_valid_at(&event(Some(proof.clone())), now())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "recipient_not_allowed: 0xOWNER");

        let owner = validator()
            .with_chain_verifier(Arc::new(ApproveAll))
            .with_allowed_recipients(["0xowner"]);
        let valid = owner
            .assert_valid_at(&event(Some(proof)), now())
            .await
            .unwrap();
        assert_eq!(valid.tx_hash.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn test_temporal_policy() {
        let proof = json!({
            "type": "psp_transaction",
            "amount": "150",
            "currency": "USD",
            "psp_id": "pi_1",
            "timestamp": "2026-02-01T00:00:00Z"
        });
        assert!(validator()
            .assert_valid_at(&event(Some(proof.clone())), now())
            .await
            .is_ok());

        let err = validator()
            .with_temporal_policy(TemporalPolicy::Strict)
            .assert_valid_at(&event(Some(proof)), now())
            .await
            .unwrap_err();
        assert!(err.reason().starts_with("proof_predates_event"));
    }
}
