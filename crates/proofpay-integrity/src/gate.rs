//! The money-moved gate
//!
//! Every settlement and reporting path calls [`MoneyMovedGate::assert_money_moved`]
//! before treating a ledger event's money as real.

use std::sync::Arc;

use proofpay_types::{EventStatus, LedgerEvent, PaymentProof};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::evidence::{EvidenceBlock, EvidenceIntegrityChain};
use crate::invariant::InvariantCore;
use crate::proof::ProofValidator;

/// Statuses whose money may be treated as moved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneyMovedPolicy {
    #[serde(default = "default_allowed_statuses")]
    pub allowed_statuses: Vec<EventStatus>,
}

fn default_allowed_statuses() -> Vec<EventStatus> {
    vec![
        EventStatus::Confirmed,
        EventStatus::Reconciled,
        EventStatus::PaidOut,
    ]
}

impl Default for MoneyMovedPolicy {
    fn default() -> Self {
        Self {
            allowed_statuses: default_allowed_statuses(),
        }
    }
}

impl MoneyMovedPolicy {
    pub fn allows(&self, status: Option<EventStatus>) -> bool {
        status.is_some_and(|s| self.allowed_statuses.contains(&s))
    }
}

/// Certified money movement
#[derive(Debug, Clone, PartialEq)]
pub struct MoneyMoved {
    pub proof: PaymentProof,
    pub evidence: EvidenceBlock,
}

#[derive(Debug)]
pub struct MoneyMovedGate {
    invariants: Arc<InvariantCore>,
    validator: Arc<ProofValidator>,
    evidence: Arc<EvidenceIntegrityChain>,
    policy: MoneyMovedPolicy,
}

impl MoneyMovedGate {
    pub fn new(
        invariants: Arc<InvariantCore>,
        validator: Arc<ProofValidator>,
        evidence: Arc<EvidenceIntegrityChain>,
    ) -> Self {
        Self {
            invariants,
            validator,
            evidence,
            policy: MoneyMovedPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: MoneyMovedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &MoneyMovedPolicy {
        &self.policy
    }

    pub fn evidence(&self) -> &Arc<EvidenceIntegrityChain> {
        &self.evidence
    }

    pub async fn assert_money_moved(&self, event: &LedgerEvent) -> Result<MoneyMoved> {
        self.invariants.assert_invariant(
            "event_not_hallucination",
            !event.is_hallucination(),
            format!("hallucination_refused: {}", event.id),
        )?;
        self.invariants.assert_invariant(
            "event_status_allowed",
            self.policy.allows(event.status),
            format!(
                "status_not_money_moved: {}",
                event.status.map_or("unset", |s| s.as_str())
            ),
        )?;
        let proof = self.validator.assert_valid(event).await?;
        let evidence = self.evidence.assert_event_bound(&event.id).await?;
        debug!(event_id = %event.id, evidence = %evidence.hash, "Money moved");
        Ok(MoneyMoved { proof, evidence })
    }

    /// Validate the event's proof and bind it into the evidence chain.
    ///
    /// Idempotent: an event that already has a block is not appended again.
    pub async fn record_evidence(&self, event: &LedgerEvent) -> Result<EvidenceBlock> {
        self.validator.assert_valid(event).await?;
        if self.evidence.contains(&event.id).await {
            return self.evidence.assert_event_bound(&event.id).await;
        }
        let proof = ProofValidator::effective_proof(event).unwrap_or_default();
        let block = self.evidence.add_block(&event.id, proof).await?;
        info!(event_id = %event.id, hash = %block.hash, "Evidence recorded");
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::PspConfirmation;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    struct AlwaysConfirmed;

    #[async_trait]
    impl PspConfirmation for AlwaysConfirmed {
        async fn is_confirmed(&self, _psp_id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    async fn gate(dir: &tempfile::TempDir) -> MoneyMovedGate {
        let invariants = Arc::new(InvariantCore::new());
        let validator = Arc::new(ProofValidator::new(
            invariants.clone(),
            Arc::new(AlwaysConfirmed),
        ));
        let evidence = Arc::new(
            EvidenceIntegrityChain::open(dir.path().join("evidence.json"), invariants.clone())
                .await
                .unwrap(),
        );
        MoneyMovedGate::new(invariants, validator, evidence)
    }

    fn event(status: EventStatus) -> LedgerEvent {
        let mut event = LedgerEvent::new(dec!(150), "USD");
        event.id = "evt_1".into();
        event.status = Some(status);
        event.created_date = Some(Utc::now() - Duration::minutes(10));
        event.metadata.psp_transaction_id = Some("pi_1".into());
        event
    }

    #[tokio::test]
    async fn test_requires_evidence_then_passes() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir).await;
        let e = event(EventStatus::Confirmed);

        let err = gate.assert_money_moved(&e).await.unwrap_err();
        assert!(err.reason().starts_with("evidence_block_missing"));

        gate.record_evidence(&e).await.unwrap();
        gate.record_evidence(&e).await.unwrap();
        assert_eq!(gate.evidence().len().await, 1);

        let moved = gate.assert_money_moved(&e).await.unwrap();
        assert_eq!(moved.proof.amount, dec!(150));
    }

    #[tokio::test]
    async fn test_refuses_hallucination_and_disallowed_status() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir).await;

        let err = gate
            .assert_money_moved(&event(EventStatus::Hallucination))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "hallucination_refused: evt_1");

        let err = gate
            .assert_money_moved(&event(EventStatus::Pending))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "status_not_money_moved: pending");
    }

    #[test]
    fn test_default_policy() {
        let policy = MoneyMovedPolicy::default();
        assert!(policy.allows(Some(EventStatus::PaidOut)));
        assert!(!policy.allows(Some(EventStatus::Refunded)));
        assert!(!policy.allows(None));
    }
}
