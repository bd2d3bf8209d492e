//! Proof of settled performance (PoSP)
//!
//! A reputation gate over an agent's recent settlement receipts:
//!
//! ```text
//! score = round(tx_count + revenue_total_usd / 100 + unique_payers_count * 2)
//! ```
//!
//! rounded half away from zero. The proof is recomputed for every settlement
//! attempt; written files are audit artifacts only.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use proofpay_crypto::mandate_payload_hash;
use proofpay_store::{Collection, Filter, ListQuery};
use proofpay_types::SettlementReceipt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::{Result, SettlementError};

/// Receipt ids kept in the basis for audit
const MAX_SAMPLES: usize = 5;

/// Reason carried by a rejected enforcement
pub const POSP_INSUFFICIENT: &str = "posp_insufficient";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PospRequest {
    pub agent_id: String,
    pub window_days: u32,
    #[serde(default)]
    pub min_receipt_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PospBasis {
    pub tx_count: u64,
    pub revenue_total_usd: Decimal,
    pub unique_payers_count: u64,
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PospProof {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "windowDays")]
    pub window_days: u32,
    pub score: i64,
    pub basis: PospBasis,
    pub proof_hash: String,
}

/// Threshold an agent must meet to start settlement work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PospThreshold {
    pub min_score: i64,
    pub min_tx: u64,
}

/// `{ok, reason?, posp}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PospEnforcement {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub posp: PospProof,
}

/// Score receipts already narrowed to one agent
pub fn calculate_posp_from<'a>(
    request: &PospRequest,
    receipts: impl IntoIterator<Item = &'a SettlementReceipt>,
    now: DateTime<Utc>,
) -> PospProof {
    let since = now - Duration::days(i64::from(request.window_days));
    let mut tx_count = 0u64;
    let mut revenue = Decimal::ZERO;
    let mut payers = BTreeSet::new();
    let mut samples = Vec::new();

    for receipt in receipts {
        let in_window = receipt
            .created_date
            .is_some_and(|at| at >= since && at <= now);
        if receipt.agent_id != request.agent_id
            || !in_window
            || receipt.amount_total_usd < request.min_receipt_amount
        {
            continue;
        }
        tx_count += receipt.count;
        revenue += receipt.amount_total_usd;
        if let Some(email) = receipt.payer_email() {
            payers.insert(email);
        }
        if samples.len() < MAX_SAMPLES && !receipt.id.is_empty() {
            samples.push(receipt.id.clone());
        }
    }

    let unique_payers_count = payers.len() as u64;
    let raw = Decimal::from(tx_count)
        + revenue / Decimal::ONE_HUNDRED
        + Decimal::from(unique_payers_count * 2);
    let score = raw
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(i64::MAX);

    let basis = PospBasis {
        tx_count,
        revenue_total_usd: revenue,
        unique_payers_count,
        samples,
    };
    let proof_hash = mandate_payload_hash(&json!({
        "agentId": request.agent_id,
        "windowDays": request.window_days,
        "score": score,
        "basis": basis,
    }));
    PospProof {
        agent_id: request.agent_id.clone(),
        window_days: request.window_days,
        score,
        basis,
        proof_hash,
    }
}

/// Scan stored receipts for the agent and score them
pub async fn calculate_posp(
    receipts: &Collection<SettlementReceipt>,
    request: &PospRequest,
    now: DateTime<Utc>,
) -> Result<PospProof> {
    let docs = receipts
        .filter(
            &Filter::new().eq("agent_id", request.agent_id.as_str()),
            &ListQuery::newest_first(),
        )
        .await?;
    let proof = calculate_posp_from(request, docs.iter().map(|d| &d.value), now);
    debug!(
        agent_id = %proof.agent_id,
        score = proof.score,
        tx_count = proof.basis.tx_count,
        scanned = docs.len(),
        "PoSP calculated"
    );
    Ok(proof)
}

pub fn enforce_posp(proof: PospProof, threshold: PospThreshold) -> PospEnforcement {
    let ok = proof.score >= threshold.min_score && proof.basis.tx_count >= threshold.min_tx;
    PospEnforcement {
        ok,
        reason: (!ok).then(|| POSP_INSUFFICIENT.to_string()),
        posp: proof,
    }
}

/// Write `posp_proof_<agentId>_<epochMs>.json` into `dir`
pub async fn write_posp_proof(
    dir: impl AsRef<Path>,
    proof: &PospProof,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| SettlementError::Io(format!("{}: {e}", dir.display())))?;
    let path = dir.join(format!(
        "posp_proof_{}_{}.json",
        sanitize_file_component(&proof.agent_id),
        now.timestamp_millis()
    ));
    let bytes = serde_json::to_vec_pretty(proof)?;
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| SettlementError::Io(format!("{}: {e}", path.display())))?;
    info!(agent_id = %proof.agent_id, path = %path.display(), "PoSP proof written");
    Ok(path)
}

fn sanitize_file_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// PoSP settings applied before any settlement work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PospPolicy {
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default)]
    pub min_receipt_amount: Decimal,
    #[serde(default)]
    pub min_score: i64,
    #[serde(default)]
    pub min_tx: u64,
    /// Audit directory for proof files; none disables writing
    #[serde(default)]
    pub proof_dir: Option<PathBuf>,
}

fn default_window_days() -> u32 {
    30
}

impl Default for PospPolicy {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            min_receipt_amount: Decimal::ZERO,
            min_score: 0,
            min_tx: 0,
            proof_dir: None,
        }
    }
}

impl PospPolicy {
    pub fn threshold(&self) -> PospThreshold {
        PospThreshold {
            min_score: self.min_score,
            min_tx: self.min_tx,
        }
    }
}

/// Calculates, enforces and records PoSP for an agent
#[derive(Debug, Clone)]
pub struct ReputationGate {
    receipts: Collection<SettlementReceipt>,
    policy: PospPolicy,
}

impl ReputationGate {
    pub fn new(receipts: Collection<SettlementReceipt>, policy: PospPolicy) -> Self {
        Self { receipts, policy }
    }

    pub fn policy(&self) -> &PospPolicy {
        &self.policy
    }

    pub async fn evaluate(&self, agent_id: &str, now: DateTime<Utc>) -> Result<PospEnforcement> {
        let request = PospRequest {
            agent_id: agent_id.to_string(),
            window_days: self.policy.window_days,
            min_receipt_amount: self.policy.min_receipt_amount,
        };
        let proof = calculate_posp(&self.receipts, &request, now).await?;
        if let Some(dir) = &self.policy.proof_dir {
            write_posp_proof(dir, &proof, now).await?;
        }
        let enforcement = enforce_posp(proof, self.policy.threshold());
        if !enforcement.ok {
            info!(
                agent_id = %agent_id,
                score = enforcement.posp.score,
                min_score = self.policy.min_score,
                tx_count = enforcement.posp.basis.tx_count,
                min_tx = self.policy.min_tx,
                "PoSP below threshold"
            );
        }
        Ok(enforcement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proofpay_types::Payer;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn receipt(count: u64, amount: Decimal, email: &str, age_days: i64) -> SettlementReceipt {
        SettlementReceipt {
            id: format!("r{count}{age_days}"),
            agent_id: "agent-1".into(),
            count,
            amount_total_usd: amount,
            payer: Some(Payer {
                email: Some(email.into()),
            }),
            created_date: Some(now() - Duration::days(age_days)),
        }
    }

    fn request() -> PospRequest {
        PospRequest {
            agent_id: "agent-1".into(),
            window_days: 30,
            min_receipt_amount: Decimal::ZERO,
        }
    }

    #[test]
    fn test_single_receipt_scores_seven() {
        let receipts = [receipt(3, dec!(150), "a@b.com", 1)];
        let proof = calculate_posp_from(&request(), &receipts, now());
        // 3 + 1.5 + 2 = 6.5, rounded half away from zero
        assert_eq!(proof.score, 7);
        assert_eq!(proof.basis.unique_payers_count, 1);
        assert!(proof.proof_hash.starts_with("sha256:"));

        let threshold = |min_score, min_tx| PospThreshold { min_score, min_tx };
        assert!(enforce_posp(proof.clone(), threshold(5, 1)).ok);
        let rejected = enforce_posp(proof, threshold(8, 0));
        assert!(!rejected.ok);
        assert_eq!(rejected.reason.as_deref(), Some(POSP_INSUFFICIENT));
    }

    #[test]
    fn test_window_payers_and_minimum_amount() {
        let receipts = [
            receipt(1, dec!(10), "A@B.com ", 2),
            receipt(2, dec!(20), "a@b.com", 3),
            receipt(5, dec!(500), "old@b.com", 45),
            receipt(1, dec!(1), "tiny@b.com", 1),
        ];
        let mut req = request();
        req.min_receipt_amount = dec!(5);
        let proof = calculate_posp_from(&req, &receipts, now());
        assert_eq!(proof.basis.tx_count, 3);
        assert_eq!(proof.basis.revenue_total_usd, dec!(30));
        assert_eq!(proof.basis.unique_payers_count, 1);
        assert_eq!(proof.score, 5);
    }

    #[test]
    fn test_rejection_wire_shape() {
        let proof = calculate_posp_from(&request(), &[], now());
        let value = serde_json::to_value(enforce_posp(proof, PospThreshold { min_score: 1, min_tx: 0 }))
            .unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["reason"], "posp_insufficient");
        assert_eq!(value["posp"]["agentId"], "agent-1");
        assert_eq!(value["posp"]["basis"]["tx_count"], 0);
    }

    #[tokio::test]
    async fn test_write_proof_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let proof = calculate_posp_from(&request(), &[], now());
        let path = write_posp_proof(dir.path(), &proof, now()).await.unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            format!("posp_proof_agent-1_{}.json", now().timestamp_millis())
        );
        let stored: PospProof = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(stored, proof);
    }
}
