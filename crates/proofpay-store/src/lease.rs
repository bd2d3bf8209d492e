//! Work leases
//!
//! One lease record per key, exclusive while unexpired. Expiry is the only
//! release; records are never deleted.
//!
//! ```text
//! absent ──create──▶ CLAIMED(h1) ──renew by h1──▶ CLAIMED(h1)
//!                         │
//!                         └──expired, claim by h2──▶ CLAIMED(h2)
//! ```
//!
//! Claims on an existing record are a compare-and-swap on the version that
//! was read, so two processes reclaiming the same expired lease cannot both
//! win.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::collection::{Collection, Document};
use crate::error::Result;
use crate::record::Filter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseStatus {
    Claimed,
    /// Lost a create race to an earlier record
    Superseded,
}

/// Stored lease record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub key: String,
    pub holder: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: LeaseStatus,
    #[serde(default)]
    pub meta: Value,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, holder: &str) -> bool {
        self.holder == holder
    }
}

#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub key: String,
    pub holder: String,
    pub ttl: Duration,
    pub meta: Value,
}

impl LeaseRequest {
    pub fn new(key: impl Into<String>, holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            holder: holder.into(),
            ttl,
            meta: Value::Null,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }
}

/// Why a lease was not acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseDenial {
    /// Another holder has an unexpired claim
    HeldByOther,
    /// A concurrent create for the same key was earlier
    LostRace,
    /// The record changed between read and claim
    VersionConflict,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    Acquired {
        lease: Document<LeaseRecord>,
        renewed: bool,
    },
    Unavailable {
        key: String,
        held_by: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        reason: LeaseDenial,
    },
}

impl LeaseOutcome {
    pub fn acquired(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    pub fn lease(&self) -> Option<&Document<LeaseRecord>> {
        match self {
            Self::Acquired { lease, .. } => Some(lease),
            Self::Unavailable { .. } => None,
        }
    }

    fn unavailable(key: &str, current: Option<&LeaseRecord>, reason: LeaseDenial) -> Self {
        Self::Unavailable {
            key: key.to_string(),
            held_by: current.map(|l| l.holder.clone()),
            expires_at: current.map(|l| l.expires_at),
            reason,
        }
    }
}

/// Claim or renew the lease for `request.key` at time `now`
pub async fn acquire_work_lease(
    leases: &Collection<LeaseRecord>,
    request: &LeaseRequest,
    now: DateTime<Utc>,
) -> Result<LeaseOutcome> {
    let by_key = Filter::new().eq("key", request.key.as_str());
    let claim = LeaseRecord {
        key: request.key.clone(),
        holder: request.holder.clone(),
        claimed_at: now,
        expires_at: now + request.ttl,
        status: LeaseStatus::Claimed,
        meta: request.meta.clone(),
    };

    let Some(current) = leases.find_one(&by_key).await? else {
        return create_lease(leases, &by_key, &claim).await;
    };

    if !current.value.is_held_by(&request.holder) && !current.value.is_expired(now) {
        debug!(
            key = %request.key,
            holder = %current.value.holder,
            expires_at = %current.value.expires_at,
            "Work lease held by another holder"
        );
        return Ok(LeaseOutcome::unavailable(
            &request.key,
            Some(&current.value),
            LeaseDenial::HeldByOther,
        ));
    }

    let renewed = current.value.is_held_by(&request.holder);
    let patch = claim_patch(&claim);
    match leases.update(&current.id, patch, Some(current.version)).await {
        Ok(lease) => {
            info!(
                key = %request.key,
                holder = %request.holder,
                previous_holder = %current.value.holder,
                renewed = renewed,
                expires_at = %lease.value.expires_at,
                "Work lease claimed"
            );
            Ok(LeaseOutcome::Acquired { lease, renewed })
        }
        Err(e) if e.is_conflict() => {
            warn!(key = %request.key, holder = %request.holder, "Work lease claim lost on version check");
            Ok(LeaseOutcome::unavailable(
                &request.key,
                None,
                LeaseDenial::VersionConflict,
            ))
        }
        Err(e) => Err(e),
    }
}

async fn create_lease(
    leases: &Collection<LeaseRecord>,
    by_key: &Filter,
    claim: &LeaseRecord,
) -> Result<LeaseOutcome> {
    let created = match leases.create(claim).await {
        Ok(created) => created,
        Err(e) if e.is_conflict() => {
            let current = leases.find_one(by_key).await?;
            return Ok(LeaseOutcome::unavailable(
                &claim.key,
                current.as_ref().map(|d| &d.value),
                LeaseDenial::LostRace,
            ));
        }
        Err(e) => return Err(e),
    };

    match leases.find_one(by_key).await? {
        Some(winner) if winner.id != created.id => {
            let mut patch = Map::new();
            patch.insert("status".to_string(), json!(LeaseStatus::Superseded));
            leases.supersede(&created.id, &winner.id, patch).await?;
            info!(
                key = %claim.key,
                holder = %claim.holder,
                winner = %winner.value.holder,
                "Work lease create race lost"
            );
            Ok(LeaseOutcome::unavailable(
                &claim.key,
                Some(&winner.value),
                LeaseDenial::LostRace,
            ))
        }
        _ => {
            info!(
                key = %claim.key,
                holder = %claim.holder,
                expires_at = %claim.expires_at,
                "Work lease created"
            );
            Ok(LeaseOutcome::Acquired {
                lease: created,
                renewed: false,
            })
        }
    }
}

fn claim_patch(claim: &LeaseRecord) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert("holder".to_string(), json!(claim.holder));
    patch.insert("claimed_at".to_string(), json!(claim.claimed_at));
    patch.insert("expires_at".to_string(), json!(claim.expires_at));
    patch.insert("status".to_string(), json!(claim.status));
    patch.insert("meta".to_string(), claim.meta.clone());
    patch
}
