//! Hash-chained evidence ledger
//!
//! Each block binds a proof to one ledger event and links to the previous
//! block's hash, starting from `GENESIS`:
//!
//! ```text
//! hash = sha256(stable_stringify({eventId, proof, prevHash, timestamp}))
//! ```
//!
//! The chain is a JSON array rewritten in full (temp file + rename) on every
//! append. There is a single writer per file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use proofpay_crypto::{sha256_hex, stable_stringify};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{IntegrityError, Result};
use crate::invariant::InvariantCore;

/// `prevHash` of the first block
pub const GENESIS_HASH: &str = "GENESIS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceBlock {
    pub event_id: String,
    pub proof: Value,
    pub prev_hash: String,
    /// RFC 3339, millisecond precision
    pub timestamp: String,
    pub hash: String,
}

impl EvidenceBlock {
    fn compute_hash(event_id: &str, proof: &Value, prev_hash: &str, timestamp: &str) -> String {
        let content = json!({
            "eventId": event_id,
            "proof": proof,
            "prevHash": prev_hash,
            "timestamp": timestamp,
        });
        sha256_hex(stable_stringify(&content).as_bytes())
    }

    pub fn recompute_hash(&self) -> String {
        Self::compute_hash(&self.event_id, &self.proof, &self.prev_hash, &self.timestamp)
    }

    pub fn is_intact(&self) -> bool {
        self.recompute_hash() == self.hash
    }
}

/// Result of walking the whole chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub ok: bool,
    pub blocks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
pub struct EvidenceIntegrityChain {
    path: PathBuf,
    blocks: Mutex<Vec<EvidenceBlock>>,
    invariants: Arc<InvariantCore>,
}

impl EvidenceIntegrityChain {
    /// Load the chain at `path` (absent file means an empty chain)
    pub async fn open(path: impl AsRef<Path>, invariants: Arc<InvariantCore>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let blocks = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| IntegrityError::Io(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(IntegrityError::Io(format!("{}: {e}", path.display()))),
        };
        debug!(path = %path.display(), blocks = blocks.len(), "Evidence chain loaded");
        Ok(Self {
            path,
            blocks: Mutex::new(blocks),
            invariants,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.blocks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blocks.lock().await.is_empty()
    }

    pub async fn add_block(&self, event_id: &str, proof: Value) -> Result<EvidenceBlock> {
        self.add_block_at(event_id, proof, Utc::now()).await
    }

    pub async fn add_block_at(
        &self,
        event_id: &str,
        proof: Value,
        now: DateTime<Utc>,
    ) -> Result<EvidenceBlock> {
        let mut blocks = self.blocks.lock().await;
        let prev_hash = blocks
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let hash = EvidenceBlock::compute_hash(event_id, &proof, &prev_hash, &timestamp);
        let block = EvidenceBlock {
            event_id: event_id.to_string(),
            proof,
            prev_hash,
            timestamp,
            hash,
        };

        blocks.push(block.clone());
        if let Err(e) = self.persist(&blocks).await {
            blocks.pop();
            return Err(e);
        }
        info!(event_id = %event_id, hash = %block.hash, height = blocks.len(), "Evidence block appended");
        Ok(block)
    }

    /// Most recent block for `event_id`, checked for tampering
    pub async fn assert_event_bound(&self, event_id: &str) -> Result<EvidenceBlock> {
        let blocks = self.blocks.lock().await;
        let Some(index) = blocks.iter().rposition(|b| b.event_id == event_id) else {
            return Err(self
                .invariants
                .fail(
                    "evidence_bound",
                    format!("evidence_block_missing: {event_id}"),
                )
                .into());
        };

        let block = &blocks[index];
        let expected_prev = match index {
            0 => GENESIS_HASH,
            i => blocks[i - 1].hash.as_str(),
        };
        if !block.is_intact() || block.prev_hash != expected_prev {
            return Err(self
                .invariants
                .fail(
                    "evidence_integrity",
                    format!("evidence_chain_tampered: {event_id}"),
                )
                .into());
        }
        Ok(block.clone())
    }

    /// Has any block been recorded for `event_id`?
    pub async fn contains(&self, event_id: &str) -> bool {
        self.blocks
            .lock()
            .await
            .iter()
            .any(|b| b.event_id == event_id)
    }

    /// Walk every block checking hashes and links
    pub async fn verify_chain(&self) -> ChainVerification {
        let blocks = self.blocks.lock().await;
        let mut prev = GENESIS_HASH;
        for (i, block) in blocks.iter().enumerate() {
            let reason = if block.prev_hash != prev {
                Some("prev_hash_mismatch")
            } else if !block.is_intact() {
                Some("hash_mismatch")
            } else {
                None
            };
            if let Some(reason) = reason {
                return ChainVerification {
                    ok: false,
                    blocks: blocks.len(),
                    broken_at: Some(i),
                    reason: Some(reason.to_string()),
                };
            }
            prev = &block.hash;
        }
        ChainVerification {
            ok: true,
            blocks: blocks.len(),
            broken_at: None,
            reason: None,
        }
    }

    async fn persist(&self, blocks: &[EvidenceBlock]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(blocks)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IntegrityError::Io(format!("{}: {e}", parent.display())))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| IntegrityError::Io(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| IntegrityError::Io(format!("{}: {e}", self.path.display())))
    }
}
