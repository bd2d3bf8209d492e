//! Stored form of signed mandates

use proofpay_mandate::{MandateEnvelope, MandateKind};
use serde::{Deserialize, Serialize};

/// A signed mandate as persisted, keyed by `mandate:<id>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MandateRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub mandate_id: String,
    pub kind: MandateKind,
    pub intent_id: String,
    pub payload_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub kid: String,
    #[serde(default)]
    pub idempotency_key: String,
    pub envelope: MandateEnvelope,
}

impl MandateRecord {
    pub fn idempotency_key_for(mandate_id: &str) -> String {
        format!("mandate:{mandate_id}")
    }

    pub fn new(intent_id: &str, envelope: MandateEnvelope) -> Option<Self> {
        let mandate_id = envelope.mandate_id()?.to_string();
        Some(Self {
            id: String::new(),
            idempotency_key: Self::idempotency_key_for(&mandate_id),
            mandate_id,
            kind: envelope.kind()?,
            intent_id: intent_id.to_string(),
            payload_hash: envelope.payload_hash(),
            prev_hash: envelope.prev_hash().map(str::to_string),
            kid: envelope.protected.kid.clone(),
            envelope,
        })
    }
}
