//! Entity registry
//!
//! The closed set of entity names the system persists, with their logical
//! fields. Collections and field maps are checked against it once at
//! construction, so a typo in an entity name fails at startup instead of on
//! the first write.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::record::SUPERSEDED_BY_FIELD;

pub const LEDGER_EVENT: &str = "LedgerEvent";
pub const MANDATE_RECORD: &str = "MandateRecord";
pub const PAYOUT_REQUEST: &str = "PayoutRequest";
pub const PAYOUT_BATCH: &str = "PayoutBatch";
pub const WORK_LEASE: &str = "WorkLease";
pub const SETTLEMENT_INDEX: &str = "SettlementIndex";
pub const SETTLEMENT_RECEIPT: &str = "SettlementReceipt";
pub const WEBHOOK_EVENT: &str = "WebhookEvent";

/// Logical shape of one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    pub name: &'static str,
    pub fields: &'static [&'static str],
    /// Fields a create must carry
    pub required: &'static [&'static str],
}

impl EntityDef {
    /// Known logical field (`superseded_by` is valid on every entity)
    pub fn has_field(&self, field: &str) -> bool {
        field == SUPERSEDED_BY_FIELD || self.fields.contains(&field)
    }

    pub fn is_required(&self, field: &str) -> bool {
        self.required.contains(&field)
    }

    /// Reject create payloads that lack a required field
    pub fn check_required(&self, data: &Map<String, Value>) -> Result<()> {
        match self
            .required
            .iter()
            .find(|f| data.get(**f).map_or(true, Value::is_null))
        {
            Some(field) => Err(StoreError::MissingField {
                entity: self.name.to_string(),
                field: field.to_string(),
            }),
            None => Ok(()),
        }
    }
}

const STANDARD: &[EntityDef] = &[
    EntityDef {
        name: LEDGER_EVENT,
        fields: &[
            "external_id",
            "amount",
            "currency",
            "status",
            "occurred_at",
            "metadata",
        ],
        required: &["amount", "currency"],
    },
    EntityDef {
        name: MANDATE_RECORD,
        fields: &[
            "mandate_id",
            "kind",
            "intent_id",
            "payload_hash",
            "prev_hash",
            "kid",
            "idempotency_key",
            "envelope",
        ],
        required: &[
            "mandate_id",
            "kind",
            "payload_hash",
            "idempotency_key",
            "envelope",
        ],
    },
    EntityDef {
        name: PAYOUT_REQUEST,
        fields: &[
            "idempotency_key",
            "intent_id",
            "quote_id",
            "payment_id",
            "amount",
            "currency",
            "destination",
            "route",
            "event_ids",
            "status",
            "payout_batch_id",
        ],
        required: &[
            "idempotency_key",
            "amount",
            "currency",
            "destination",
            "status",
        ],
    },
    EntityDef {
        name: PAYOUT_BATCH,
        fields: &[
            "batch_key",
            "recipient",
            "currency",
            "route",
            "total",
            "request_ids",
            "event_ids",
            "status",
            "processor_batch_id",
            "submitted_at",
            "review_reason",
        ],
        required: &["batch_key", "recipient", "currency", "total", "status"],
    },
    EntityDef {
        name: WORK_LEASE,
        fields: &[
            "key",
            "holder",
            "claimed_at",
            "expires_at",
            "status",
            "meta",
        ],
        required: &["key", "holder", "expires_at", "status"],
    },
    EntityDef {
        name: SETTLEMENT_INDEX,
        fields: &["event_id", "payout_batch_id", "marked_at"],
        required: &["event_id"],
    },
    EntityDef {
        name: SETTLEMENT_RECEIPT,
        fields: &["agent_id", "count", "amount_total_usd", "payer"],
        required: &["agent_id"],
    },
    EntityDef {
        name: WEBHOOK_EVENT,
        fields: &["psp_id", "event_type", "received_at"],
        required: &["psp_id"],
    },
];

/// Registry of persisted entities
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<&'static str, EntityDef>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entity ProofPay persists
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for def in STANDARD {
            registry.register(def.clone());
        }
        registry
    }

    pub fn register(&mut self, def: EntityDef) {
        self.entities.insert(def.name, def);
    }

    pub fn get(&self, name: &str) -> Result<&EntityDef> {
        self.entities
            .get(name)
            .ok_or_else(|| StoreError::UnknownEntity(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entities.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_standard_registry() {
        let registry = EntityRegistry::standard();
        assert_eq!(registry.names().count(), 8);
        assert!(registry.get(WORK_LEASE).unwrap().has_field("expires_at"));
        assert!(registry.get(WORK_LEASE).unwrap().has_field("superseded_by"));
        assert!(matches!(
            registry.get("LedgerEvents"),
            Err(StoreError::UnknownEntity(name)) if name == "LedgerEvents"
        ));
    }

    #[test]
    fn test_required_fields() {
        let registry = EntityRegistry::standard();
        let def = registry.get(SETTLEMENT_INDEX).unwrap();
        assert!(def
            .check_required(json!({"event_id": "e1"}).as_object().unwrap())
            .is_ok());
        assert!(matches!(
            def.check_required(json!({"event_id": null}).as_object().unwrap()),
            Err(StoreError::MissingField { field, .. }) if field == "event_id"
        ));
    }
}
