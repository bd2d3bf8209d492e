//! Mandate envelope model
//!
//! An envelope carries a protected header, the payload exactly as it was
//! signed, and a base64url signature. The payload stays a raw JSON value so
//! that hashing and signature checks see the received bytes' structure, not
//! a re-serialized typed view. Typed views are decoded on demand with
//! [`MandateEnvelope::payload_as`].

use chrono::{DateTime, Utc};
use proofpay_crypto::mandate_payload_hash;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MandateError, Result};

/// Envelope format version
pub const ENVELOPE_VERSION: u32 = 1;
/// Envelope `typ` header value
pub const ENVELOPE_TYPE: &str = "AP2-MANDATE";
/// The only supported signature algorithm
pub const ENVELOPE_ALG: &str = "Ed25519";

/// Protected header of a mandate envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedHeader {
    pub v: u32,
    pub typ: String,
    pub alg: String,
    pub kid: String,
}

impl ProtectedHeader {
    pub fn new(kid: impl Into<String>) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            typ: ENVELOPE_TYPE.to_string(),
            alg: ENVELOPE_ALG.to_string(),
            kid: kid.into(),
        }
    }
}

/// A signed mandate
///
/// Envelopes are never mutated after signing; a superseding mandate is a
/// new envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MandateEnvelope {
    pub protected: ProtectedHeader,
    pub payload: Value,
    pub signature: String,
}

impl MandateEnvelope {
    /// `sha256:`-prefixed canonical hash of the payload
    pub fn payload_hash(&self) -> String {
        mandate_payload_hash(&self.payload)
    }

    /// Kind declared by the payload's `type` field
    pub fn kind(&self) -> Option<MandateKind> {
        self.payload
            .get("type")
            .and_then(Value::as_str)
            .and_then(MandateKind::parse)
    }

    /// Payload `id`
    pub fn mandate_id(&self) -> Option<&str> {
        self.payload.get("id").and_then(Value::as_str)
    }

    /// Payload `prev_hash`, absent for intents
    pub fn prev_hash(&self) -> Option<&str> {
        self.payload.get("prev_hash").and_then(Value::as_str)
    }

    /// Decode a typed view of the payload
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| MandateError::InvalidPayload(e.to_string()))
    }

    /// Envelope as a JSON value
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Mandate kinds, in chain order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MandateKind {
    #[serde(rename = "ap2.intent")]
    Intent,
    #[serde(rename = "ap2.quote")]
    Quote,
    #[serde(rename = "ap2.payment")]
    Payment,
}

impl MandateKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ap2.intent" => Some(Self::Intent),
            "ap2.quote" => Some(Self::Quote),
            "ap2.payment" => Some(Self::Payment),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intent => "ap2.intent",
            Self::Quote => "ap2.quote",
            Self::Payment => "ap2.payment",
        }
    }
}

/// Claims shared by every mandate payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandateClaims {
    /// `urn:uuid:` identifier
    pub id: String,
    /// Issuer DID
    pub iss: String,
    /// Subject DID
    pub sub: String,
    /// Audience DID
    pub aud: String,
    pub iat: DateTime<Utc>,
    pub exp: DateTime<Utc>,
}

/// Spending constraints carried by an intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentConstraints {
    pub currency: String,
    pub max_amount: Decimal,
    #[serde(default)]
    pub route_preference: String,
    pub destination: String,
}

/// `ap2.intent`: what the initiating agent authorizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentMandate {
    #[serde(rename = "type")]
    pub kind: MandateKind,
    #[serde(flatten)]
    pub claims: MandateClaims,
    pub constraints: IntentConstraints,
}

impl IntentMandate {
    pub fn new(claims: MandateClaims, constraints: IntentConstraints) -> Self {
        Self {
            kind: MandateKind::Intent,
            claims,
            constraints,
        }
    }
}

/// One ledger event offered in a quote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
}

/// Items selected for settlement and their exact total
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub currency: String,
    pub items: Vec<CartItem>,
    pub total: Decimal,
}

impl Cart {
    /// Build a cart whose total is the exact sum of its items
    pub fn from_items(currency: impl Into<String>, items: Vec<CartItem>) -> Self {
        let total = items.iter().map(|i| i.amount).sum();
        Self {
            currency: currency.into(),
            items,
            total,
        }
    }

    /// Does `total` equal the sum of item amounts?
    pub fn is_balanced(&self) -> bool {
        self.items.iter().map(|i| i.amount).sum::<Decimal>() == self.total
    }
}

/// `ap2.quote`: the settlement offered against an intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteMandate {
    #[serde(rename = "type")]
    pub kind: MandateKind,
    #[serde(flatten)]
    pub claims: MandateClaims,
    pub prev_hash: String,
    pub intent_id: String,
    pub cart: Cart,
}

impl QuoteMandate {
    pub fn new(claims: MandateClaims, prev_hash: String, intent_id: String, cart: Cart) -> Self {
        Self {
            kind: MandateKind::Quote,
            claims,
            prev_hash,
            intent_id,
            cart,
        }
    }
}

/// How the payment settles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementTerms {
    pub method: String,
    pub currency: String,
    pub amount: Decimal,
    /// `sha256:` hash of the destination, so the payload never carries it in clear
    pub destination_hash: String,
}

/// Side effect authorized by a payment mandate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MandateAction {
    pub kind: String,
    pub entity: String,
    pub idempotency_key: String,
    pub data: Value,
}

/// `ap2.payment`: authorization to move the quoted amount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMandate {
    #[serde(rename = "type")]
    pub kind: MandateKind,
    #[serde(flatten)]
    pub claims: MandateClaims,
    pub prev_hash: String,
    pub intent_id: String,
    pub quote_id: String,
    pub settlement: SettlementTerms,
    pub action: MandateAction,
}

impl PaymentMandate {
    pub fn new(
        claims: MandateClaims,
        prev_hash: String,
        intent_id: String,
        quote_id: String,
        settlement: SettlementTerms,
        action: MandateAction,
    ) -> Self {
        Self {
            kind: MandateKind::Payment,
            claims,
            prev_hash,
            intent_id,
            quote_id,
            settlement,
            action,
        }
    }
}

/// `urn:uuid:` form of a uuid
pub fn urn_uuid(id: uuid::Uuid) -> String {
    format!("urn:uuid:{id}")
}
