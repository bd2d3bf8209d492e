//! Mandate verification
//!
//! Verification collects every violation instead of stopping at the first.
//! Structural problems (missing parts, wrong algorithm) suppress the
//! signature check; temporal problems do not.
//!
//! # Temporal rules
//!
//! With clock skew `s`:
//! - `expired` iff `exp < now - s`
//! - `iat_in_future` iff `iat > now + s`

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Verifier};
use proofpay_crypto::{b64url_decode, hashes_match, mandate_payload_hash, stable_stringify};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::envelope::{MandateEnvelope, ENVELOPE_ALG};
use crate::error::Result;
use crate::keys::KeyResolver;

/// Default tolerated clock skew between issuer and verifier, in milliseconds
pub const DEFAULT_CLOCK_SKEW_MS: i64 = 5 * 60 * 1000;

/// A reason an envelope is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    MissingProtected,
    MissingPayload,
    MissingSignature,
    MissingKid,
    UnsupportedAlg,
    InvalidIat,
    IatInFuture,
    InvalidExp,
    Expired,
    BadSignature,
    ChainBroken,
}

impl Violation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingProtected => "missing_protected",
            Self::MissingPayload => "missing_payload",
            Self::MissingSignature => "missing_signature",
            Self::MissingKid => "missing_kid",
            Self::UnsupportedAlg => "unsupported_alg",
            Self::InvalidIat => "invalid_iat",
            Self::IatInFuture => "iat_in_future",
            Self::InvalidExp => "invalid_exp",
            Self::Expired => "expired",
            Self::BadSignature => "bad_signature",
            Self::ChainBroken => "chain_broken",
        }
    }

    fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::MissingProtected
                | Self::MissingPayload
                | Self::MissingSignature
                | Self::MissingKid
                | Self::UnsupportedAlg
        )
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of verifying one envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub ok: bool,
    pub violations: Vec<Violation>,
    pub kid: Option<String>,
    pub payload_hash: Option<String>,
}

impl VerificationReport {
    pub fn has(&self, violation: Violation) -> bool {
        self.violations.contains(&violation)
    }
}

/// Verification parameters
#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    pub now: DateTime<Utc>,
    pub clock_skew: Duration,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            now: Utc::now(),
            clock_skew: Duration::milliseconds(DEFAULT_CLOCK_SKEW_MS),
        }
    }
}

impl VerifyOptions {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            ..Self::default()
        }
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }
}

/// Verifies envelopes against keys from a [`KeyResolver`]
#[derive(Debug, Clone)]
pub struct MandateVerifier<R> {
    resolver: R,
}

impl<R: KeyResolver> MandateVerifier<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Verify a typed envelope
    pub fn verify_envelope(
        &self,
        envelope: &MandateEnvelope,
        options: VerifyOptions,
    ) -> Result<VerificationReport> {
        self.verify(&envelope.to_value()?, options)
    }

    /// Verify an envelope given as raw JSON.
    ///
    /// Returns `Err(UnknownKid)` when the envelope is structurally sound but
    /// no key is configured for its kid.
    pub fn verify(&self, envelope: &Value, options: VerifyOptions) -> Result<VerificationReport> {
        let mut violations = Vec::new();

        let protected = envelope.get("protected").filter(|p| p.is_object());
        let payload = envelope.get("payload").filter(|p| p.is_object());
        let signature = envelope
            .get("signature")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());

        if protected.is_none() {
            violations.push(Violation::MissingProtected);
        }
        if payload.is_none() {
            violations.push(Violation::MissingPayload);
        }
        if signature.is_none() {
            violations.push(Violation::MissingSignature);
        }

        let kid = protected
            .and_then(|p| p.get("kid"))
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        if protected.is_some() {
            if kid.is_none() {
                violations.push(Violation::MissingKid);
            }
            let alg = protected.and_then(|p| p.get("alg")).and_then(Value::as_str);
            if alg != Some(ENVELOPE_ALG) {
                violations.push(Violation::UnsupportedAlg);
            }
        }

        if let Some(payload) = payload {
            check_temporal(payload, options, &mut violations);
        }

        let structural = violations.iter().any(Violation::is_structural);
        if let (false, Some(payload), Some(signature), Some(kid)) =
            (structural, payload, signature, kid.as_deref())
        {
            let key = self.resolver.resolve(kid)?;
            let message = stable_stringify(payload);
            let valid = decode_signature(signature)
                .map(|sig| key.verify(message.as_bytes(), &sig).is_ok())
                .unwrap_or(false);
            if !valid {
                violations.push(Violation::BadSignature);
            }
        }

        let report = VerificationReport {
            ok: violations.is_empty(),
            violations,
            kid,
            payload_hash: payload.map(mandate_payload_hash),
        };
        debug!(
            ok = report.ok,
            kid = ?report.kid,
            violations = ?report.violations,
            "Mandate verified"
        );
        Ok(report)
    }
}

fn decode_signature(encoded: &str) -> Option<Signature> {
    let bytes = b64url_decode(encoded).ok()?;
    let bytes: [u8; 64] = bytes.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}

fn parse_time(payload: &Value, field: &str) -> Option<DateTime<Utc>> {
    let raw = payload.get(field)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn check_temporal(payload: &Value, options: VerifyOptions, violations: &mut Vec<Violation>) {
    match parse_time(payload, "iat") {
        None => violations.push(Violation::InvalidIat),
        Some(iat) if iat > options.now + options.clock_skew => {
            violations.push(Violation::IatInFuture)
        }
        Some(_) => {}
    }
    match parse_time(payload, "exp") {
        None => violations.push(Violation::InvalidExp),
        Some(exp) if exp < options.now - options.clock_skew => violations.push(Violation::Expired),
        Some(_) => {}
    }
}

/// One broken link in a mandate chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLinkViolation {
    /// Index of the envelope whose `prev_hash` does not match
    pub index: usize,
    pub violation: Violation,
    pub expected: String,
    pub actual: Option<String>,
}

/// Check `prev_hash` linkage across envelopes in chain order.
///
/// The first envelope is the chain root and is not checked. Returns every
/// broken link; an empty result means the chain is intact.
pub fn verify_chain(envelopes: &[MandateEnvelope]) -> Vec<ChainLinkViolation> {
    envelopes
        .windows(2)
        .enumerate()
        .filter_map(|(i, pair)| {
            let expected = pair[0].payload_hash();
            let actual = pair[1].prev_hash().map(str::to_string);
            let linked = actual
                .as_deref()
                .is_some_and(|prev| hashes_match(prev, &expected));
            (!linked).then(|| ChainLinkViolation {
                index: i + 1,
                violation: Violation::ChainBroken,
                expected,
                actual,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::StaticKeyResolver;
    use crate::signer::MandateSigner;
    use crate::MandateError;
    use chrono::TimeZone;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (MandateSigner, MandateVerifier<StaticKeyResolver>) {
        let signer = MandateSigner::new("agent-key", SigningKey::generate(&mut OsRng));
        let resolver = StaticKeyResolver::new().with_key("agent-key", signer.verifying_key());
        (signer, MandateVerifier::new(resolver))
    }

    fn payload_with_exp(exp: DateTime<Utc>) -> Value {
        json!({
            "type": "ap2.intent",
            "id": "urn:uuid:1",
            "iss": "did:web:a",
            "sub": "did:web:a",
            "aud": "did:web:m",
            "iat": (now() - Duration::hours(1)).to_rfc3339(),
            "exp": exp.to_rfc3339(),
        })
    }

    fn payload() -> Value {
        payload_with_exp(now() + Duration::hours(1))
    }

    #[test]
    fn test_valid_envelope() {
        let (signer, verifier) = setup();
        let envelope = signer.sign(payload()).unwrap();
        let report = verifier
            .verify_envelope(&envelope, VerifyOptions::at(now()))
            .unwrap();

        assert!(report.ok, "{:?}", report.violations);
        assert_eq!(report.kid.as_deref(), Some("agent-key"));
        assert_eq!(report.payload_hash, Some(envelope.payload_hash()));
    }

    #[test]
    fn test_signature_byte_flip_is_bad_signature() {
        let (signer, verifier) = setup();
        let envelope = signer.sign(payload()).unwrap();
        let mut bytes = b64url_decode(&envelope.signature).unwrap();

        for i in [0, 31, 63] {
            bytes[i] ^= 0x01;
            let mut tampered = envelope.clone();
            tampered.signature = proofpay_crypto::b64url_encode(&bytes);
            bytes[i] ^= 0x01;

            let report = verifier
                .verify_envelope(&tampered, VerifyOptions::at(now()))
                .unwrap();
            assert!(!report.ok);
            assert_eq!(report.violations, vec![Violation::BadSignature]);
        }
    }

    #[test]
    fn test_payload_change_is_bad_signature() {
        let (signer, verifier) = setup();
        let mut envelope = signer.sign(payload()).unwrap();
        envelope.payload["id"] = json!("urn:uuid:2");

        let report = verifier
            .verify_envelope(&envelope, VerifyOptions::at(now()))
            .unwrap();
        assert!(report.has(Violation::BadSignature));
    }

    #[test]
    fn test_expiry_boundary() {
        let (signer, verifier) = setup();
        let skew = Duration::milliseconds(DEFAULT_CLOCK_SKEW_MS);
        let one_ms = Duration::milliseconds(1);

        let stale = signer.sign(payload_with_exp(now() - skew - one_ms)).unwrap();
        let report = verifier
            .verify_envelope(&stale, VerifyOptions::at(now()))
            .unwrap();
        assert!(report.has(Violation::Expired));

        let fresh = signer.sign(payload_with_exp(now() - skew + one_ms)).unwrap();
        let report = verifier
            .verify_envelope(&fresh, VerifyOptions::at(now()))
            .unwrap();
        assert!(report.ok, "{:?}", report.violations);
    }

    #[test]
    fn test_iat_in_future_and_invalid_times() {
        let (signer, verifier) = setup();
        let mut p = payload();
        p["iat"] = json!((now() + Duration::minutes(10)).to_rfc3339());
        p["exp"] = json!("tomorrow");
        let envelope = signer.sign(p).unwrap();

        let report = verifier
            .verify_envelope(&envelope, VerifyOptions::at(now()))
            .unwrap();
        assert!(report.has(Violation::IatInFuture));
        assert!(report.has(Violation::InvalidExp));
        assert!(!report.has(Violation::BadSignature));
    }

    #[test]
    fn test_structural_violations_collected_and_skip_signature() {
        let (_, verifier) = setup();
        let raw = json!({
            "protected": {"v": 1, "typ": "AP2-MANDATE", "alg": "RS256"},
            "payload": payload(),
        });
        let report = verifier.verify(&raw, VerifyOptions::at(now())).unwrap();
        assert_eq!(
            report.violations,
            vec![
                Violation::MissingSignature,
                Violation::MissingKid,
                Violation::UnsupportedAlg
            ]
        );

        let report = verifier.verify(&json!({}), VerifyOptions::at(now())).unwrap();
        assert_eq!(
            report.violations,
            vec![
                Violation::MissingProtected,
                Violation::MissingPayload,
                Violation::MissingSignature
            ]
        );
        assert_eq!(report.payload_hash, None);
    }

    #[test]
    fn test_unknown_kid_fails_closed() {
        let (_, verifier) = setup();
        let other = MandateSigner::new("stranger", SigningKey::generate(&mut OsRng));
        let envelope = other.sign(payload()).unwrap();
        assert!(matches!(
            verifier.verify_envelope(&envelope, VerifyOptions::at(now())),
            Err(MandateError::UnknownKid(kid)) if kid == "stranger"
        ));
    }

    #[test]
    fn test_report_wire_shape() {
        let report = VerificationReport {
            ok: false,
            violations: vec![Violation::Expired],
            kid: Some("k".to_string()),
            payload_hash: Some("sha256:00".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"ok": false, "violations": ["expired"], "kid": "k", "payloadHash": "sha256:00"})
        );
    }

    #[test]
    fn test_verify_chain_detects_broken_link() {
        let (signer, _) = setup();
        let intent = signer.sign(payload()).unwrap();
        let mut quote_payload = payload();
        quote_payload["type"] = json!("ap2.quote");
        quote_payload["prev_hash"] = json!(intent.payload_hash());
        let quote = signer.sign(quote_payload.clone()).unwrap();

        assert!(verify_chain(&[intent.clone(), quote]).is_empty());

        quote_payload["prev_hash"] = json!("sha256:deadbeef");
        let forged = signer.sign(quote_payload).unwrap();
        let broken = verify_chain(&[intent.clone(), forged]);
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].index, 1);
        assert_eq!(broken[0].expected, intent.payload_hash());
    }
}
