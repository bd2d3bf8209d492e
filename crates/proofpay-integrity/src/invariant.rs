//! Invariant breakers
//!
//! A failed invariant trips a breaker named after it. Tripped breakers stay
//! tripped for the life of the process; there is no reset. Every failure is
//! appended to a JSON-lines failure log when one is configured.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use proofpay_types::{decimal_from_json, normalize_currency, LedgerEvent};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{IntegrityError, InvariantViolation};

/// State of a tripped breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrippedBreaker {
    pub name: String,
    /// Reason of the first failure that tripped it
    pub reason: String,
    pub tripped_at: DateTime<Utc>,
    pub failures: u64,
}

#[derive(Debug, Serialize)]
struct FailureLogLine<'a> {
    invariant: &'a str,
    reason: &'a str,
    at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct InvariantCore {
    breakers: Mutex<BTreeMap<String, TrippedBreaker>>,
    failure_log: Option<PathBuf>,
}

impl InvariantCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append every failure to `path` as one JSON object per line
    pub fn with_failure_log(path: impl Into<PathBuf>) -> Self {
        Self {
            breakers: Mutex::default(),
            failure_log: Some(path.into()),
        }
    }

    pub fn failure_log(&self) -> Option<&Path> {
        self.failure_log.as_deref()
    }

    /// Trip `name` and return a violation unless `condition` holds
    pub fn assert_invariant(
        &self,
        name: &str,
        condition: bool,
        reason: impl Into<String>,
    ) -> Result<(), InvariantViolation> {
        if condition {
            return Ok(());
        }
        Err(self.trip(name, reason.into()))
    }

    /// Trip `name` unconditionally
    pub fn fail(&self, name: &str, reason: impl Into<String>) -> InvariantViolation {
        self.trip(name, reason.into())
    }

    fn trip(&self, name: &str, reason: String) -> InvariantViolation {
        let now = Utc::now();
        {
            let mut breakers = self.breakers.lock();
            breakers
                .entry(name.to_string())
                .and_modify(|b| b.failures += 1)
                .or_insert_with(|| TrippedBreaker {
                    name: name.to_string(),
                    reason: reason.clone(),
                    tripped_at: now,
                    failures: 1,
                });
        }
        error!(invariant = %name, reason = %reason, "INVARIANT_FAIL");
        self.append_failure(name, &reason, now);
        InvariantViolation {
            invariant: name.to_string(),
            reason,
        }
    }

    fn append_failure(&self, name: &str, reason: &str, at: DateTime<Utc>) {
        let Some(path) = &self.failure_log else {
            return;
        };
        let line = FailureLogLine {
            invariant: name,
            reason,
            at,
        };
        let written = serde_json::to_string(&line)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                }
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| e.to_string())?;
                writeln!(file, "{json}").map_err(|e| e.to_string())
            });
        // The violation is still returned; only the log line is lost
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "Failed to append invariant failure log");
        }
    }

    pub fn is_tripped(&self, name: &str) -> bool {
        self.breakers.lock().contains_key(name)
    }

    pub fn any_tripped(&self) -> bool {
        !self.breakers.lock().is_empty()
    }

    pub fn tripped_breakers(&self) -> Vec<TrippedBreaker> {
        self.breakers.lock().values().cloned().collect()
    }

    /// Run the full event battery, collecting every failure
    pub fn assert_all_invariants(&self, event: &LedgerEvent) -> Result<(), IntegrityError> {
        let proof = event.metadata.proof.as_ref();
        let proof_amount: Option<Decimal> = proof
            .and_then(|p| p.get("amount"))
            .and_then(|a| decimal_from_json(a).ok());

        let checks = [
            (
                "event_amount_positive",
                event.amount > Decimal::ZERO,
                format!("event_amount_not_positive: {}", event.amount),
            ),
            (
                "event_currency_valid",
                normalize_currency(&event.currency).is_ok(),
                format!("event_currency_invalid: {:?}", event.currency),
            ),
            (
                "event_status_present",
                event.status.is_some(),
                "event_status_missing".to_string(),
            ),
            (
                "event_not_hallucination",
                !event.is_hallucination(),
                "event_is_hallucination".to_string(),
            ),
            (
                "event_reference_resolvable",
                event.has_resolvable_reference(),
                "event_reference_missing".to_string(),
            ),
            (
                "proof_amount_matches",
                proof_amount.map_or(true, |a| a == event.amount),
                format!(
                    "amount_mismatch: event {} proof {}",
                    event.amount,
                    proof_amount.map(|a| a.to_string()).unwrap_or_default()
                ),
            ),
        ];

        let failures: Vec<InvariantViolation> = checks
            .into_iter()
            .filter_map(|(name, ok, reason)| self.assert_invariant(name, ok, reason).err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(IntegrityError::Compound(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proofpay_types::{EventMetadata, EventStatus};
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_failure_trips_named_breaker_permanently() {
        let core = InvariantCore::new();
        assert!(core.assert_invariant("amount_match", true, "fine").is_ok());
        assert!(!core.any_tripped());

        let err = core
            .assert_invariant("amount_match", false, "amount_mismatch")
            .unwrap_err();
        assert_eq!(err.to_string(), "INVARIANT_FAIL: amount_mismatch");
        assert!(core.is_tripped("amount_match"));

        // A later passing check does not reset it
        core.assert_invariant("amount_match", true, "fine").unwrap();
        assert_eq!(core.tripped_breakers().len(), 1);
        assert_eq!(core.tripped_breakers()[0].reason, "amount_mismatch");
    }

    #[test]
    fn test_failure_log_is_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("invariants.jsonl");
        let core = InvariantCore::with_failure_log(&path);
        let _ = core.assert_invariant("a", false, "first");
        let _ = core.assert_invariant("b", false, "second");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["invariant"], "b");
        assert_eq!(lines[1]["reason"], "second");
    }

    #[test]
    fn test_battery_reports_every_failure() {
        let core = InvariantCore::new();
        let mut event = LedgerEvent::new(dec!(-5), "");
        event.metadata = EventMetadata {
            proof: Some(json!({"amount": "7"})),
            ..Default::default()
        };

        let err = core.assert_all_invariants(&event).unwrap_err();
        let names: Vec<_> = err.violations().iter().map(|v| v.invariant.clone()).collect();
        assert_eq!(
            names,
            [
                "event_amount_positive",
                "event_currency_valid",
                "event_status_present",
                "event_reference_resolvable",
                "proof_amount_matches",
            ]
        );
        assert!(err.to_string().starts_with("INVARIANT_FAIL: 5 checks failed"));
    }

    #[test]
    fn test_battery_passes_clean_event() {
        let core = InvariantCore::new();
        let mut event = LedgerEvent::new(dec!(150), "USD");
        event.status = Some(EventStatus::Confirmed);
        event.metadata.psp_transaction_id = Some("pi_1".into());
        event.metadata.proof = Some(json!({"amount": 150}));
        assert!(core.assert_all_invariants(&event).is_ok());
        assert!(core.tripped_breakers().is_empty());
    }
}
