//! Control loop settings

use std::path::PathBuf;

use chrono::{DateTime, Duration, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutopilotConfig {
    /// Delay between successful ticks
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Cap for the failure backoff
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Lease holder identity of this process
    #[serde(default = "default_holder")]
    pub holder: String,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: i64,

    /// UTC hour at which batch creation opens (inclusive)
    #[serde(default)]
    pub payout_window_start_hour: u32,
    /// UTC hour at which batch creation closes (exclusive); may wrap midnight
    #[serde(default = "default_payout_window_end_hour")]
    pub payout_window_end_hour: u32,
    /// Balance that must remain available before new batches are created
    #[serde(default)]
    pub min_available_balance: Decimal,

    /// Age a batch must reach before auto-approval
    #[serde(default = "default_approval_delay_secs")]
    pub approval_delay_secs: i64,
    /// Batches above this total need a second factor
    #[serde(default = "default_two_factor_threshold")]
    pub two_factor_threshold: Decimal,
    /// Batches above this total are never auto-approved
    #[serde(default = "default_max_batch_total")]
    pub max_batch_total: Decimal,

    #[serde(default = "default_stuck_batch_after_secs")]
    pub stuck_batch_after_secs: i64,
    #[serde(default = "default_stuck_request_after_secs")]
    pub stuck_request_after_secs: i64,
    /// Minimum time between two alerts for the same subject
    #[serde(default = "default_alert_cooldown_secs")]
    pub alert_cooldown_secs: i64,

    /// How long a submitted batch id is remembered locally
    #[serde(default = "default_submission_dedupe_ttl_secs")]
    pub submission_dedupe_ttl_secs: i64,

    /// Persisted loop state; none keeps it in memory
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_max_backoff_secs() -> u64 {
    900
}

fn default_holder() -> String {
    "proofpay-autopilot".to_string()
}

fn default_lease_ttl_secs() -> i64 {
    300
}

fn default_payout_window_end_hour() -> u32 {
    24
}

fn default_approval_delay_secs() -> i64 {
    300
}

fn default_two_factor_threshold() -> Decimal {
    Decimal::from(10_000)
}

fn default_max_batch_total() -> Decimal {
    Decimal::from(50_000)
}

fn default_stuck_batch_after_secs() -> i64 {
    6 * 3600
}

fn default_stuck_request_after_secs() -> i64 {
    24 * 3600
}

fn default_alert_cooldown_secs() -> i64 {
    3600
}

fn default_submission_dedupe_ttl_secs() -> i64 {
    7 * 24 * 3600
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            holder: default_holder(),
            lease_ttl_secs: default_lease_ttl_secs(),
            payout_window_start_hour: 0,
            payout_window_end_hour: default_payout_window_end_hour(),
            min_available_balance: Decimal::ZERO,
            approval_delay_secs: default_approval_delay_secs(),
            two_factor_threshold: default_two_factor_threshold(),
            max_batch_total: default_max_batch_total(),
            stuck_batch_after_secs: default_stuck_batch_after_secs(),
            stuck_request_after_secs: default_stuck_request_after_secs(),
            alert_cooldown_secs: default_alert_cooldown_secs(),
            submission_dedupe_ttl_secs: default_submission_dedupe_ttl_secs(),
            state_path: None,
        }
    }
}

impl AutopilotConfig {
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs)
    }

    /// Delay before the next tick after `consecutive_failures` failed ticks
    pub fn next_delay(&self, consecutive_failures: u32) -> std::time::Duration {
        let base = self.tick_interval_secs.max(1);
        let factor = 1u64.checked_shl(consecutive_failures.min(32)).unwrap_or(u64::MAX);
        std::time::Duration::from_secs(base.saturating_mul(factor).min(self.max_backoff_secs.max(base)))
    }

    /// Is `now` inside the UTC payout window?
    pub fn in_payout_window(&self, now: DateTime<Utc>) -> bool {
        let (start, end) = (self.payout_window_start_hour, self.payout_window_end_hour);
        let hour = now.hour();
        if start == end {
            return false;
        }
        if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::seconds(self.lease_ttl_secs)
    }

    pub fn submission_dedupe_ttl(&self) -> Duration {
        Duration::seconds(self.submission_dedupe_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = AutopilotConfig {
            tick_interval_secs: 10,
            max_backoff_secs: 60,
            ..AutopilotConfig::default()
        };
        let secs: Vec<u64> = (0..5).map(|n| config.next_delay(n).as_secs()).collect();
        assert_eq!(secs, [10, 20, 40, 60, 60]);
        assert_eq!(config.next_delay(200).as_secs(), 60);
    }

    #[test]
    fn test_payout_window_wraps_midnight() {
        let config = AutopilotConfig {
            payout_window_start_hour: 22,
            payout_window_end_hour: 4,
            ..AutopilotConfig::default()
        };
        let at = |h| Utc.with_ymd_and_hms(2026, 3, 1, h, 30, 0).unwrap();
        assert!(config.in_payout_window(at(23)));
        assert!(config.in_payout_window(at(3)));
        assert!(!config.in_payout_window(at(12)));

        assert!(AutopilotConfig::default().in_payout_window(at(12)));
    }
}
