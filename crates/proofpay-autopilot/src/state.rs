//! Loop state persisted between runs

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AutopilotError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    #[serde(default)]
    pub ticks: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_tick_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Alert subject -> last time it was raised
    #[serde(default)]
    pub last_alerts: HashMap<String, DateTime<Utc>>,
}

impl LoopState {
    /// Load from `path`; a missing file is a fresh state
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| AutopilotError::StateIo(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(AutopilotError::StateIo(format!("{}: {e}", path.display()))),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AutopilotError::StateIo(format!("{}: {e}", parent.display())))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| AutopilotError::StateIo(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| AutopilotError::StateIo(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), ticks = self.ticks, "Loop state saved");
        Ok(())
    }

    /// Should an alert for `subject` fire now? Records it when it does.
    pub fn should_alert(&mut self, subject: &str, now: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.last_alerts.get(subject) {
            Some(last) if now - *last < cooldown => false,
            _ => {
                self.last_alerts.insert(subject.to_string(), now);
                true
            }
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.ticks += 1;
        self.consecutive_failures = 0;
        self.last_tick_at = Some(now);
        self.last_success_at = Some(now);
        self.last_error = None;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>, error: &str) {
        self.ticks += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_tick_at = Some(now);
        self.last_error = Some(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_cooldown() {
        let mut state = LoopState::default();
        let now = Utc::now();
        let cooldown = Duration::hours(1);
        assert!(state.should_alert("stuck_batch:b1", now, cooldown));
        assert!(!state.should_alert("stuck_batch:b1", now + Duration::minutes(59), cooldown));
        assert!(state.should_alert("stuck_batch:b2", now, cooldown));
        assert!(state.should_alert("stuck_batch:b1", now + Duration::hours(2), cooldown));
    }

    #[tokio::test]
    async fn test_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("loop.json");
        assert_eq!(LoopState::load(&path).await.unwrap(), LoopState::default());

        let mut state = LoopState::default();
        state.record_failure(Utc::now(), "processor down");
        state.should_alert("stuck_request:r1", Utc::now(), Duration::hours(1));
        state.save(&path).await.unwrap();

        let loaded = LoopState::load(&path).await.unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.consecutive_failures, 1);
    }
}
