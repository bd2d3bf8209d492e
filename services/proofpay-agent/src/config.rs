//! Agent Configuration
//!
//! Settings come from an optional file, `config/default`, `config/local` and
//! `PROOFPAY__*` environment variables, in that order of precedence (last
//! wins). A `.env` file is loaded first when present.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use proofpay_autopilot::AutopilotConfig;
use proofpay_integrity::{MoneyMovedPolicy, TemporalPolicy};
use proofpay_mandate::{PRIVATE_KEY_VAR, PUBLIC_KEYS_JSON_VAR, PUBLIC_KEY_VAR_PREFIX};
use proofpay_resilience::{BreakerConfig, RetryPolicy};
use proofpay_settlement::OrchestratorConfig;
use proofpay_store::{EntityRegistry, FieldMapConfig};

/// Agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Record store backend
    #[serde(default)]
    pub store: StoreSettings,

    /// Payout processor endpoint
    #[serde(default)]
    pub processor: ProcessorSettings,

    /// Mandate signing keys
    #[serde(default)]
    pub signing: SigningSettings,

    /// Mandate orchestration
    #[serde(default)]
    pub settlement: OrchestratorConfig,

    /// Payout control loop
    #[serde(default)]
    pub autopilot: AutopilotConfig,

    /// Money-moved gate and proof validation
    #[serde(default)]
    pub integrity: IntegritySettings,

    /// Local state files
    #[serde(default)]
    pub paths: PathSettings,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Logical field name to store column, per entity
    #[serde(default)]
    pub field_maps: FieldMapConfig,
}

/// Which record store backs the agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Remote record API, optionally failing over to the offline file
    #[default]
    Http,
    /// Local JSON file only
    File,
    /// In-process, lost on exit
    Memory,
}

/// Record store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub mode: StoreMode,

    /// Base URL of the record API (http mode)
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token for the record API
    #[serde(default)]
    pub api_token: Option<String>,

    /// Switch to the offline file when the record API is unreachable
    #[serde(default = "default_failover")]
    pub failover: bool,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            mode: StoreMode::default(),
            url: None,
            api_token: None,
            failover: default_failover(),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Payout processor settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorSettings {
    /// Base URL of the processor API; required by `run` and `tick`
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub breaker: BreakerConfig,
}

/// Where signing and verification keys are read from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningSettings {
    /// Key id stamped on mandates this agent signs
    #[serde(default = "default_kid")]
    pub kid: String,

    /// Variable holding the Ed25519 private key PEM
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,

    /// Variable holding a JSON map of kid to public key PEM
    #[serde(default = "default_public_keys_env")]
    pub public_keys_env: String,

    /// Prefix of per-kid public key variables
    #[serde(default = "default_public_key_prefix")]
    pub public_key_prefix: String,
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            kid: default_kid(),
            private_key_env: default_private_key_env(),
            public_keys_env: default_public_keys_env(),
            public_key_prefix: default_public_key_prefix(),
        }
    }
}

/// Proof validation settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegritySettings {
    #[serde(default)]
    pub temporal_policy: TemporalPolicy,

    /// Payout recipients a proof may name; empty allows any
    #[serde(default)]
    pub allowed_recipients: Vec<String>,

    #[serde(default)]
    pub money_moved: MoneyMovedPolicy,
}

/// Local state files, relative names resolved under `data_dir`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_offline_store")]
    pub offline_store: PathBuf,

    #[serde(default = "default_evidence_file")]
    pub evidence_file: PathBuf,

    #[serde(default = "default_invariant_log")]
    pub invariant_log: PathBuf,

    #[serde(default = "default_submission_cache")]
    pub submission_cache: PathBuf,

    #[serde(default = "default_loop_state")]
    pub loop_state: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            offline_store: default_offline_store(),
            evidence_file: default_evidence_file(),
            invariant_log: default_invariant_log(),
            submission_cache: default_submission_cache(),
            loop_state: default_loop_state(),
        }
    }
}

impl PathSettings {
    /// `path` under `data_dir` unless it is absolute
    pub fn resolve(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_failover() -> bool {
    true
}

fn default_kid() -> String {
    "proofpay-settler-1".to_string()
}

fn default_private_key_env() -> String {
    PRIVATE_KEY_VAR.to_string()
}

fn default_public_keys_env() -> String {
    PUBLIC_KEYS_JSON_VAR.to_string()
}

fn default_public_key_prefix() -> String {
    PUBLIC_KEY_VAR_PREFIX.to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_offline_store() -> PathBuf {
    PathBuf::from("offline_store.json")
}

fn default_evidence_file() -> PathBuf {
    PathBuf::from("evidence_chain.json")
}

fn default_invariant_log() -> PathBuf {
    PathBuf::from("invariant_failures.jsonl")
}

fn default_submission_cache() -> PathBuf {
    PathBuf::from("submission_cache.json")
}

fn default_loop_state() -> PathBuf {
    PathBuf::from("autopilot_state.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl AgentConfig {
    /// Load configuration from files and environment
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false));

        // PROOFPAY__STORE__URL, PROOFPAY__AUTOPILOT__TICK_INTERVAL_SECS, ...
        builder = builder.add_source(
            config::Environment::with_prefix("PROOFPAY")
                .separator("__")
                .try_parsing(true),
        );

        let config: AgentConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        self.field_maps.validate(&EntityRegistry::standard())?;

        if self.store.mode == StoreMode::Http {
            match self.store.url.as_deref() {
                Some(url) if !url.trim().is_empty() => {}
                _ => anyhow::bail!("store.url is required when store.mode is http"),
            }
        }

        if let Some(url) = &self.processor.url {
            if url.trim().is_empty() {
                anyhow::bail!("processor.url is set but empty");
            }
        }

        if self.signing.kid.trim().is_empty() {
            anyhow::bail!("signing.kid must not be empty");
        }

        let window = &self.autopilot;
        if window.payout_window_start_hour > 23 || window.payout_window_end_hour > 24 {
            anyhow::bail!(
                "payout window hours out of range: {}..{}",
                window.payout_window_start_hour,
                window.payout_window_end_hour
            );
        }
        if window.tick_interval_secs == 0 {
            anyhow::bail!("autopilot.tick_interval_secs must be positive");
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            anyhow::bail!(
                "logging.format must be json or pretty, got {:?}",
                self.logging.format
            );
        }

        Ok(())
    }

    /// Configuration for local runs without external services
    pub fn offline() -> Self {
        let mut config = Self::default();
        config.store.mode = StoreMode::File;
        config.store.failover = false;
        config
    }
}
