//! ProofPay Agent
//!
//! Settles verified AP2 intent mandates into payout requests and runs the
//! payout control loop that batches, approves, submits and reconciles them.
//!
//! # Usage
//!
//! ```bash
//! # Run the control loop until Ctrl+C / SIGTERM
//! proofpay-agent --config config/agent.toml run
//!
//! # One control loop pass, report printed as JSON
//! proofpay-agent tick
//!
//! # Settle one intent envelope
//! proofpay-agent settle --file intent.json
//!
//! # Environment overrides
//! PROOFPAY__STORE__URL=https://records.example proofpay-agent run
//! ```
//!
//! Exit codes: 0 success, 1 error, 2 work refused (intent not settled,
//! evidence chain broken), 3 invariant breaker tripped.

mod config;

use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use proofpay_autopilot::{AutonomousControlLoop, AutopilotError, HttpProcessorClient};
use proofpay_integrity::{
    ingest_event, EvidenceIntegrityChain, InvariantCore, MoneyMovedGate, ProofValidator,
    WebhookConfirmation,
};
use proofpay_mandate::{
    signing_key_from_env, EnvKeyResolver, KeyResolver, MandateEnvelope, MandateSigner,
};
use proofpay_resilience::{CircuitBreaker, DedupeCache, RetryingClient};
use proofpay_settlement::SettlementOrchestrator;
use proofpay_store::{
    Collections, EntityRegistry, FailoverStore, FileStore, HttpRecordStore, MemoryStore,
    RecordStore, LEDGER_EVENT, WEBHOOK_EVENT,
};
use proofpay_types::{LedgerEvent, WebhookEvent};

use crate::config::{AgentConfig, StoreMode};

const EXIT_ERROR: u8 = 1;
const EXIT_REFUSED: u8 = 2;
const EXIT_INVARIANT_HALT: u8 = 3;

// =============================================================================
// CLI Arguments
// =============================================================================

/// ProofPay Agent - mandate settlement and payout autopilot
#[derive(Parser, Debug)]
#[command(name = "proofpay-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, JSON, or YAML)
    #[arg(short, long, env = "PROOFPAY_CONFIG")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PROOFPAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (json, pretty)
    #[arg(long, env = "PROOFPAY_LOG_FORMAT")]
    log_format: Option<String>,

    /// Use only the local offline store
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the payout control loop until shutdown
    Run,
    /// Run a single control loop pass
    Tick,
    /// Settle one intent mandate envelope
    Settle(EnvelopeInput),
    /// Store ledger events from a JSON array, classifying unreferenced ones
    Ingest(EnvelopeInput),
    /// Check every evidence block hash and link
    VerifyChain,
}

#[derive(clap::Args, Debug)]
struct EnvelopeInput {
    /// Read JSON from this file
    #[arg(long, conflicts_with = "json")]
    file: Option<String>,

    /// JSON given inline (stdin when neither is set)
    #[arg(long)]
    json: Option<String>,
}

impl EnvelopeInput {
    fn read(&self) -> anyhow::Result<String> {
        if let Some(json) = &self.json {
            return Ok(json.clone());
        }
        if let Some(path) = &self.file {
            return std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("cannot read {path}: {e}"));
        }
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match execute(args).await {
        Ok(code) => code,
        Err(e) => {
            let halted = e
                .downcast_ref::<AutopilotError>()
                .is_some_and(AutopilotError::is_invariant_halt);
            let reason = if halted { "invariant_halt" } else { "error" };
            println!(
                "{}",
                serde_json::json!({ "ok": false, "reason": reason, "error": format!("{e:#}") })
            );
            if halted {
                tracing::error!(error = %e, "Halted by invariant breaker");
                ExitCode::from(EXIT_INVARIANT_HALT)
            } else {
                tracing::error!(error = %e, "Agent failed");
                ExitCode::from(EXIT_ERROR)
            }
        }
    }
}

async fn execute(args: Args) -> anyhow::Result<ExitCode> {
    let mut agent_config = if args.offline {
        AgentConfig::offline()
    } else {
        AgentConfig::load(args.config.as_deref())?
    };
    if let Some(level) = args.log_level {
        agent_config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        agent_config.logging.format = format;
    }

    init_logging(&agent_config.logging);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        store = ?agent_config.store.mode,
        "Starting ProofPay agent"
    );

    agent_config.validate()?;

    let runtime = Runtime::init(&agent_config).await?;

    match args.command {
        Command::Run => {
            let (autopilot, _) = runtime.autopilot(&agent_config).await?;
            autopilot.restore_state().await?;

            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                shutdown_signal().await;
                let _ = tx.send(true);
            });

            let state = autopilot.run(rx).await?;
            print_json(&state)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Tick => {
            let (autopilot, submissions) = runtime.autopilot(&agent_config).await?;
            autopilot.restore_state().await?;
            let report = autopilot.tick().await;
            autopilot.persist_state().await?;
            if let Err(e) = submissions.flush().await {
                tracing::warn!(error = %e, "Failed to flush submission cache");
            }
            print_json(&report?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Settle(input) => {
            let envelope: MandateEnvelope = serde_json::from_str(&input.read()?)
                .map_err(|e| anyhow::anyhow!("invalid envelope JSON: {e}"))?;
            let orchestrator = runtime.orchestrator(&agent_config)?;
            let outcome = orchestrator.settle(&envelope).await?;
            println!("{}", outcome.report());
            if outcome.is_emitted() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_REFUSED))
            }
        }
        Command::Ingest(input) => {
            let events: Vec<LedgerEvent> = serde_json::from_str(&input.read()?)
                .map_err(|e| anyhow::anyhow!("expected a JSON array of ledger events: {e}"))?;
            let collection = runtime.collections.collection::<LedgerEvent>(LEDGER_EVENT)?;
            let mut stored = Vec::with_capacity(events.len());
            for event in events {
                let outcome = ingest_event(&collection, event).await?;
                stored.push(serde_json::json!({
                    "id": outcome.id(),
                    "status": outcome.document.value.status.map(|s| s.as_str()),
                    "deduped": outcome.deduped,
                }));
            }
            println!("{}", serde_json::json!({ "ok": true, "events": stored }));
            Ok(ExitCode::SUCCESS)
        }
        Command::VerifyChain => {
            let verification = runtime.evidence.verify_chain().await;
            print_json(&verification)?;
            if verification.ok {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_REFUSED))
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

// =============================================================================
// Initialization Functions
// =============================================================================

/// Initialize tracing/logging
fn init_logging(config: &config::LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    // Logs go to stderr; stdout carries the JSON reports
    match config.format.as_str() {
        "json" => {
            subscriber
                .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            subscriber
                .with(fmt::layer().pretty().with_target(true).with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Shared components built once per process
struct Runtime {
    collections: Collections,
    invariants: Arc<InvariantCore>,
    evidence: Arc<EvidenceIntegrityChain>,
    gate: Arc<MoneyMovedGate>,
}

impl Runtime {
    async fn init(config: &AgentConfig) -> anyhow::Result<Self> {
        let paths = &config.paths;
        tokio::fs::create_dir_all(&paths.data_dir).await?;

        let store = open_store(config).await?;
        let collections = Collections::new(
            store,
            EntityRegistry::standard(),
            config.field_maps.clone(),
        )?;

        let invariants = Arc::new(InvariantCore::with_failure_log(
            paths.resolve(&paths.invariant_log),
        ));
        let evidence = Arc::new(
            EvidenceIntegrityChain::open(paths.resolve(&paths.evidence_file), invariants.clone())
                .await?,
        );

        let webhooks = collections.collection::<WebhookEvent>(WEBHOOK_EVENT)?;
        let validator = ProofValidator::new(
            invariants.clone(),
            Arc::new(WebhookConfirmation::new(webhooks)),
        )
        .with_temporal_policy(config.integrity.temporal_policy)
        .with_allowed_recipients(config.integrity.allowed_recipients.iter().cloned());

        let gate = Arc::new(
            MoneyMovedGate::new(invariants.clone(), Arc::new(validator), evidence.clone())
                .with_policy(config.integrity.money_moved.clone()),
        );

        tracing::info!(
            backend = collections.store().backend_label(),
            evidence_blocks = evidence.len().await,
            "Runtime initialized"
        );

        Ok(Self {
            collections,
            invariants,
            evidence,
            gate,
        })
    }

    fn orchestrator(&self, config: &AgentConfig) -> anyhow::Result<SettlementOrchestrator> {
        let signing = &config.signing;
        let key = signing_key_from_env(&signing.private_key_env)?;
        let signer = Arc::new(MandateSigner::new(signing.kid.clone(), key));
        let resolver: Arc<dyn KeyResolver> = Arc::new(EnvKeyResolver::new(
            signing.public_keys_env.clone(),
            signing.public_key_prefix.clone(),
        ));
        Ok(SettlementOrchestrator::new(
            &self.collections,
            resolver,
            signer,
            config.settlement.clone(),
        )?)
    }

    /// Control loop and the submission cache it shares
    async fn autopilot(
        &self,
        config: &AgentConfig,
    ) -> anyhow::Result<(AutonomousControlLoop, Arc<DedupeCache>)> {
        let settings = &config.processor;
        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("processor.url is required to run the control loop"))?;
        let breaker = Arc::new(CircuitBreaker::new("processor", settings.breaker.clone()));
        let mut client = RetryingClient::new(url, settings.retry.clone(), breaker)?;
        if let Some(token) = &settings.api_token {
            client = client.with_bearer_token(token.clone());
        }

        let paths = &config.paths;
        let submissions = Arc::new(
            DedupeCache::load(
                paths.resolve(&paths.submission_cache),
                config.autopilot.submission_dedupe_ttl(),
            )
            .await?,
        );

        let mut autopilot_config = config.autopilot.clone();
        if autopilot_config.state_path.is_none() {
            autopilot_config.state_path = Some(paths.resolve(&paths.loop_state));
        }

        let autopilot = AutonomousControlLoop::new(
            &self.collections,
            self.gate.clone(),
            self.invariants.clone(),
            Arc::new(HttpProcessorClient::new(client)),
            submissions.clone(),
            autopilot_config,
        )?;
        Ok((autopilot, submissions))
    }
}

/// Record store for the configured mode
async fn open_store(config: &AgentConfig) -> anyhow::Result<Arc<dyn RecordStore>> {
    let settings = &config.store;
    let paths = &config.paths;
    let offline_path = paths.resolve(&paths.offline_store);

    let store: Arc<dyn RecordStore> = match settings.mode {
        StoreMode::Memory => Arc::new(MemoryStore::new()),
        StoreMode::File => Arc::new(FileStore::open(&offline_path).await?),
        StoreMode::Http => {
            let url = settings.url.as_deref().unwrap_or_default();
            let breaker = Arc::new(CircuitBreaker::new("record-store", settings.breaker.clone()));
            let mut client = RetryingClient::new(url, settings.retry.clone(), breaker)?;
            if let Some(token) = &settings.api_token {
                client = client.with_bearer_token(token.clone());
            }
            let http: Arc<dyn RecordStore> = Arc::new(HttpRecordStore::new(client));
            if settings.failover {
                let fallback: Arc<dyn RecordStore> = Arc::new(FileStore::open(&offline_path).await?);
                Arc::new(FailoverStore::new(http, fallback))
            } else {
                http
            }
        }
    };
    Ok(store)
}

// =============================================================================
// Graceful Shutdown
// =============================================================================

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, finishing the current tick");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, finishing the current tick");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
