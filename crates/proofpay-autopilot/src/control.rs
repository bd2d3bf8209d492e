//! The autonomous control loop
//!
//! One tick runs its tasks in a fixed order, sharing what they learn through
//! a [`TickReport`]:
//!
//! ```text
//! health → balance → reporting → batching → approval → submission → reconciliation
//! ```
//!
//! The payout tasks (batching onwards) only run while this process holds the
//! `autopilot:payouts` work lease, and never while the record store has
//! fallen back to offline mode. A failed tick doubles the delay before the
//! next one, up to `max_backoff_secs`. A tripped invariant breaker ends
//! [`AutonomousControlLoop::run`] with [`AutopilotError::InvariantHalt`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use proofpay_crypto::sha256_hex;
use proofpay_integrity::{IntegrityError, InvariantCore, MoneyMovedGate};
use proofpay_resilience::DedupeCache;
use proofpay_settlement::SettlementIndex;
use proofpay_store::{
    acquire_work_lease, create_idempotent, Collection, Collections, Document, Filter,
    LeaseOutcome, LeaseRecord, LeaseRequest, ListQuery, LEDGER_EVENT, PAYOUT_BATCH,
    PAYOUT_REQUEST, SETTLEMENT_INDEX, WORK_LEASE,
};
use proofpay_types::{
    EventStatus, LedgerEvent, PayoutBatch, PayoutBatchStatus, PayoutRequest, PayoutRequestStatus,
};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::AutopilotConfig;
use crate::error::{AutopilotError, Result};
use crate::processor::{ProcessorBatchStatus, ProcessorClient};
use crate::report::{Alert, AlertKind, CurrencyBalance, TickReport};
use crate::state::LoopState;

/// Lease guarding the payout tasks across instances
pub const PAYOUT_LEASE_KEY: &str = "autopilot:payouts";

pub struct AutonomousControlLoop {
    config: AutopilotConfig,
    collections: Collections,
    events: Collection<LedgerEvent>,
    requests: Collection<PayoutRequest>,
    batches: Collection<PayoutBatch>,
    leases: Collection<LeaseRecord>,
    index: SettlementIndex,
    gate: Arc<MoneyMovedGate>,
    invariants: Arc<InvariantCore>,
    processor: Arc<dyn ProcessorClient>,
    submissions: Arc<DedupeCache>,
    state: Mutex<LoopState>,
}

impl std::fmt::Debug for AutonomousControlLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutonomousControlLoop")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl AutonomousControlLoop {
    pub fn new(
        collections: &Collections,
        gate: Arc<MoneyMovedGate>,
        invariants: Arc<InvariantCore>,
        processor: Arc<dyn ProcessorClient>,
        submissions: Arc<DedupeCache>,
        config: AutopilotConfig,
    ) -> Result<Self> {
        Ok(Self {
            events: collections.collection(LEDGER_EVENT)?,
            requests: collections.collection(PAYOUT_REQUEST)?,
            batches: collections.collection(PAYOUT_BATCH)?,
            leases: collections.collection(WORK_LEASE)?,
            index: SettlementIndex::new(collections.collection(SETTLEMENT_INDEX)?),
            collections: collections.clone(),
            gate,
            invariants,
            processor,
            submissions,
            state: Mutex::new(LoopState::default()),
            config,
        })
    }

    pub fn config(&self) -> &AutopilotConfig {
        &self.config
    }

    pub fn state(&self) -> LoopState {
        self.state.lock().clone()
    }

    /// Load persisted state, if a state path is configured
    pub async fn restore_state(&self) -> Result<()> {
        if let Some(path) = &self.config.state_path {
            let loaded = LoopState::load(path).await?;
            info!(
                path = %path.display(),
                ticks = loaded.ticks,
                consecutive_failures = loaded.consecutive_failures,
                "Loop state restored"
            );
            *self.state.lock() = loaded;
        }
        Ok(())
    }

    pub async fn persist_state(&self) -> Result<()> {
        if let Some(path) = &self.config.state_path {
            let snapshot = self.state();
            snapshot.save(path).await?;
        }
        Ok(())
    }

    /// Tick until `shutdown` turns true (or its sender goes away).
    ///
    /// The current tick always finishes; state and the submission cache are
    /// flushed before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<LoopState> {
        info!(
            interval_secs = self.config.tick_interval_secs,
            holder = %self.config.holder,
            "Control loop started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = Utc::now();
            let delay = match self.tick_at(now).await {
                Ok(report) => {
                    self.state.lock().record_success(now);
                    info!(
                        tick = report.tick,
                        batches_created = report.batches_created.len(),
                        submitted = report.submitted.len(),
                        completed = report.completed.len(),
                        alerts = report.alerts.len(),
                        "Tick complete"
                    );
                    self.config.tick_interval()
                }
                Err(e) if e.is_invariant_halt() => {
                    self.state.lock().record_failure(now, &e.to_string());
                    error!(error = %e, "Invariant breaker tripped, halting control loop");
                    self.shutdown_flush().await;
                    return Err(e);
                }
                Err(e) => {
                    let failures = {
                        let mut state = self.state.lock();
                        state.record_failure(now, &e.to_string());
                        state.consecutive_failures
                    };
                    let delay = self.config.next_delay(failures);
                    warn!(
                        error = %e,
                        consecutive_failures = failures,
                        retry_in_secs = delay.as_secs(),
                        "Tick failed"
                    );
                    delay
                }
            };
            if let Err(e) = self.persist_state().await {
                warn!(error = %e, "Failed to persist loop state");
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.shutdown_flush().await;
        info!("Control loop stopped");
        Ok(self.state())
    }

    async fn shutdown_flush(&self) {
        if let Err(e) = self.persist_state().await {
            warn!(error = %e, "Failed to persist loop state");
        }
        if let Err(e) = self.submissions.flush().await {
            warn!(error = %e, "Failed to flush submission cache");
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run every task once, in order
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        self.check_breakers()?;
        let tick = self.state.lock().ticks + 1;
        let mut report = TickReport::new(tick, now);

        self.check_health(&mut report).await?;
        self.compute_balances(&mut report).await?;
        self.report_stuck(&mut report, now).await?;

        if report.health.store_offline {
            // A lease held in a local fallback excludes no other instance
            report.skip("payouts", "record store offline, work lease not shared");
            self.check_breakers()?;
            return Ok(report);
        }

        let lease = LeaseRequest::new(
            PAYOUT_LEASE_KEY,
            self.config.holder.clone(),
            self.config.lease_ttl(),
        );
        match acquire_work_lease(&self.leases, &lease, now).await? {
            LeaseOutcome::Acquired { .. } => {
                self.create_batches(&mut report, now).await?;
                self.approve_batches(&mut report, now).await?;
                if report.health.processor_ok {
                    self.submit_batches(&mut report, now).await?;
                    self.reconcile_batches(&mut report, now).await?;
                } else {
                    report.skip("submission", "processor unavailable");
                    report.skip("reconciliation", "processor unavailable");
                }
            }
            LeaseOutcome::Unavailable { held_by, .. } => {
                report.skip(
                    "payouts",
                    format!("lease held by {}", held_by.as_deref().unwrap_or("unknown")),
                );
            }
        }

        self.check_breakers()?;
        Ok(report)
    }

    fn check_breakers(&self) -> Result<()> {
        let tripped = self.invariants.tripped_breakers();
        if tripped.is_empty() {
            return Ok(());
        }
        Err(AutopilotError::InvariantHalt {
            breakers: tripped.into_iter().map(|b| b.name).collect(),
        })
    }

    async fn check_health(&self, report: &mut TickReport) -> Result<()> {
        let store = self.collections.store();
        let ping = store.ping().await;
        report.health.store_backend = store.backend_label().to_string();
        if let Err(e) = ping {
            warn!(backend = %report.health.store_backend, error = %e, "Record store unreachable");
            return Err(e.into());
        }
        report.health.store_ok = true;
        report.health.store_offline = store.is_offline();
        if report.health.store_offline {
            warn!(backend = %report.health.store_backend, "Record store is offline");
        }

        match self.processor.health().await {
            Ok(()) => report.health.processor_ok = true,
            Err(e) => warn!(error = %e, "Processor health check failed"),
        }
        debug!(
            store_backend = %report.health.store_backend,
            store_offline = report.health.store_offline,
            processor_ok = report.health.processor_ok,
            "Health checked"
        );
        Ok(())
    }

    /// Evidence-bound revenue − paid out − committed to open batches, per
    /// currency. Revenue with no evidence block yet is reported as unproven.
    async fn compute_balances(&self, report: &mut TickReport) -> Result<()> {
        let mut balances: BTreeMap<String, CurrencyBalance> = BTreeMap::new();
        for status in [
            EventStatus::Confirmed,
            EventStatus::Reconciled,
            EventStatus::PaidOut,
        ] {
            let events = self
                .events
                .filter(&Filter::new().eq("status", status.as_str()), &ListQuery::new())
                .await?;
            for event in events.into_iter().map(|d| d.value) {
                if event.amount <= Decimal::ZERO {
                    continue;
                }
                let balance = balances
                    .entry(event.currency.to_ascii_uppercase())
                    .or_default();
                if !self.gate.evidence().contains(&event.id).await {
                    balance.unproven += event.amount;
                    continue;
                }
                self.gate.assert_money_moved(&event).await?;
                balance.revenue += event.amount;
                if status == EventStatus::PaidOut {
                    balance.paid_out += event.amount;
                }
            }
        }
        for batch in self.batches.list(&ListQuery::new()).await? {
            if batch.value.status.is_open() {
                balances
                    .entry(batch.value.currency.to_ascii_uppercase())
                    .or_default()
                    .committed += batch.value.total;
            }
        }
        for (currency, balance) in balances.iter_mut() {
            balance.available = balance.revenue - balance.paid_out - balance.committed;
            debug!(
                currency = %currency,
                revenue = %balance.revenue,
                paid_out = %balance.paid_out,
                committed = %balance.committed,
                unproven = %balance.unproven,
                available = %balance.available,
                "Balance"
            );
        }
        report.balances = balances;
        Ok(())
    }

    async fn report_stuck(&self, report: &mut TickReport, now: DateTime<Utc>) -> Result<()> {
        let mut candidates = Vec::new();

        let stuck_batch_after = Duration::seconds(self.config.stuck_batch_after_secs);
        for doc in self.batches.list(&ListQuery::oldest_first()).await? {
            let batch = &doc.value;
            let since = batch.submitted_at.unwrap_or(doc.created_date);
            let age = now - since;
            match batch.status {
                PayoutBatchStatus::NeedsReview => candidates.push(Alert {
                    kind: AlertKind::BatchNeedsReview,
                    subject_id: doc.id.clone(),
                    age_secs: age.num_seconds(),
                    message: format!(
                        "batch {} ({} {}) needs review: {}",
                        doc.id,
                        batch.total,
                        batch.currency,
                        batch.review_reason.as_deref().unwrap_or("unspecified")
                    ),
                }),
                s if s.is_open() && age > stuck_batch_after => candidates.push(Alert {
                    kind: AlertKind::StuckBatch,
                    subject_id: doc.id.clone(),
                    age_secs: age.num_seconds(),
                    message: format!("batch {} stuck in {} for {}s", doc.id, s.as_str(), age.num_seconds()),
                }),
                _ => {}
            }
        }

        let stuck_request_after = Duration::seconds(self.config.stuck_request_after_secs);
        let requested = self
            .requests
            .filter(
                &Filter::new().eq("status", PayoutRequestStatus::Requested.as_str()),
                &ListQuery::oldest_first(),
            )
            .await?;
        for doc in requested {
            let age = now - doc.created_date;
            if age > stuck_request_after {
                candidates.push(Alert {
                    kind: AlertKind::StuckRequest,
                    subject_id: doc.id.clone(),
                    age_secs: age.num_seconds(),
                    message: format!("payout request {} unbatched for {}s", doc.id, age.num_seconds()),
                });
            }
        }

        let cooldown = Duration::seconds(self.config.alert_cooldown_secs);
        let mut state = self.state.lock();
        for alert in candidates {
            if state.should_alert(&alert.subject(), now, cooldown) {
                warn!(
                    kind = alert.kind.as_str(),
                    subject_id = %alert.subject_id,
                    age_secs = alert.age_secs,
                    "{}",
                    alert.message
                );
                report.alerts.push(alert);
            }
        }
        Ok(())
    }

    async fn create_batches(&self, report: &mut TickReport, now: DateTime<Utc>) -> Result<()> {
        if !self.config.in_payout_window(now) {
            report.skip("batching", "outside payout window");
            return Ok(());
        }

        let requested = self
            .requests
            .filter(
                &Filter::new().eq("status", PayoutRequestStatus::Requested.as_str()),
                &ListQuery::oldest_first(),
            )
            .await?;
        let mut groups: BTreeMap<(String, String, String), Vec<Document<PayoutRequest>>> =
            BTreeMap::new();
        for doc in requested {
            groups.entry(doc.value.grouping_key()).or_default().push(doc);
        }
        if groups.is_empty() {
            return Ok(());
        }

        // Event id → key of the batch that has not failed and carries it
        let mut held: HashMap<String, String> = HashMap::new();
        for doc in self.batches.list(&ListQuery::new()).await? {
            if doc.value.status != PayoutBatchStatus::Failed {
                for event_id in doc.value.event_ids {
                    held.insert(event_id, doc.value.batch_key.clone());
                }
            }
        }

        for ((recipient, currency, route), members) in groups {
            let mut request_ids: Vec<String> = members.iter().map(|d| d.id.clone()).collect();
            request_ids.sort();
            let batch_key = format!("batch:{}", sha256_hex(request_ids.join(",").as_bytes()));

            let mut event_ids: Vec<String> = Vec::new();
            for doc in &members {
                for event_id in &doc.value.event_ids {
                    let repeated = event_ids.contains(event_id);
                    let elsewhere = held
                        .insert(event_id.clone(), batch_key.clone())
                        .is_some_and(|key| key != batch_key);
                    if repeated || elsewhere {
                        let violation = self.invariants.fail(
                            "payout_event_unique",
                            format!(
                                "payout_event_committed_twice: {event_id} (request {})",
                                doc.id
                            ),
                        );
                        return Err(IntegrityError::from(violation).into());
                    }
                    self.gate_event(event_id, report).await?;
                    event_ids.push(event_id.clone());
                }
            }

            let total: Decimal = members.iter().map(|d| d.value.amount).sum();
            let available = report.available(&currency);
            if available - total < self.config.min_available_balance {
                report.skip(
                    "batching",
                    format!("{recipient}/{currency}: available {available} cannot cover {total}"),
                );
                continue;
            }

            let batch = PayoutBatch {
                id: String::new(),
                batch_key: batch_key.clone(),
                recipient: recipient.clone(),
                currency: currency.clone(),
                route,
                total,
                request_ids,
                event_ids,
                status: PayoutBatchStatus::PendingApproval,
                processor_batch_id: None,
                submitted_at: None,
                review_reason: None,
                created_date: None,
            };
            let outcome = create_idempotent(&self.batches, "batch_key", &batch_key, &batch).await?;
            let batch_id = outcome.document.id.clone();

            for doc in &members {
                self.requests
                    .update(
                        &doc.id,
                        patch(json!({
                            "status": PayoutRequestStatus::Batched.as_str(),
                            "payout_batch_id": batch_id,
                        })),
                        Some(doc.version),
                    )
                    .await?;
            }
            if let Some(balance) = report.balances.get_mut(&currency.to_ascii_uppercase()) {
                balance.committed += total;
                balance.available -= total;
            }
            info!(
                batch_id = %batch_id,
                recipient = %recipient,
                currency = %currency,
                total = %total,
                requests = members.len(),
                deduped = outcome.deduped,
                "Payout batch created"
            );
            report.batches_created.push(batch_id);
        }
        Ok(())
    }

    /// Bind the event's proof into the evidence chain and pass the gate.
    ///
    /// Newly bound revenue moves from unproven to available in the report.
    async fn gate_event(&self, event_id: &str, report: &mut TickReport) -> Result<()> {
        let event = self.payout_event(event_id).await?;
        if !self.gate.evidence().contains(&event.id).await {
            self.gate.record_evidence(&event).await?;
            if event.amount > Decimal::ZERO {
                let balance = report
                    .balances
                    .entry(event.currency.to_ascii_uppercase())
                    .or_default();
                balance.unproven -= event.amount;
                balance.revenue += event.amount;
                balance.available += event.amount;
            }
        }
        self.gate.assert_money_moved(&event).await?;
        Ok(())
    }

    async fn payout_event(&self, event_id: &str) -> Result<LedgerEvent> {
        let Some(doc) = self.events.get(event_id).await? else {
            let violation = self.invariants.fail(
                "payout_event_exists",
                format!("payout_event_missing: {event_id}"),
            );
            return Err(IntegrityError::from(violation).into());
        };
        Ok(doc.value)
    }

    async fn approve_batches(&self, report: &mut TickReport, now: DateTime<Utc>) -> Result<()> {
        let pending = self
            .batches
            .filter(
                &Filter::new().eq("status", PayoutBatchStatus::PendingApproval.as_str()),
                &ListQuery::oldest_first(),
            )
            .await?;
        let delay = Duration::seconds(self.config.approval_delay_secs);
        for doc in pending {
            // Records stamped slightly ahead of `now` count as age zero
            let age = (now - doc.created_date).max(Duration::zero());
            if age < delay {
                continue;
            }
            let total = doc.value.total;
            let review_reason = if total > self.config.max_batch_total {
                Some("max_batch_exceeded")
            } else if total > self.config.two_factor_threshold {
                Some("two_factor_required")
            } else {
                None
            };
            let mut fields = Map::new();
            match review_reason {
                Some(reason) => {
                    fields.insert(
                        "status".into(),
                        PayoutBatchStatus::NeedsReview.as_str().into(),
                    );
                    fields.insert("review_reason".into(), reason.into());
                }
                None => {
                    fields.insert("status".into(), PayoutBatchStatus::Approved.as_str().into());
                }
            }
            self.batches
                .update(&doc.id, fields, Some(doc.version))
                .await?;
            match review_reason {
                Some(reason) => {
                    warn!(batch_id = %doc.id, total = %total, reason, "Batch routed to review");
                    report.needs_review.push(doc.id);
                }
                None => {
                    info!(batch_id = %doc.id, total = %total, "Batch approved");
                    report.approved.push(doc.id);
                }
            }
        }
        Ok(())
    }

    async fn submit_batches(&self, report: &mut TickReport, now: DateTime<Utc>) -> Result<()> {
        let approved = self
            .batches
            .filter(
                &Filter::new().eq("status", PayoutBatchStatus::Approved.as_str()),
                &ListQuery::oldest_first(),
            )
            .await?;
        for doc in approved {
            if !self.submissions.check_and_insert_at(&doc.id, now) {
                report.skip("submission", format!("{}: submitted recently", doc.id));
                continue;
            }
            if let Err(e) = self.submit_one(&doc, now).await {
                self.submissions.remove(&doc.id);
                return Err(e);
            }
            report.submitted.push(doc.id);
        }
        Ok(())
    }

    async fn submit_one(&self, doc: &Document<PayoutBatch>, now: DateTime<Utc>) -> Result<()> {
        let mut batch = doc.value.clone();
        batch.id = doc.id.clone();
        let submitted = self.processor.submit_batch(&batch, &doc.id).await?;
        self.batches
            .update(
                &doc.id,
                patch(json!({
                    "status": PayoutBatchStatus::Submitted.as_str(),
                    "processor_batch_id": submitted.processor_batch_id,
                    "submitted_at": now,
                })),
                Some(doc.version),
            )
            .await?;
        info!(
            batch_id = %doc.id,
            processor_batch_id = %submitted.processor_batch_id,
            total = %batch.total,
            currency = %batch.currency,
            "Batch submitted"
        );
        Ok(())
    }

    async fn reconcile_batches(&self, report: &mut TickReport, now: DateTime<Utc>) -> Result<()> {
        let submitted = self
            .batches
            .filter(
                &Filter::new().eq("status", PayoutBatchStatus::Submitted.as_str()),
                &ListQuery::oldest_first(),
            )
            .await?;
        for doc in submitted {
            let Some(processor_batch_id) = doc.value.processor_batch_id.clone() else {
                warn!(batch_id = %doc.id, "Submitted batch has no processor id");
                continue;
            };
            match self.processor.batch_status(&processor_batch_id).await? {
                ProcessorBatchStatus::Pending => {
                    debug!(batch_id = %doc.id, "Batch still pending at processor");
                }
                ProcessorBatchStatus::Completed => {
                    // Every event passes the gate before anything is marked paid
                    for event_id in &doc.value.event_ids {
                        let event = self.payout_event(event_id).await?;
                        self.gate.assert_money_moved(&event).await?;
                    }
                    for event_id in &doc.value.event_ids {
                        self.index.mark_settled(event_id, &doc.id, now).await?;
                        self.set_event_status(event_id, EventStatus::PaidOut).await?;
                    }
                    self.finish_batch(&doc, PayoutBatchStatus::Completed, PayoutRequestStatus::Paid, None)
                        .await?;
                    info!(
                        batch_id = %doc.id,
                        events = doc.value.event_ids.len(),
                        total = %doc.value.total,
                        "Batch reconciled as completed"
                    );
                    report.completed.push(doc.id);
                }
                ProcessorBatchStatus::Failed { reason } => {
                    for event_id in &doc.value.event_ids {
                        self.set_event_status(event_id, EventStatus::PayoutFailed)
                            .await?;
                    }
                    self.finish_batch(
                        &doc,
                        PayoutBatchStatus::Failed,
                        PayoutRequestStatus::Failed,
                        reason.as_deref(),
                    )
                    .await?;
                    warn!(
                        batch_id = %doc.id,
                        reason = reason.as_deref().unwrap_or("unspecified"),
                        "Batch failed at processor"
                    );
                    report.failed.push(doc.id);
                }
            }
        }
        Ok(())
    }

    async fn set_event_status(&self, event_id: &str, status: EventStatus) -> Result<()> {
        self.events
            .update(event_id, patch(json!({"status": status.as_str()})), None)
            .await?;
        Ok(())
    }

    async fn finish_batch(
        &self,
        doc: &Document<PayoutBatch>,
        batch_status: PayoutBatchStatus,
        request_status: PayoutRequestStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        for request_id in &doc.value.request_ids {
            self.requests
                .update(
                    request_id,
                    patch(json!({"status": request_status.as_str()})),
                    None,
                )
                .await?;
        }
        let mut fields = patch(json!({"status": batch_status.as_str()}));
        if let Some(reason) = reason {
            fields.insert("review_reason".into(), reason.into());
        }
        self.batches.update(&doc.id, fields, Some(doc.version)).await?;
        Ok(())
    }
}

fn patch(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
