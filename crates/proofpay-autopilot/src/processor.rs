//! Payment processor contract
//!
//! The loop only needs three things from the processor rail: is it up, take
//! this batch, and what happened to that batch. [`HttpProcessorClient`] is
//! the HTTP binding:
//!
//! | Operation | Request |
//! |---|---|
//! | health | `GET /health` |
//! | submit | `POST /payout-batches` with `Idempotency-Key: <batch id>` |
//! | status | `GET /payout-batches/{processor_batch_id}` |

use async_trait::async_trait;
use proofpay_resilience::RetryingClient;
use proofpay_types::PayoutBatch;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{AutopilotError, Result};

/// Processor-side state of a submitted batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessorBatchStatus {
    Pending,
    Completed,
    Failed {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedBatch {
    pub processor_batch_id: String,
}

#[async_trait]
pub trait ProcessorClient: Send + Sync {
    async fn health(&self) -> Result<()>;

    /// Submit a batch; the processor must dedupe on `idempotency_key`
    async fn submit_batch(&self, batch: &PayoutBatch, idempotency_key: &str)
        -> Result<SubmittedBatch>;

    async fn batch_status(&self, processor_batch_id: &str) -> Result<ProcessorBatchStatus>;
}

#[derive(Debug, Clone)]
pub struct HttpProcessorClient {
    client: RetryingClient,
}

impl HttpProcessorClient {
    pub fn new(client: RetryingClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProcessorClient for HttpProcessorClient {
    async fn health(&self) -> Result<()> {
        self.client.get_json("/health").await?;
        Ok(())
    }

    async fn submit_batch(
        &self,
        batch: &PayoutBatch,
        idempotency_key: &str,
    ) -> Result<SubmittedBatch> {
        let body = json!({
            "reference": batch.id,
            "recipient": batch.recipient,
            "currency": batch.currency,
            "route": batch.route,
            "amount": batch.total,
            "items": batch.request_ids,
        });
        let response = self
            .client
            .post_json("/payout-batches", &body, Some(idempotency_key))
            .await?;
        let processor_batch_id = response
            .get("id")
            .or_else(|| response.get("processor_batch_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AutopilotError::ProcessorResponse(format!(
                    "submit response for batch {} has no id",
                    batch.id
                ))
            })?;
        debug!(batch_id = %batch.id, processor_batch_id = %processor_batch_id, "Batch accepted by processor");
        Ok(SubmittedBatch {
            processor_batch_id: processor_batch_id.to_string(),
        })
    }

    async fn batch_status(&self, processor_batch_id: &str) -> Result<ProcessorBatchStatus> {
        let response = self
            .client
            .get_json(&format!("/payout-batches/{processor_batch_id}"))
            .await?;
        let status = response
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_ascii_uppercase)
            .unwrap_or_default();
        let reason = response
            .get("reason")
            .or_else(|| response.get("failure_reason"))
            .and_then(Value::as_str)
            .map(str::to_string);
        match status.as_str() {
            "COMPLETED" | "PAID" | "SUCCEEDED" => Ok(ProcessorBatchStatus::Completed),
            "FAILED" | "REJECTED" | "RETURNED" => Ok(ProcessorBatchStatus::Failed { reason }),
            "PENDING" | "PROCESSING" | "SUBMITTED" | "QUEUED" => Ok(ProcessorBatchStatus::Pending),
            other => Err(AutopilotError::ProcessorResponse(format!(
                "unknown status {other:?} for batch {processor_batch_id}"
            ))),
        }
    }
}
