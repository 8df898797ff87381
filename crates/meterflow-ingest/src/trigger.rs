//! Queue-delivered object-store events
//!
//! Each delivery is a batch of queue records whose bodies are object-store
//! create events. The handler takes one stability observation per record;
//! files that are not settled yet go back on the queue with a delay instead
//! of holding the invocation open.

use async_trait::async_trait;
use meterflow_common::types::ObjectLocation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{FailureContext, FailureKind, IngestError, IngestResult, StorageError};
use crate::orchestrator::{FileInput, InvocationReport, Pipeline, Stage};
use crate::resolve::IdentifierResolver;
use crate::stability::{StabilityRecord, StabilityVerdict};
use crate::storage::{decode_event_key, relocate, Zone};

const RETRY_COUNT_FIELD: &str = "_retry_count";
const STABILITY_FIELD: &str = "_stability";

/// One queue delivery
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueBatch {
    #[serde(rename = "Records", default)]
    pub records: Vec<QueueRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    #[serde(rename = "messageId", default)]
    pub message_id: String,
    pub body: String,
}

/// Decoded object-store event plus the handler's carried metadata
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    pub location: ObjectLocation,
    pub retry_count: u32,
    pub stability: Option<StabilityRecord>,
    body: Value,
}

impl EventMessage {
    pub fn parse(body: &str) -> IngestResult<Self> {
        let body: Value = serde_json::from_str(body)
            .map_err(|e| IngestError::Validation(format!("message body is not JSON: {e}")))?;

        let s3 = &body["Records"][0]["s3"];
        let bucket = s3["bucket"]["name"]
            .as_str()
            .ok_or_else(|| IngestError::Validation("event without bucket name".to_string()))?;
        let raw_key = s3["object"]["key"]
            .as_str()
            .ok_or_else(|| IngestError::Validation("event without object key".to_string()))?;
        let key = decode_event_key(raw_key)
            .map_err(|e| IngestError::Validation(format!("undecodable key: {e}")))?;

        let retry_count = body[RETRY_COUNT_FIELD]
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);
        let stability = match body.get(STABILITY_FIELD) {
            Some(Value::Null) | None => None,
            Some(value) => Some(serde_json::from_value(value.clone()).map_err(|e| {
                IngestError::Validation(format!("invalid carried stability record: {e}"))
            })?),
        };

        Ok(Self {
            location: ObjectLocation::new(bucket, key),
            retry_count,
            stability,
            body,
        })
    }

    /// Body for the delayed redelivery carrying `record`
    pub fn requeue_body(&self, record: &StabilityRecord) -> IngestResult<Value> {
        let mut body = self.body.clone();
        let Value::Object(fields) = &mut body else {
            return Err(IngestError::Validation("message body is not an object".to_string()));
        };
        fields.insert(RETRY_COUNT_FIELD.to_string(), Value::from(self.retry_count + 1));
        fields.insert(
            STABILITY_FIELD.to_string(),
            serde_json::to_value(record).map_err(|e| IngestError::Validation(e.to_string()))?,
        );
        Ok(body)
    }
}

/// Queue the handler sends delayed redeliveries to
#[async_trait]
pub trait TriggerQueue: Send + Sync {
    async fn send(&self, message: Value, delay: Duration) -> IngestResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedMessage {
    pub body: Value,
    pub delay_secs: u64,
}

/// Collects sent messages in memory
///
/// The CLI prints them so the hosting runtime can deliver them.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    sent: Mutex<Vec<QueuedMessage>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueuedMessage>> {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sent(&self) -> Vec<QueuedMessage> {
        self.lock().clone()
    }

    pub fn drain(&self) -> Vec<QueuedMessage> {
        std::mem::take(&mut *self.lock())
    }
}

#[async_trait]
impl TriggerQueue for MemoryQueue {
    async fn send(&self, message: Value, delay: Duration) -> IngestResult<()> {
        self.lock().push(QueuedMessage {
            body: message,
            delay_secs: delay.as_secs(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HandlerSummary {
    pub processed: usize,
    pub requeued: usize,
    pub skipped: usize,
    pub quarantined: usize,
    /// Messages the queue must deliver again
    pub failed_message_ids: Vec<String>,
    pub report: Option<InvocationReport>,
}

pub struct TriggerHandler {
    pipeline: Arc<Pipeline>,
    queue: Arc<dyn TriggerQueue>,
}

impl TriggerHandler {
    pub fn new(pipeline: Arc<Pipeline>, queue: Arc<dyn TriggerQueue>) -> Self {
        Self { pipeline, queue }
    }

    #[instrument(skip_all, fields(records = batch.records.len()))]
    pub async fn handle(
        &self,
        batch: QueueBatch,
        resolver: Arc<dyn IdentifierResolver>,
        cancel: CancellationToken,
    ) -> IngestResult<HandlerSummary> {
        let mut summary = HandlerSummary::default();
        let mut files: Vec<FileInput> = Vec::new();
        let mut message_ids: HashMap<ObjectLocation, String> = HashMap::new();
        let bucket = self.pipeline.store().bucket().to_string();

        for record in batch.records {
            let message = match EventMessage::parse(&record.body) {
                Ok(message) => message,
                Err(e) => {
                    warn!(message_id = %record.message_id, error = %e, "Skipping malformed record");
                    summary.skipped += 1;
                    continue;
                }
            };
            if message.location.bucket != bucket {
                warn!(location = %message.location, "Event for an unmanaged bucket; skipping");
                summary.skipped += 1;
                continue;
            }

            info!(
                location = %message.location,
                retry_count = message.retry_count,
                "Received file event"
            );

            let step = match self
                .pipeline
                .stability()
                .step(&message.location.key, message.stability.clone())
                .await
            {
                Ok(step) => step,
                Err(e) if e.is_not_found() => {
                    warn!(location = %message.location, "File no longer exists; skipping");
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(location = %message.location, error = %e, "Stability check failed");
                    summary.failed_message_ids.push(record.message_id);
                    continue;
                }
            };

            match step.verdict {
                StabilityVerdict::Stable => {
                    message_ids.insert(message.location.clone(), record.message_id);
                    files.push(FileInput::stable(message.location, step.meta));
                }
                StabilityVerdict::Unstable(_) => {
                    let requeued = match message.requeue_body(&step.record) {
                        Ok(body) => self.queue.send(body, step.record.poll_interval()).await,
                        Err(e) => Err(e),
                    };
                    match requeued {
                        Ok(()) => summary.requeued += 1,
                        Err(e) => {
                            warn!(location = %message.location, error = %e, "Failed to requeue message");
                            summary.failed_message_ids.push(record.message_id);
                        }
                    }
                }
                StabilityVerdict::Quarantined => {
                    if let Err(e) = self.quarantine(&message.location, step.record.retry_count).await {
                        warn!(location = %message.location, error = %e, "Failed to quarantine file");
                        summary.failed_message_ids.push(record.message_id);
                    } else {
                        summary.quarantined += 1;
                    }
                }
            }
        }

        if !files.is_empty() {
            summary.processed = files.len();
            let report = self.pipeline.run_invocation(files, resolver, cancel).await?;
            for location in report.retry_locations() {
                if let Some(id) = message_ids.get(location) {
                    summary.failed_message_ids.push(id.clone());
                }
            }
            summary.report = Some(report);
        }

        info!(
            processed = summary.processed,
            requeued_messages = summary.requeued,
            skipped_messages = summary.skipped,
            quarantined_files = summary.quarantined,
            failed_messages = summary.failed_message_ids.len(),
            "Queue batch handled"
        );
        Ok(summary)
    }

    async fn quarantine(&self, location: &ObjectLocation, retries: u32) -> IngestResult<()> {
        let store = self.pipeline.store();
        let destination = Zone::Quarantine.destination(&location.key);
        match relocate(store.as_ref(), &location.key, &destination).await {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        FailureContext::new(
            FailureKind::Quarantine,
            location.clone(),
            Stage::Stabilizing,
            IngestError::Quarantine { retries }.to_string(),
        )
        .raise_alert();
        Ok(())
    }
}
