//! At-most-one processing attempt per input fingerprint
//!
//! A [`ProcessingRecord`] is created conditionally for every fingerprint and
//! only ever updated by compare-and-swap on its version, so two invocations
//! racing on the same trigger cannot both proceed. Records expire after the
//! configured TTL; an expired record counts as absent.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use meterflow_common::checksum::fingerprint;
use meterflow_common::types::ObjectLocation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{FailureContext, FailureKind, IngestResult};
use crate::orchestrator::state::PipelineState;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryProcessingStore;
#[cfg(feature = "postgres")]
pub use postgres::PgProcessingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Received,
    Stabilizing,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Stabilizing => "stabilizing",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for ProcessingStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "stabilizing" => Self::Stabilizing,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Received,
        }
    }
}

/// Idempotency and state-tracking record for one fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub fingerprint: String,
    pub version: u64,
    pub status: ProcessingStatus,
    /// Owner of the current attempt; `None` for records registered ahead of time
    pub attempt_id: Option<Uuid>,
    pub locations: Vec<ObjectLocation>,
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    pub state: Option<PipelineState>,
    pub result: Option<serde_json::Value>,
    pub error: Option<FailureContext>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ProcessingRecord {
    pub fn new(fingerprint: impl Into<String>, locations: Vec<ObjectLocation>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            fingerprint: fingerprint.into(),
            version: 1,
            status: ProcessingStatus::Received,
            attempt_id: None,
            locations,
            parent: None,
            children: Vec::new(),
            state: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Fingerprint of one stored file version
pub fn file_fingerprint(location: &ObjectLocation, etag: Option<&str>) -> String {
    fingerprint([
        location.bucket.as_str(),
        location.key.as_str(),
        etag.unwrap_or(""),
    ])
}

/// Order-independent fingerprint of a set of file fingerprints
pub fn set_fingerprint<I, S>(files: I) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut parts: Vec<String> = files.into_iter().map(Into::into).collect();
    parts.sort();
    parts.dedup();
    fingerprint(parts)
}

/// Conditional key-value storage for processing records
#[async_trait]
pub trait ProcessingStore: Send + Sync {
    /// Insert unless a live record exists; `true` when inserted
    async fn create_if_absent(&self, record: &ProcessingRecord) -> IngestResult<bool>;

    /// Live record for `fingerprint`
    async fn get(&self, fingerprint: &str) -> IngestResult<Option<ProcessingRecord>>;

    /// Replace the live record if its version is still `expected_version`
    async fn compare_and_swap(
        &self,
        record: &ProcessingRecord,
        expected_version: u64,
    ) -> IngestResult<bool>;
}

/// Outcome of trying to start work on a fingerprint
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// This attempt owns the record; resume from its state if any
    Proceed(ProcessingRecord),
    /// Another attempt is working on it
    InFlight(ProcessingRecord),
    /// Already finished within the TTL window
    Cached(ProcessingRecord),
}

pub struct IdempotencyGuard {
    store: Arc<dyn ProcessingStore>,
    ttl: Duration,
    lease: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn ProcessingStore>, ttl: std::time::Duration, lease: std::time::Duration) -> Self {
        Self {
            store,
            ttl: Duration::from_std(ttl).unwrap_or(Duration::days(1)),
            lease: Duration::from_std(lease).unwrap_or(Duration::minutes(15)),
        }
    }

    pub fn store(&self) -> &Arc<dyn ProcessingStore> {
        &self.store
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Claim `fingerprint` for a new attempt
    pub async fn begin(
        &self,
        fingerprint: &str,
        locations: Vec<ObjectLocation>,
    ) -> IngestResult<Admission> {
        let attempt = Uuid::new_v4();
        let mut fresh = ProcessingRecord::new(fingerprint, locations, self.ttl);
        fresh.attempt_id = Some(attempt);

        // A record can expire between the failed create and the read
        for _ in 0..3 {
            if self.store.create_if_absent(&fresh).await? {
                debug!(fingerprint, "Processing record created");
                return Ok(Admission::Proceed(fresh));
            }

            let Some(existing) = self.store.get(fingerprint).await? else {
                continue;
            };

            let Some(mut takeover) = self.takeover(&existing, Utc::now()) else {
                return Ok(if existing.status.is_terminal() {
                    Admission::Cached(existing)
                } else {
                    Admission::InFlight(existing)
                });
            };

            takeover.attempt_id = Some(attempt);
            if self.store.compare_and_swap(&takeover, existing.version).await? {
                info!(
                    fingerprint,
                    previous_status = %existing.status,
                    "Taking over processing record"
                );
                return Ok(Admission::Proceed(takeover));
            }
            return Ok(Admission::InFlight(existing));
        }

        Ok(Admission::InFlight(fresh))
    }

    /// Successor record when `existing` may be taken over by a new attempt
    fn takeover(&self, existing: &ProcessingRecord, now: DateTime<Utc>) -> Option<ProcessingRecord> {
        let mut next = existing.clone();
        next.version = existing.version + 1;
        next.updated_at = now;
        next.expires_at = now + self.ttl;

        match existing.status {
            ProcessingStatus::Completed => None,
            ProcessingStatus::Failed => {
                let retryable = existing
                    .error
                    .as_ref()
                    .is_some_and(|e| e.kind == FailureKind::Transient);
                retryable.then(|| {
                    next.status = ProcessingStatus::Received;
                    next.state = None;
                    next.error = None;
                    next
                })
            }
            _ if existing.attempt_id.is_none() => Some(next),
            _ if now - existing.updated_at > self.lease => Some(next),
            _ => None,
        }
    }

    /// Persist `record` if this attempt still owns it
    ///
    /// Returns `false` when another attempt has replaced the record.
    pub async fn update(&self, record: &mut ProcessingRecord) -> IngestResult<bool> {
        let expected = record.version;
        let now = Utc::now();
        record.version = expected + 1;
        record.updated_at = now;
        record.expires_at = now + self.ttl;

        let swapped = self.store.compare_and_swap(record, expected).await?;
        if !swapped {
            record.version = expected;
        }
        Ok(swapped)
    }

    /// Give up this attempt's claim on an unfinished record
    ///
    /// The persisted state stays, so the next delivery resumes from it
    /// immediately instead of waiting for the lease to lapse.
    pub async fn release(&self, record: &mut ProcessingRecord) -> IngestResult<bool> {
        let owner = record.attempt_id.take();
        let released = self.update(record).await?;
        if !released {
            record.attempt_id = owner;
        }
        Ok(released)
    }

    /// Register a record ahead of its trigger, e.g. for split chunks
    pub async fn register_child(
        &self,
        fingerprint: &str,
        location: ObjectLocation,
        parent: &str,
    ) -> IngestResult<bool> {
        let mut record = ProcessingRecord::new(fingerprint, vec![location], self.ttl);
        record.parent = Some(parent.to_string());
        self.store.create_if_absent(&record).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::orchestrator::state::Stage;

    fn guard(store: Arc<MemoryProcessingStore>) -> IdempotencyGuard {
        IdempotencyGuard::new(
            store,
            std::time::Duration::from_secs(86_400),
            std::time::Duration::from_secs(900),
        )
    }

    fn location() -> ObjectLocation {
        ObjectLocation::new("ingest", "landing/a.csv")
    }

    #[test]
    fn test_set_fingerprint_ignores_order() {
        assert_eq!(set_fingerprint(["b", "a"]), set_fingerprint(["a", "b", "a"]));
        assert_ne!(set_fingerprint(["a"]), set_fingerprint(["a", "b"]));
    }

    #[test]
    fn test_file_fingerprint_includes_etag() {
        assert_ne!(
            file_fingerprint(&location(), Some("e1")),
            file_fingerprint(&location(), Some("e2"))
        );
    }

    #[tokio::test]
    async fn test_second_begin_is_in_flight() {
        let guard = guard(Arc::new(MemoryProcessingStore::new()));
        assert!(matches!(
            guard.begin("fp", vec![location()]).await.unwrap(),
            Admission::Proceed(_)
        ));
        assert!(matches!(
            guard.begin("fp", vec![location()]).await.unwrap(),
            Admission::InFlight(_)
        ));
    }

    #[tokio::test]
    async fn test_completed_is_cached() {
        let guard = guard(Arc::new(MemoryProcessingStore::new()));
        let Admission::Proceed(mut record) = guard.begin("fp", vec![location()]).await.unwrap() else {
            panic!("expected to proceed");
        };
        record.status = ProcessingStatus::Completed;
        record.result = Some(serde_json::json!({"files": 1}));
        assert!(guard.update(&mut record).await.unwrap());

        let Admission::Cached(cached) = guard.begin("fp", vec![location()]).await.unwrap() else {
            panic!("expected cached result");
        };
        assert_eq!(cached.result, Some(serde_json::json!({"files": 1})));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let guard = guard(Arc::new(MemoryProcessingStore::new()));
        let Admission::Proceed(mut record) = guard.begin("fp", vec![location()]).await.unwrap() else {
            panic!("expected to proceed");
        };
        record.status = ProcessingStatus::Failed;
        record.error = Some(FailureContext::new(
            FailureKind::Transient,
            location(),
            Stage::Processing,
            "throttled",
        ));
        assert!(guard.update(&mut record).await.unwrap());

        let Admission::Proceed(retry) = guard.begin("fp", vec![location()]).await.unwrap() else {
            panic!("expected a retry");
        };
        assert_eq!(retry.status, ProcessingStatus::Received);
        assert!(retry.error.is_none());
        assert_ne!(retry.attempt_id, record.attempt_id);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_cached() {
        let guard = guard(Arc::new(MemoryProcessingStore::new()));
        let Admission::Proceed(mut record) = guard.begin("fp", vec![location()]).await.unwrap() else {
            panic!("expected to proceed");
        };
        record.status = ProcessingStatus::Failed;
        record.error = Some(FailureContext::new(
            FailureKind::Parse,
            location(),
            Stage::Processing,
            "garbage",
        ));
        assert!(guard.update(&mut record).await.unwrap());
        assert!(matches!(
            guard.begin("fp", vec![location()]).await.unwrap(),
            Admission::Cached(_)
        ));
    }

    #[tokio::test]
    async fn test_stale_attempt_is_taken_over() {
        let store = Arc::new(MemoryProcessingStore::new());
        let guard = guard(store.clone());

        let mut stale = ProcessingRecord::new("fp", vec![location()], Duration::days(1));
        stale.attempt_id = Some(Uuid::new_v4());
        stale.status = ProcessingStatus::Processing;
        stale.updated_at = Utc::now() - Duration::minutes(30);
        assert!(store.create_if_absent(&stale).await.unwrap());

        let Admission::Proceed(record) = guard.begin("fp", vec![location()]).await.unwrap() else {
            panic!("expected takeover");
        };
        assert_eq!(record.status, ProcessingStatus::Processing);
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn test_released_record_is_resumed_without_waiting() {
        let guard = guard(Arc::new(MemoryProcessingStore::new()));
        let Admission::Proceed(mut record) = guard.begin("fp", vec![location()]).await.unwrap() else {
            panic!("expected to proceed");
        };
        record.status = ProcessingStatus::Processing;
        record.state = Some(PipelineState::TypeDetecting);
        assert!(guard.update(&mut record).await.unwrap());
        assert!(guard.release(&mut record).await.unwrap());
        assert!(record.attempt_id.is_none());

        let Admission::Proceed(resumed) = guard.begin("fp", vec![location()]).await.unwrap() else {
            panic!("expected the released record to be claimable");
        };
        assert_eq!(resumed.state, Some(PipelineState::TypeDetecting));
        assert!(resumed.attempt_id.is_some());
    }

    #[tokio::test]
    async fn test_release_after_takeover_keeps_new_owner() {
        let guard = guard(Arc::new(MemoryProcessingStore::new()));
        let Admission::Proceed(mut first) = guard.begin("fp", vec![location()]).await.unwrap() else {
            panic!("expected to proceed");
        };
        let owner = first.attempt_id;
        let mut second = first.clone();
        assert!(guard.update(&mut second).await.unwrap());

        assert!(!guard.release(&mut first).await.unwrap());
        assert_eq!(first.attempt_id, owner);
    }

    #[tokio::test]
    async fn test_registered_child_is_claimed() {
        let guard = guard(Arc::new(MemoryProcessingStore::new()));
        assert!(guard.register_child("child", location(), "parent").await.unwrap());
        let Admission::Proceed(record) = guard.begin("child", vec![location()]).await.unwrap() else {
            panic!("expected to claim the registered child");
        };
        assert_eq!(record.parent.as_deref(), Some("parent"));
    }

    #[tokio::test]
    async fn test_lost_ownership_is_reported() {
        let guard = guard(Arc::new(MemoryProcessingStore::new()));
        let Admission::Proceed(mut first) = guard.begin("fp", vec![location()]).await.unwrap() else {
            panic!("expected to proceed");
        };
        let mut second = first.clone();
        assert!(guard.update(&mut second).await.unwrap());
        assert!(!guard.update(&mut first).await.unwrap());
        assert_eq!(first.version, 1);
    }
}
