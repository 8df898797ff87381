//! Upload completeness check
//!
//! A file is stable once two consecutive observations, one poll interval
//! apart, agree on size and entity tag. Waiting is never done by spinning:
//! [`StabilityChecker::check`] parks on the tokio timer, and the trigger path
//! uses [`StabilityChecker::step`] to take a single observation and hand the
//! wait back to the queue as a delivery delay.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{IngestError, IngestResult, StorageError};
use crate::storage::{ObjectMeta, ObjectStore};

/// Size and entity tag of an object at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub size: u64,
    pub etag: Option<String>,
}

impl From<&ObjectMeta> for Observation {
    fn from(meta: &ObjectMeta) -> Self {
        Self {
            size: meta.size,
            etag: meta.etag.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityVerdict {
    Stable,
    /// Another observation is needed; carries the number of changes seen so far
    Unstable(u32),
    Quarantined,
}

/// Progress of one file's stability check, carried between observations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityRecord {
    pub last: Observation,
    pub retry_count: u32,
    pub max_retries: u32,
    pub poll_interval_secs: u64,
}

impl StabilityRecord {
    pub fn new(first: Observation, max_retries: u32, poll_interval: Duration) -> Self {
        Self {
            last: first,
            retry_count: 0,
            max_retries,
            poll_interval_secs: poll_interval.as_secs(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Compare `next` with the previous observation
    pub fn observe(&mut self, next: Observation) -> StabilityVerdict {
        if next == self.last {
            return StabilityVerdict::Stable;
        }

        self.retry_count += 1;
        self.last = next;
        if self.retry_count >= self.max_retries {
            StabilityVerdict::Quarantined
        } else {
            StabilityVerdict::Unstable(self.retry_count)
        }
    }
}

/// Result of a single non-blocking observation
#[derive(Debug, Clone)]
pub struct StabilityStep {
    pub verdict: StabilityVerdict,
    pub record: StabilityRecord,
    pub meta: ObjectMeta,
}

pub struct StabilityChecker {
    store: Arc<dyn ObjectStore>,
    poll_interval: Duration,
    max_retries: u32,
}

impl StabilityChecker {
    pub fn new(store: Arc<dyn ObjectStore>, poll_interval: Duration, max_retries: u32) -> Self {
        Self {
            store,
            poll_interval,
            max_retries: max_retries.max(1),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn observe(&self, key: &str) -> IngestResult<ObjectMeta> {
        self.store
            .head(key)
            .await?
            .ok_or_else(|| IngestError::Storage(StorageError::NotFound(key.to_string())))
    }

    /// Observe `key` until it is stable or the change budget runs out
    ///
    /// Returns the metadata of the final observation.
    #[instrument(skip(self))]
    pub async fn check(&self, key: &str) -> IngestResult<(StabilityVerdict, ObjectMeta)> {
        let first = self.observe(key).await?;
        let mut record =
            StabilityRecord::new(Observation::from(&first), self.max_retries, self.poll_interval);

        loop {
            tokio::time::sleep(self.poll_interval).await;
            let meta = self.observe(key).await?;
            match record.observe(Observation::from(&meta)) {
                StabilityVerdict::Unstable(changes) => {
                    debug!(changes, size = meta.size, "File still changing");
                }
                verdict => {
                    log_verdict(key, verdict, &record);
                    return Ok((verdict, meta));
                }
            }
        }
    }

    /// Take one observation, continuing from `record` when there is one
    ///
    /// The first observation of a file is always [`StabilityVerdict::Unstable`]
    /// with zero changes; the caller is expected to come back after
    /// [`StabilityRecord::poll_interval`].
    #[instrument(skip(self, record))]
    pub async fn step(
        &self,
        key: &str,
        record: Option<StabilityRecord>,
    ) -> IngestResult<StabilityStep> {
        let meta = self.observe(key).await?;
        let observation = Observation::from(&meta);

        let Some(mut record) = record else {
            let record = StabilityRecord::new(observation, self.max_retries, self.poll_interval);
            return Ok(StabilityStep {
                verdict: StabilityVerdict::Unstable(0),
                record,
                meta,
            });
        };

        let verdict = record.observe(observation);
        log_verdict(key, verdict, &record);
        Ok(StabilityStep {
            verdict,
            record,
            meta,
        })
    }
}

fn log_verdict(key: &str, verdict: StabilityVerdict, record: &StabilityRecord) {
    match verdict {
        StabilityVerdict::Stable => info!(key, changes = record.retry_count, "File is stable"),
        StabilityVerdict::Unstable(changes) => debug!(key, changes, "File changed since last observation"),
        StabilityVerdict::Quarantined => warn!(
            key,
            changes = record.retry_count,
            "File kept changing; giving up"
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    fn checker(store: &MemoryObjectStore) -> StabilityChecker {
        StabilityChecker::new(Arc::new(store.clone()), Duration::from_secs(30), 5)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_file_is_stable_after_one_interval() {
        let store = MemoryObjectStore::new("ingest");
        store.put("landing/a.csv", b"100,NEM12".to_vec(), None).await.unwrap();
        let started = tokio::time::Instant::now();

        let (verdict, meta) = checker(&store).check("landing/a.csv").await.unwrap();

        assert_eq!(verdict, StabilityVerdict::Stable);
        assert_eq!(meta.size, 9);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_growing_file_is_quarantined_after_five_changes() {
        let store = MemoryObjectStore::new("ingest");
        store.put("landing/a.csv", b"100".to_vec(), None).await.unwrap();
        store.keep_growing("landing/a.csv");
        let started = tokio::time::Instant::now();

        let (verdict, _) = checker(&store).check("landing/a.csv").await.unwrap();

        assert_eq!(verdict, StabilityVerdict::Quarantined);
        assert_eq!(started.elapsed(), Duration::from_secs(150));
    }

    #[tokio::test]
    async fn test_vanished_file_is_not_found() {
        let store = MemoryObjectStore::new("ingest");
        let err = checker(&store).check("landing/gone.csv").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_step_carries_the_record() {
        let store = MemoryObjectStore::new("ingest");
        store.put("landing/a.csv", b"100".to_vec(), None).await.unwrap();
        let checker = checker(&store);

        let first = checker.step("landing/a.csv", None).await.unwrap();
        assert_eq!(first.verdict, StabilityVerdict::Unstable(0));

        let second = checker.step("landing/a.csv", Some(first.record)).await.unwrap();
        assert_eq!(second.verdict, StabilityVerdict::Stable);
    }

    #[test]
    fn test_record_counts_changes() {
        let obs = |size| Observation { size, etag: None };
        let mut record = StabilityRecord::new(obs(1), 2, Duration::from_secs(30));
        assert_eq!(record.observe(obs(2)), StabilityVerdict::Unstable(1));
        assert_eq!(record.observe(obs(2)), StabilityVerdict::Stable);
        assert_eq!(record.observe(obs(3)), StabilityVerdict::Quarantined);
    }
}
