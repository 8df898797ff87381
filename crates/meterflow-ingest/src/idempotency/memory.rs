use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{ProcessingRecord, ProcessingStore};
use crate::error::IngestResult;

/// In-process [`ProcessingStore`], scoped to one process lifetime
#[derive(Debug, Default)]
pub struct MemoryProcessingStore {
    records: Mutex<HashMap<String, ProcessingRecord>>,
}

impl MemoryProcessingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProcessingRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl ProcessingStore for MemoryProcessingStore {
    async fn create_if_absent(&self, record: &ProcessingRecord) -> IngestResult<bool> {
        let now = Utc::now();
        let mut records = self.lock();
        match records.get(&record.fingerprint) {
            Some(existing) if !existing.is_expired(now) => Ok(false),
            _ => {
                records.insert(record.fingerprint.clone(), record.clone());
                Ok(true)
            }
        }
    }

    async fn get(&self, fingerprint: &str) -> IngestResult<Option<ProcessingRecord>> {
        let now = Utc::now();
        Ok(self
            .lock()
            .get(fingerprint)
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    async fn compare_and_swap(
        &self,
        record: &ProcessingRecord,
        expected_version: u64,
    ) -> IngestResult<bool> {
        let now = Utc::now();
        let mut records = self.lock();
        match records.get_mut(&record.fingerprint) {
            Some(current) if !current.is_expired(now) && current.version == expected_version => {
                *current = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_expired_record_counts_as_absent() {
        let store = MemoryProcessingStore::new();
        let mut old = ProcessingRecord::new("fp", Vec::new(), Duration::days(1));
        old.expires_at = Utc::now() - Duration::seconds(1);
        assert!(store.create_if_absent(&old).await.unwrap());

        assert!(store.get("fp").await.unwrap().is_none());
        let fresh = ProcessingRecord::new("fp", Vec::new(), Duration::days(1));
        assert!(store.create_if_absent(&fresh).await.unwrap());
        assert!(!store.create_if_absent(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_cas_requires_expected_version() {
        let store = MemoryProcessingStore::new();
        let record = ProcessingRecord::new("fp", Vec::new(), Duration::days(1));
        store.create_if_absent(&record).await.unwrap();

        let mut next = record.clone();
        next.version = 2;
        assert!(!store.compare_and_swap(&next, 5).await.unwrap());
        assert!(store.compare_and_swap(&next, 1).await.unwrap());
        assert_eq!(store.get("fp").await.unwrap().unwrap().version, 2);
    }
}
