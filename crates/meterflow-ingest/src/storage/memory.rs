use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meterflow_common::checksum::sha256_hex;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ObjectMeta, ObjectStore};
use crate::error::StorageError;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    operation: &'static str,
    key: Option<String>,
    error: StorageError,
    persistent: bool,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    failures: Vec<InjectedFailure>,
    growing: HashSet<String>,
}

/// In-process [`ObjectStore`] for tests and dry runs
///
/// Clones share the same contents. Failures can be injected per operation to
/// exercise retry and error-routing paths.
#[derive(Debug, Clone)]
pub struct MemoryObjectStore {
    bucket: String,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store an object with an explicit modification time
    pub fn put_with_modified(&self, key: &str, data: Vec<u8>, last_modified: DateTime<Utc>) {
        let etag = sha256_hex(&data);
        self.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data,
                etag,
                last_modified,
            },
        );
    }

    /// Fail the next call of `operation` (`head`, `get`, `put`, `copy`, `delete`, `list`)
    pub fn fail_next(&self, operation: &'static str, error: StorageError) {
        self.lock().failures.push(InjectedFailure {
            operation,
            key: None,
            error,
            persistent: false,
        });
    }

    /// Fail every call of `operation` on `key`
    pub fn fail_always(&self, operation: &'static str, key: &str, error: StorageError) {
        self.lock().failures.push(InjectedFailure {
            operation,
            key: Some(key.to_string()),
            error,
            persistent: true,
        });
    }

    /// Append a byte to `key` before every `head`, like an upload still in progress
    pub fn keep_growing(&self, key: &str) {
        self.lock().growing.insert(key.to_string());
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    fn check_failure(&self, operation: &str, key: &str) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let position = inner.failures.iter().position(|f| {
            f.operation == operation && f.key.as_deref().map_or(true, |k| k == key)
        });
        match position {
            Some(index) if inner.failures[index].persistent => {
                Err(inner.failures[index].error.clone())
            }
            Some(index) => Err(inner.failures.remove(index).error),
            None => Ok(()),
        }
    }

    fn meta(key: &str, object: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size: object.data.len() as u64,
            etag: Some(object.etag.clone()),
            last_modified: Some(object.last_modified),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        self.check_failure("head", key)?;
        let mut inner = self.lock();
        if inner.growing.contains(key) {
            if let Some(object) = inner.objects.get_mut(key) {
                object.data.push(b'\n');
                object.etag = sha256_hex(&object.data);
                object.last_modified = Utc::now();
            }
        }
        Ok(inner.objects.get(key).map(|o| Self::meta(key, o)))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.check_failure("get", key)?;
        self.lock()
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn get_head(&self, key: &str, max_bytes: usize) -> Result<Vec<u8>, StorageError> {
        self.check_failure("get", key)?;
        self.lock()
            .objects
            .get(key)
            .map(|o| o.data[..o.data.len().min(max_bytes)].to_vec())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<ObjectMeta, StorageError> {
        self.check_failure("put", key)?;
        self.put_with_modified(key, data, Utc::now());
        let inner = self.lock();
        inner
            .objects
            .get(key)
            .map(|o| Self::meta(key, o))
            .ok_or_else(|| StorageError::Backend(format!("{} vanished after put", key)))
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        self.check_failure("copy", src)?;
        let mut inner = self.lock();
        let object = inner
            .objects
            .get(src)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(src.to_string()))?;
        inner.objects.insert(dst.to_string(), object);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check_failure("delete", key)?;
        self.lock().objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        self.check_failure("list", prefix)?;
        Ok(self
            .lock()
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| Self::meta(key, object))
            .collect())
    }
}
