//! Object storage abstraction
//!
//! The pipeline only ever talks to storage through [`ObjectStore`], which keeps
//! the stages testable against [`MemoryObjectStore`] and lets the CLI swap in
//! [`S3ObjectStore`] for real buckets.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meterflow_common::types::file_name;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, instrument};

use crate::error::StorageError;

pub mod config;
pub mod memory;
pub mod s3;

pub use config::StorageConfig;
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// Metadata reported by a `head` or `list` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Minimal object-store surface used by the pipeline
///
/// Every implementation is bound to one bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// `Ok(None)` when the object does not exist
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// At most the first `max_bytes` of the object
    async fn get_head(&self, key: &str, max_bytes: usize) -> Result<Vec<u8>, StorageError>;

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<ObjectMeta, StorageError>;

    async fn copy(&self, src: &str, dst: &str) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError>;
}

/// Move an object, never deleting the source before the copy is confirmed
///
/// A missing source yields [`StorageError::NotFound`], which callers racing
/// another mover treat as already done.
#[instrument(skip(store), fields(bucket = store.bucket()))]
pub async fn relocate(store: &dyn ObjectStore, src: &str, dst: &str) -> Result<(), StorageError> {
    let source = store
        .head(src)
        .await?
        .ok_or_else(|| StorageError::NotFound(src.to_string()))?;

    store.copy(src, dst).await?;

    let copied = store
        .head(dst)
        .await?
        .ok_or_else(|| StorageError::Backend(format!("copy of {} missing at {}", src, dst)))?;
    if copied.size != source.size {
        return Err(StorageError::Backend(format!(
            "copy of {} has {} bytes, expected {}",
            src, copied.size, source.size
        )));
    }

    store.delete(src).await?;
    debug!("Relocated {} -> {}", src, dst);
    Ok(())
}

/// Decode an object key as delivered in storage event notifications
///
/// `+` stands for a space; everything else is percent-encoded.
pub fn decode_event_key(raw: &str) -> Result<String, StorageError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|key| key.into_owned())
        .map_err(|e| StorageError::Backend(format!("undecodable key {}: {}", raw, e)))
}

/// Logical areas of the ingest bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Zone {
    Landing,
    Processed,
    ParseError,
    Invalid,
    Unmapped,
    Quarantine,
    ManualReview,
    Reports,
}

impl Zone {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Landing => "landing/",
            Self::Processed => "processed/",
            Self::ParseError => "parse-err/",
            Self::Invalid => "invalid/",
            Self::Unmapped => "unmapped/",
            Self::Quarantine => "quarantine/",
            Self::ManualReview => "manual-review/",
            Self::Reports => "reports/",
        }
    }

    /// Key of `key`'s file once relocated into this zone
    pub fn destination(&self, key: &str) -> String {
        format!("{}{}", self.prefix(), file_name(key))
    }

    /// Zones an operator may send back to landing
    pub fn is_error_zone(&self) -> bool {
        matches!(
            self,
            Self::ParseError | Self::Invalid | Self::Unmapped | Self::Quarantine | Self::ManualReview
        )
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix().trim_end_matches('/'))
    }
}

impl FromStr for Zone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_end_matches('/') {
            "landing" => Ok(Self::Landing),
            "processed" => Ok(Self::Processed),
            "parse-err" => Ok(Self::ParseError),
            "invalid" => Ok(Self::Invalid),
            "unmapped" => Ok(Self::Unmapped),
            "quarantine" => Ok(Self::Quarantine),
            "manual-review" => Ok(Self::ManualReview),
            "reports" => Ok(Self::Reports),
            other => Err(format!("unknown zone: {}", other)),
        }
    }
}
