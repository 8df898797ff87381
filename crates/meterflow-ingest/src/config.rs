//! Ingest configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::split::SplitPolicy;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default bucket holding the landing, processed and error zones.
pub const DEFAULT_BUCKET: &str = "sbm-file-ingester";

/// Default bucket receiving normalized batch artifacts.
pub const DEFAULT_SINK_BUCKET: &str = "hudibucketsrc";

/// Default key prefix for batch artifacts inside the sink bucket.
pub const DEFAULT_SINK_PREFIX: &str = "sensorDataFiles/";

/// Default key of the meter-to-sensor mapping table.
pub const DEFAULT_MAPPINGS_KEY: &str = "nem12_mappings.json";

/// Default wait between two stability observations (seconds).
pub const DEFAULT_STABILITY_POLL_SECS: u64 = 30;

/// Default number of changed observations before a file is quarantined.
pub const DEFAULT_STABILITY_MAX_RETRIES: u32 = 5;

/// Minimum classifier confidence accepted by the detector.
pub const DEFAULT_DETECTION_THRESHOLD: f32 = 0.8;

/// Files above this size are split (50 MiB).
pub const DEFAULT_SPLIT_THRESHOLD_BYTES: u64 = 50 * 1024 * 1024;

/// Files with more channel records than this are split.
pub const DEFAULT_SPLIT_CHANNEL_THRESHOLD: usize = 1000;

/// Maximum size of one split chunk (10 MiB).
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 10 * 1024 * 1024;

/// Maximum meters packed into one split chunk.
pub const DEFAULT_MAX_METERS_PER_CHUNK: usize = 50;

/// File units buffered before a batch artifact is written.
pub const DEFAULT_BATCH_THRESHOLD: usize = 50;

/// Concurrent per-meter units while processing one file.
pub const DEFAULT_PROCESSING_WORKERS: usize = 10;

/// Concurrent relocations while archiving.
pub const DEFAULT_ARCHIVE_WORKERS: usize = 50;

/// Base delay of the transient retry backoff (seconds).
pub const DEFAULT_RETRY_BASE_SECS: u64 = 2;

/// Attempts before a transient failure becomes fatal.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 6;

/// Lifetime of processing records (24 hours).
pub const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 86_400;

/// Age after which an unfinished attempt may be taken over (15 minutes).
pub const DEFAULT_PROCESSING_LEASE_SECS: u64 = 900;

/// Wall-clock budget of one invocation (4 hours).
pub const DEFAULT_INVOCATION_BUDGET_SECS: u64 = 4 * 60 * 60;

/// Deliveries before the queue dead-letters a message.
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 3;

/// Sink files needed before the ETL job is started.
pub const DEFAULT_ETL_FILES_THRESHOLD: usize = 2;

/// Pipeline configuration shared by the trigger handler, admin commands and jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub bucket: String,
    pub sink_bucket: String,
    pub sink_prefix: String,
    pub mappings_key: String,
    pub stability_poll_interval_secs: u64,
    pub stability_max_retries: u32,
    pub detection_threshold: f32,
    pub split_size_threshold_bytes: u64,
    pub split_channel_threshold: usize,
    pub max_chunk_bytes: usize,
    pub max_meters_per_chunk: usize,
    pub batch_threshold: usize,
    pub processing_workers: usize,
    pub archive_workers: usize,
    pub retry_base_delay_secs: u64,
    pub retry_max_attempts: u32,
    pub idempotency_ttl_secs: u64,
    pub processing_lease_secs: u64,
    pub invocation_budget_secs: u64,
    pub max_receive_count: u32,
    pub etl_files_threshold: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            sink_bucket: DEFAULT_SINK_BUCKET.to_string(),
            sink_prefix: DEFAULT_SINK_PREFIX.to_string(),
            mappings_key: DEFAULT_MAPPINGS_KEY.to_string(),
            stability_poll_interval_secs: DEFAULT_STABILITY_POLL_SECS,
            stability_max_retries: DEFAULT_STABILITY_MAX_RETRIES,
            detection_threshold: DEFAULT_DETECTION_THRESHOLD,
            split_size_threshold_bytes: DEFAULT_SPLIT_THRESHOLD_BYTES,
            split_channel_threshold: DEFAULT_SPLIT_CHANNEL_THRESHOLD,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            max_meters_per_chunk: DEFAULT_MAX_METERS_PER_CHUNK,
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            processing_workers: DEFAULT_PROCESSING_WORKERS,
            archive_workers: DEFAULT_ARCHIVE_WORKERS,
            retry_base_delay_secs: DEFAULT_RETRY_BASE_SECS,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            idempotency_ttl_secs: DEFAULT_IDEMPOTENCY_TTL_SECS,
            processing_lease_secs: DEFAULT_PROCESSING_LEASE_SECS,
            invocation_budget_secs: DEFAULT_INVOCATION_BUDGET_SECS,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            etl_files_threshold: DEFAULT_ETL_FILES_THRESHOLD,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    /// Load configuration from `INGEST_*` environment variables and defaults
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            bucket: std::env::var("INGEST_BUCKET").unwrap_or_else(|_| DEFAULT_BUCKET.to_string()),
            sink_bucket: std::env::var("INGEST_SINK_BUCKET")
                .unwrap_or_else(|_| DEFAULT_SINK_BUCKET.to_string()),
            sink_prefix: std::env::var("INGEST_SINK_PREFIX")
                .unwrap_or_else(|_| DEFAULT_SINK_PREFIX.to_string()),
            mappings_key: std::env::var("INGEST_MAPPINGS_KEY")
                .unwrap_or_else(|_| DEFAULT_MAPPINGS_KEY.to_string()),
            stability_poll_interval_secs: env_or(
                "INGEST_STABILITY_POLL_SECS",
                DEFAULT_STABILITY_POLL_SECS,
            ),
            stability_max_retries: env_or(
                "INGEST_STABILITY_MAX_RETRIES",
                DEFAULT_STABILITY_MAX_RETRIES,
            ),
            detection_threshold: DEFAULT_DETECTION_THRESHOLD,
            split_size_threshold_bytes: env_or(
                "INGEST_SPLIT_THRESHOLD_BYTES",
                DEFAULT_SPLIT_THRESHOLD_BYTES,
            ),
            split_channel_threshold: env_or(
                "INGEST_SPLIT_CHANNEL_THRESHOLD",
                DEFAULT_SPLIT_CHANNEL_THRESHOLD,
            ),
            max_chunk_bytes: env_or("INGEST_MAX_CHUNK_BYTES", DEFAULT_MAX_CHUNK_BYTES),
            max_meters_per_chunk: env_or(
                "INGEST_MAX_METERS_PER_CHUNK",
                DEFAULT_MAX_METERS_PER_CHUNK,
            ),
            batch_threshold: env_or("INGEST_BATCH_THRESHOLD", DEFAULT_BATCH_THRESHOLD),
            processing_workers: env_or("INGEST_PROCESSING_WORKERS", DEFAULT_PROCESSING_WORKERS),
            archive_workers: env_or("INGEST_ARCHIVE_WORKERS", DEFAULT_ARCHIVE_WORKERS),
            retry_base_delay_secs: env_or("INGEST_RETRY_BASE_SECS", DEFAULT_RETRY_BASE_SECS),
            retry_max_attempts: env_or("INGEST_RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS),
            idempotency_ttl_secs: env_or(
                "INGEST_IDEMPOTENCY_TTL_SECS",
                DEFAULT_IDEMPOTENCY_TTL_SECS,
            ),
            processing_lease_secs: env_or(
                "INGEST_PROCESSING_LEASE_SECS",
                DEFAULT_PROCESSING_LEASE_SECS,
            ),
            invocation_budget_secs: env_or(
                "INGEST_INVOCATION_BUDGET_SECS",
                DEFAULT_INVOCATION_BUDGET_SECS,
            ),
            max_receive_count: env_or("INGEST_MAX_RECEIVE_COUNT", DEFAULT_MAX_RECEIVE_COUNT),
            etl_files_threshold: env_or("INGEST_ETL_FILES_THRESHOLD", DEFAULT_ETL_FILES_THRESHOLD),
        };

        config.validate()?;

        Ok(config)
    }

    /// Reject settings that would stall or loop the pipeline
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bucket.is_empty() || self.sink_bucket.is_empty() {
            anyhow::bail!("Ingest and sink buckets must be set");
        }

        if self.stability_max_retries == 0 {
            anyhow::bail!("Stability max retries must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.detection_threshold) {
            anyhow::bail!("Detection threshold must be within [0, 1]");
        }

        if self.batch_threshold == 0 {
            anyhow::bail!("Batch threshold must be greater than 0");
        }

        if self.processing_workers == 0 || self.archive_workers == 0 {
            anyhow::bail!("Worker pools must have at least one worker");
        }

        if self.retry_max_attempts == 0 {
            anyhow::bail!("Retry attempts must be greater than 0");
        }

        if self.max_meters_per_chunk == 0 {
            anyhow::bail!("Chunks must be allowed at least one meter");
        }

        if self.max_chunk_bytes as u64 > self.split_size_threshold_bytes {
            anyhow::bail!(
                "Max chunk size ({}) cannot exceed the split threshold ({})",
                self.max_chunk_bytes,
                self.split_size_threshold_bytes
            );
        }

        if self.processing_lease_secs > self.idempotency_ttl_secs {
            tracing::warn!("Processing lease outlives idempotency records; stalled attempts will expire instead of being resumed");
        }

        Ok(())
    }

    pub fn stability_poll_interval(&self) -> Duration {
        Duration::from_secs(self.stability_poll_interval_secs)
    }

    pub fn invocation_budget(&self) -> Duration {
        Duration::from_secs(self.invocation_budget_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.retry_base_delay_secs),
            self.retry_max_attempts,
        )
    }

    pub fn split_policy(&self) -> SplitPolicy {
        SplitPolicy {
            size_threshold_bytes: self.split_size_threshold_bytes,
            channel_threshold: self.split_channel_threshold,
            max_chunk_bytes: self.max_chunk_bytes,
            max_meters_per_chunk: self.max_meters_per_chunk,
        }
    }
}
