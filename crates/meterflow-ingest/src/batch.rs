//! Batched output artifacts for the downstream lake import
//!
//! Readings from many files are buffered and written as one CSV so each
//! downstream write carries up to `threshold` file units. A file's readings
//! sit in exactly one flushed artifact; a failed flush keeps the buffer.

use chrono::Utc;
use meterflow_common::types::ObjectLocation;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::retry::{with_backoff, RetryPolicy};
use crate::storage::ObjectStore;
use crate::transform::NormalizedReading;

pub const OUTPUT_COLUMNS: [&str; 5] = ["sensorId", "ts", "val", "unit", "its"];
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A written batch and the files it acknowledges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub key: String,
    pub rows: usize,
    pub origins: Vec<ObjectLocation>,
}

struct PendingUnit {
    origin: ObjectLocation,
    readings: Vec<NormalizedReading>,
}

pub struct BatchWriter {
    sink: Arc<dyn ObjectStore>,
    prefix: String,
    threshold: usize,
    retry: RetryPolicy,
    pending: Vec<PendingUnit>,
}

impl BatchWriter {
    pub fn new(sink: Arc<dyn ObjectStore>, prefix: impl Into<String>, threshold: usize) -> Self {
        Self {
            sink,
            prefix: prefix.into(),
            threshold: threshold.max(1),
            retry: RetryPolicy::none(),
            pending: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Buffer one file unit
    pub fn add(&mut self, readings: Vec<NormalizedReading>, origin: ObjectLocation) {
        self.pending.push(PendingUnit { origin, readings });
    }

    pub fn pending_units(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_origins(&self) -> impl Iterator<Item = &ObjectLocation> {
        self.pending.iter().map(|u| &u.origin)
    }

    pub fn is_due(&self) -> bool {
        self.pending.len() >= self.threshold
    }

    pub async fn flush_if_due(&mut self) -> IngestResult<Option<OutputArtifact>> {
        if self.is_due() {
            self.flush().await
        } else {
            Ok(None)
        }
    }

    /// Write everything buffered; `None` when the buffer is empty
    #[instrument(skip(self), fields(units = self.pending.len()))]
    pub async fn flush(&mut self) -> IngestResult<Option<OutputArtifact>> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        let (body, rows) = self.render()?;
        let key = format!(
            "{}batch_{}_{}.csv",
            self.prefix,
            Utc::now().format("%Y_%b_%dT%H_%M_%S_%6f"),
            Uuid::new_v4()
        );

        let sink = self.sink.as_ref();
        let (key_ref, body_ref) = (key.as_str(), &body);
        with_backoff(&self.retry, "batch write", move || async move {
            Ok::<_, IngestError>(sink.put(key_ref, body_ref.clone(), Some("text/csv")).await?)
        })
        .await?;

        let mut origins: Vec<ObjectLocation> = Vec::with_capacity(self.pending.len());
        for unit in self.pending.drain(..) {
            if !origins.contains(&unit.origin) {
                origins.push(unit.origin);
            }
        }

        info!(
            key = %key,
            rows,
            files = origins.len(),
            "Flushed batch to {}",
            self.sink.bucket()
        );
        Ok(Some(OutputArtifact { key, rows, origins }))
    }

    /// Drop everything buffered, returning the number of discarded units
    pub fn discard(&mut self) -> usize {
        let units = self.pending.len();
        self.pending.clear();
        units
    }

    fn render(&self) -> IngestResult<(Vec<u8>, usize)> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let mut rows = 0;
        let render_err = |e: csv::Error| IngestError::Validation(format!("batch render failed: {}", e));

        writer.write_record(OUTPUT_COLUMNS).map_err(render_err)?;
        for reading in self.pending.iter().flat_map(|u| &u.readings) {
            let Some(sensor) = &reading.sensor_id else {
                continue;
            };
            let ts = reading.timestamp.format(TIMESTAMP_FORMAT).to_string();
            writer
                .write_record([
                    sensor.as_str(),
                    ts.as_str(),
                    reading.value.to_string().as_str(),
                    reading.unit.to_lowercase().as_str(),
                    ts.as_str(),
                ])
                .map_err(render_err)?;
            rows += 1;
        }

        let body = writer
            .into_inner()
            .map_err(|e| IngestError::Validation(format!("batch render failed: {}", e)))?;
        Ok((body, rows))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::MemoryObjectStore;
    use chrono::NaiveDate;

    fn reading(sensor: &str, minute: u32) -> NormalizedReading {
        NormalizedReading {
            sensor_id: Some(sensor.to_string()),
            timestamp: NaiveDate::from_ymd_opt(2026, 1, 2)
                .unwrap()
                .and_hms_opt(3, minute, 0)
                .unwrap(),
            value: 1.5,
            unit: Arc::from("kWh"),
            meter_id: Arc::from("NMI1"),
            channel: Arc::from("E1"),
            source: Arc::from("landing/a.csv"),
        }
    }

    fn origin(name: &str) -> ObjectLocation {
        ObjectLocation::new("ingest", format!("landing/{}", name))
    }

    #[tokio::test]
    async fn test_csv_layout() {
        let sink = Arc::new(MemoryObjectStore::new("lake"));
        let mut writer = BatchWriter::new(sink.clone(), "sensorDataFiles/", 1);
        writer.add(vec![reading("s1", 30)], origin("a.csv"));

        let artifact = writer.flush_if_due().await.unwrap().unwrap();
        assert!(artifact.key.starts_with("sensorDataFiles/batch_"));
        assert!(artifact.key.ends_with(".csv"));

        let body = String::from_utf8(sink.get(&artifact.key).await.unwrap()).unwrap();
        assert_eq!(
            body,
            "sensorId,ts,val,unit,its\ns1,2026-01-02 03:30:00,1.5,kwh,2026-01-02 03:30:00\n"
        );
    }

    #[tokio::test]
    async fn test_flush_only_when_due() {
        let sink = Arc::new(MemoryObjectStore::new("lake"));
        let mut writer = BatchWriter::new(sink.clone(), "out/", 3);

        writer.add(vec![reading("s1", 0)], origin("a.csv"));
        assert!(writer.flush_if_due().await.unwrap().is_none());
        writer.add(vec![reading("s2", 0), reading("s2", 1)], origin("b.csv"));
        assert!(writer.flush_if_due().await.unwrap().is_none());
        writer.add(vec![reading("s3", 0)], origin("c.csv"));

        let artifact = writer.flush_if_due().await.unwrap().unwrap();
        assert_eq!(artifact.rows, 4);
        assert_eq!(artifact.origins, vec![origin("a.csv"), origin("b.csv"), origin("c.csv")]);
        assert_eq!(writer.pending_units(), 0);
        assert!(writer.flush().await.unwrap().is_none());
        assert_eq!(sink.keys().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_buffer() {
        let sink = Arc::new(MemoryObjectStore::new("lake"));
        let mut writer = BatchWriter::new(sink.clone(), "out/", 1);
        writer.add(vec![reading("s1", 0)], origin("a.csv"));
        sink.fail_next("put", StorageError::Throttled("SlowDown".into()));

        assert!(writer.flush().await.is_err());
        assert_eq!(writer.pending_units(), 1);

        let artifact = writer.flush().await.unwrap().unwrap();
        assert_eq!(artifact.origins, vec![origin("a.csv")]);
    }
}
