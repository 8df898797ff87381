//! Shared fixtures for meterflow-ingest integration tests
//!
//! Everything runs against the in-memory object store, processing store and
//! queue; no external services are needed.

#![allow(dead_code, clippy::unwrap_used)]

use meterflow_common::types::ObjectLocation;
use meterflow_ingest::idempotency::MemoryProcessingStore;
use meterflow_ingest::orchestrator::{FileInput, Pipeline};
use meterflow_ingest::resolve::{IdentifierResolver, MappingTable};
use meterflow_ingest::retry::RetryPolicy;
use meterflow_ingest::storage::{MemoryObjectStore, ObjectStore};
use meterflow_ingest::IngestConfig;
use std::sync::Arc;

pub const BUCKET: &str = "ingest";
pub const SINK_BUCKET: &str = "lake";

pub const NEM12_HEADER: &str = "100,NEM12,202601010000,MDA1,RETAILER";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,meterflow_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// `300` record for 2026-01-01 with 48 half-hour values
pub fn interval_day(seed: usize) -> String {
    let values: Vec<String> = (0..48).map(|i| format!("{}.{}", seed % 97, i)).collect();
    format!("300,20260101,{},A,,,20260102000000,", values.join(","))
}

/// `200` + `300` records of one channel
pub fn channel_block(nmi: &str, suffix: &str, seed: usize) -> String {
    format!(
        "200,{nmi},E1B1,{suffix},{suffix},N1,M{seed},kWh,30,\n{}\n",
        interval_day(seed)
    )
}

/// Interval file with one `E1` channel per meter
pub fn nem12_file(meters: &[String]) -> String {
    let mut out = format!("{}\n", NEM12_HEADER);
    for (i, nmi) in meters.iter().enumerate() {
        out.push_str(&channel_block(nmi, "E1", i));
    }
    out.push_str("900\n");
    out
}

pub fn meter_ids(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("NMI{:06}", i)).collect()
}

/// Mapping table covering the `E1` channel of every meter
pub fn mappings_for(meters: &[String]) -> MappingTable {
    meters
        .iter()
        .enumerate()
        .map(|(i, nmi)| (format!("{}-E1", nmi), format!("sensor-{}", i)))
        .collect()
}

pub struct Harness {
    pub store: MemoryObjectStore,
    pub sink: MemoryObjectStore,
    pub processing: Arc<MemoryProcessingStore>,
    pub pipeline: Arc<Pipeline>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(IngestConfig::default())
    }

    pub fn with_config(config: IngestConfig) -> Self {
        let store = MemoryObjectStore::new(BUCKET);
        let sink = MemoryObjectStore::new(SINK_BUCKET);
        let processing = Arc::new(MemoryProcessingStore::new());
        let pipeline = Pipeline::new(
            config,
            Arc::new(store.clone()),
            Arc::new(sink.clone()),
            processing.clone(),
        )
        .with_retry_policy(RetryPolicy::none());

        Self {
            store,
            sink,
            processing,
            pipeline: Arc::new(pipeline),
        }
    }

    pub async fn upload(&self, key: &str, body: impl Into<Vec<u8>>) {
        self.store.put(key, body.into(), None).await.unwrap();
    }

    /// Input as delivered after a successful stability check
    pub async fn stable_input(&self, key: &str) -> FileInput {
        let meta = self.store.head(key).await.unwrap().unwrap();
        FileInput::stable(ObjectLocation::new(BUCKET, key), meta)
    }

    /// Data rows across every artifact in the sink
    pub async fn sink_rows(&self) -> Vec<String> {
        let mut rows = Vec::new();
        for key in self.sink.keys() {
            let body = String::from_utf8(self.sink.get(&key).await.unwrap()).unwrap();
            rows.extend(body.lines().skip(1).map(str::to_string));
        }
        rows
    }
}

pub fn resolver(table: MappingTable) -> Arc<dyn IdentifierResolver> {
    Arc::new(table)
}

/// Object-store create event as delivered in a queue record body
pub fn event_body(key: &str) -> String {
    serde_json::json!({
        "Records": [{
            "eventName": "ObjectCreated:Put",
            "s3": {"bucket": {"name": BUCKET}, "object": {"key": key}}
        }]
    })
    .to_string()
}
