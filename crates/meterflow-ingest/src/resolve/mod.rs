//! Meter/channel to sensor identifier resolution
//!
//! A missing mapping is a normal outcome (`Ok(None)`), never a parse failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{IngestError, IngestResult};
use crate::storage::ObjectStore;

pub mod refresh;

pub use refresh::{GraphClient, HttpGraphClient, MappingRefresher};

/// Suffix letters of valid data streams
const STREAM_SUFFIXES: &str = "ABCDEFJKLPQRSTUGHYMWVZ";

/// Channels worth resolving: a stream suffix letter followed by `1-9` or `A-Z`
pub fn is_valid_channel(channel: &str) -> bool {
    let mut chars = channel.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some(suffix), Some(number), None) => {
            STREAM_SUFFIXES.contains(suffix)
                && (('1'..='9').contains(&number) || number.is_ascii_uppercase())
        }
        _ => false,
    }
}

/// Key under which a monitor point is stored in the mapping table
pub fn mapping_key(meter_id: &str, channel: &str) -> String {
    format!("{}-{}", meter_id, channel)
}

#[async_trait]
pub trait IdentifierResolver: Send + Sync {
    async fn resolve(&self, meter_id: &str, channel: &str) -> IngestResult<Option<String>>;
}

/// Snapshot of monitor point to sensor id mappings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingTable {
    entries: BTreeMap<String, String>,
}

impl MappingTable {
    pub fn from_json(data: &[u8]) -> IngestResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| IngestError::Transient(format!("unreadable mapping table: {}", e)))
    }

    /// Load the table stored at `key`; any failure is transient
    pub async fn load(store: &dyn ObjectStore, key: &str) -> IngestResult<Self> {
        let data = store.get(key).await.map_err(|e| {
            IngestError::Transient(format!("failed to read mapping table {}: {}", key, e))
        })?;
        let table = Self::from_json(&data)?;
        info!(mappings = table.len(), "Loaded mapping table from {}", key);
        Ok(table)
    }

    pub fn get(&self, meter_id: &str, channel: &str) -> Option<&str> {
        self.entries
            .get(&mapping_key(meter_id, channel))
            .map(String::as_str)
    }

    pub fn insert(&mut self, monitor_point: impl Into<String>, sensor_id: impl Into<String>) {
        self.entries.insert(monitor_point.into(), sensor_id.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json_pretty(&self) -> IngestResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| IngestError::Validation(format!("mapping table not serializable: {}", e)))
    }
}

impl FromIterator<(String, String)> for MappingTable {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[async_trait]
impl IdentifierResolver for MappingTable {
    async fn resolve(&self, meter_id: &str, channel: &str) -> IngestResult<Option<String>> {
        let sensor = self.get(meter_id, channel).map(str::to_string);
        if sensor.is_none() {
            debug!(meter_id, channel, "No mapping");
        }
        Ok(sensor)
    }
}
