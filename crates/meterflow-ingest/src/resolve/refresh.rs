//! Rebuilding the mapping table from the identifier graph

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::MappingTable;
use crate::storage::ObjectStore;

/// Vertices carrying a meter identifier, with their ids
const METER_VERTEX_QUERY: &str = "g.V().has('nem12Id').valueMap(true,'nem12Id')";

#[async_trait]
pub trait GraphClient: Send + Sync {
    /// `(monitor point, sensor id)` pairs
    async fn meter_vertices(&self) -> Result<Vec<(String, String)>>;
}

/// Gremlin over the graph database's HTTP endpoint
pub struct HttpGraphClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpGraphClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

/// Strip GraphSON type wrappers down to plain JSON
fn untyped(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("@type") => {
            let kind = map.get("@type").and_then(Value::as_str).unwrap_or("").to_string();
            let inner = map.remove("@value").unwrap_or(Value::Null);
            match (kind.as_str(), inner) {
                ("g:Map", Value::Array(pairs)) => {
                    let mut out = Map::new();
                    let mut pairs = pairs.into_iter();
                    while let (Some(k), Some(v)) = (pairs.next(), pairs.next()) {
                        let key = match untyped(k) {
                            Value::String(s) => s,
                            other => other.to_string(),
                        };
                        out.insert(key, untyped(v));
                    }
                    Value::Object(out)
                }
                (_, inner) => untyped(inner),
            }
        }
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, untyped(v))).collect()),
        Value::Array(items) => Value::Array(items.into_iter().map(untyped).collect()),
        other => other,
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items.first().and_then(scalar),
        _ => None,
    }
}

/// Extract `(nem12Id, id)` pairs from a Gremlin HTTP response body
pub fn parse_vertex_rows(body: Value) -> Result<Vec<(String, String)>> {
    let data = body
        .get("result")
        .and_then(|r| r.get("data"))
        .cloned()
        .context("Gremlin response has no result.data")?;

    let rows = match untyped(data) {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => anyhow::bail!("Unexpected Gremlin result shape: {}", other),
    };

    let mut pairs = Vec::with_capacity(rows.len());
    for row in rows {
        match (row.get("nem12Id").and_then(scalar), row.get("id").and_then(scalar)) {
            (Some(point), Some(id)) => pairs.push((point, id)),
            _ => warn!("Skipping vertex without nem12Id or id: {}", row),
        }
    }
    Ok(pairs)
}

#[async_trait]
impl GraphClient for HttpGraphClient {
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn meter_vertices(&self) -> Result<Vec<(String, String)>> {
        let response = self
            .client
            .post(format!("{}/gremlin", self.endpoint))
            .json(&json!({ "gremlin": METER_VERTEX_QUERY }))
            .send()
            .await
            .context("Gremlin request failed")?
            .error_for_status()
            .context("Gremlin endpoint returned an error")?;

        let body: Value = response.json().await.context("Invalid Gremlin response")?;
        parse_vertex_rows(body)
    }
}

/// Pulls mappings from the graph and stores them as the mapping table
pub struct MappingRefresher {
    graph: Arc<dyn GraphClient>,
    store: Arc<dyn ObjectStore>,
    key: String,
}

impl MappingRefresher {
    pub fn new(graph: Arc<dyn GraphClient>, store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            graph,
            store,
            key: key.into(),
        }
    }

    /// Returns the number of mappings written
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn refresh(&self) -> Result<usize> {
        let table: MappingTable = self.graph.meter_vertices().await?.into_iter().collect();
        let body = table.to_json_pretty()?;

        self.store
            .put(&self.key, body, Some("application/json"))
            .await
            .with_context(|| format!("Failed to write mapping table to {}", self.key))?;

        info!(mappings = table.len(), "Mapping table refreshed");
        Ok(table.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    #[test]
    fn test_parse_plain_rows() {
        let body = json!({
            "result": {"data": [
                {"id": "v-1", "nem12Id": ["NMI1-E1"]},
                {"id": 42, "nem12Id": ["NMI2-B1"]},
                {"id": "v-3"}
            ]}
        });
        let pairs = parse_vertex_rows(body).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("NMI1-E1".to_string(), "v-1".to_string()),
                ("NMI2-B1".to_string(), "42".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_graphson_rows() {
        let body = json!({
            "result": {"data": {"@type": "g:List", "@value": [
                {"@type": "g:Map", "@value": [
                    {"@type": "g:T", "@value": "id"}, "v-9",
                    "nem12Id", {"@type": "g:List", "@value": ["NMI9-E1"]}
                ]}
            ]}}
        });
        let pairs = parse_vertex_rows(body).unwrap();
        assert_eq!(pairs, vec![("NMI9-E1".to_string(), "v-9".to_string())]);
    }

    #[test]
    fn test_missing_result_is_error() {
        assert!(parse_vertex_rows(json!({"status": {}})).is_err());
    }

    struct FixedGraph;

    #[async_trait]
    impl GraphClient for FixedGraph {
        async fn meter_vertices(&self) -> Result<Vec<(String, String)>> {
            Ok(vec![("NMI1-E1".to_string(), "s1".to_string())])
        }
    }

    #[tokio::test]
    async fn test_refresh_writes_table() {
        let store = Arc::new(MemoryObjectStore::new("ingest"));
        let refresher = MappingRefresher::new(Arc::new(FixedGraph), store.clone(), "nem12_mappings.json");

        assert_eq!(refresher.refresh().await.unwrap(), 1);
        let table = MappingTable::load(store.as_ref(), "nem12_mappings.json").await.unwrap();
        assert_eq!(table.get("NMI1", "E1"), Some("s1"));
    }
}
