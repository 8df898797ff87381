//! HTTP clients against mock servers

mod common;

use common::*;
use meterflow_ingest::error::FailureKind;
use meterflow_ingest::etl::{EtlLauncher, EtlReason, EtlTrigger, HttpEtlLauncher, LaunchResult};
use meterflow_ingest::resolve::refresh::{GraphClient, HttpGraphClient, MappingRefresher};
use meterflow_ingest::resolve::MappingTable;
use meterflow_ingest::storage::{MemoryObjectStore, ObjectStore};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_graph_refresh_writes_mapping_table() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/gremlin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "requestId": "r-1",
            "status": {"code": 200},
            "result": {"data": [
                {"id": "sensor-1", "nem12Id": ["NMI0000001-E1"]},
                {"id": "sensor-2", "nem12Id": ["NMI0000002-B1"]},
                {"id": "orphan"}
            ]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = MemoryObjectStore::new(BUCKET);
    let graph = Arc::new(HttpGraphClient::new(server.uri()).unwrap());
    let refresher = MappingRefresher::new(graph, Arc::new(store.clone()), "nem12_mappings.json");

    assert_eq!(refresher.refresh().await.unwrap(), 2);

    let table = MappingTable::load(&store, "nem12_mappings.json").await.unwrap();
    assert_eq!(table.get("NMI0000001", "E1"), Some("sensor-1"));
    assert_eq!(table.get("NMI0000002", "B1"), Some("sensor-2"));
    assert_eq!(table.len(), 2);
}

#[tokio::test]
async fn test_graph_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/gremlin"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let graph = HttpGraphClient::new(format!("{}/", server.uri())).unwrap();
    assert!(graph.meter_vertices().await.is_err());
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_table() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/gremlin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": {"code": 500}})))
        .mount(&server)
        .await;

    let store = MemoryObjectStore::new(BUCKET);
    store
        .put("nem12_mappings.json", br#"{"NMI1-E1":"sensor-1"}"#.to_vec(), None)
        .await
        .unwrap();
    let graph = Arc::new(HttpGraphClient::new(server.uri()).unwrap());
    let refresher = MappingRefresher::new(graph, Arc::new(store.clone()), "nem12_mappings.json");

    assert!(refresher.refresh().await.is_err());
    let table = MappingTable::load(&store, "nem12_mappings.json").await.unwrap();
    assert_eq!(table.get("NMI1", "E1"), Some("sensor-1"));
}

#[tokio::test]
async fn test_etl_launch_started_with_run_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/jobs/run"))
        .and(body_partial_json(json!({"jobName": "DataImportIntoLake"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"runId": "jr_42"})))
        .expect(1)
        .mount(&server)
        .await;

    let launcher = Arc::new(HttpEtlLauncher::new(format!("{}/jobs/run", server.uri())).unwrap());
    let sink = MemoryObjectStore::new(SINK_BUCKET);
    for i in 0..3 {
        sink.put(&format!("sensorDataFiles/batch-{}.csv", i), b"x".to_vec(), None)
            .await
            .unwrap();
    }
    sink.put("sensorDataFiles/", Vec::new(), None).await.unwrap();

    let trigger = EtlTrigger::new(Arc::new(sink), "sensorDataFiles/", 2, launcher);
    let report = trigger.check_and_trigger().await.unwrap();

    assert!(report.triggered);
    assert_eq!(report.file_count, 3);
    assert_eq!(report.reason, EtlReason::Started);
    assert_eq!(report.run_id.as_deref(), Some("jr_42"));
}

#[tokio::test]
async fn test_etl_launch_conflict_means_already_running() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let launcher = HttpEtlLauncher::new(server.uri()).unwrap();
    assert_eq!(
        launcher.launch("DataImportIntoLake").await.unwrap(),
        LaunchResult::AlreadyRunning
    );
}

#[tokio::test]
async fn test_etl_launch_statuses_map_to_failure_kinds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"jobName": "busy"})))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"jobName": "missing"})))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let launcher = HttpEtlLauncher::new(server.uri()).unwrap();
    let busy = launcher.launch("busy").await.unwrap_err();
    assert_eq!(busy.kind(), FailureKind::Transient);
    let missing = launcher.launch("missing").await.unwrap_err();
    assert_eq!(missing.kind(), FailureKind::Validation);
}

#[tokio::test]
async fn test_etl_below_threshold_does_not_call_launcher() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let launcher = Arc::new(HttpEtlLauncher::new(server.uri()).unwrap());
    let sink = MemoryObjectStore::new(SINK_BUCKET);
    sink.put("sensorDataFiles/only.csv", b"x".to_vec(), None)
        .await
        .unwrap();

    let report = EtlTrigger::new(Arc::new(sink), "sensorDataFiles/", 2, launcher)
        .check_and_trigger()
        .await
        .unwrap();

    assert!(!report.triggered);
    assert_eq!(report.file_count, 1);
    assert_eq!(report.reason, EtlReason::BelowThreshold);
}
