//! Starting the downstream lake import once enough batches have landed

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::{IngestError, IngestResult};
use crate::storage::ObjectStore;

/// Default name of the lake import job
pub const DEFAULT_ETL_JOB_NAME: &str = "DataImportIntoLake";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchResult {
    Started { run_id: Option<String> },
    AlreadyRunning,
}

#[async_trait]
pub trait EtlLauncher: Send + Sync {
    async fn launch(&self, job_name: &str) -> IngestResult<LaunchResult>;
}

/// Launches jobs through an HTTP job-runner endpoint
///
/// `POST <url>` with `{"jobName": ...}`; `409 Conflict` means a run is active.
pub struct HttpEtlLauncher {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    #[serde(rename = "runId", default)]
    run_id: Option<String>,
}

impl HttpEtlLauncher {
    pub fn new(url: impl Into<String>) -> IngestResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IngestError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EtlLauncher for HttpEtlLauncher {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn launch(&self, job_name: &str) -> IngestResult<LaunchResult> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "jobName": job_name }))
            .send()
            .await
            .map_err(|e| IngestError::Transient(format!("ETL launch request failed: {}", e)))?;

        match response.status() {
            StatusCode::CONFLICT => Ok(LaunchResult::AlreadyRunning),
            status if status.is_success() => {
                // An empty or foreign body still means the run was accepted
                let body = response.json::<LaunchResponse>().await.ok();
                Ok(LaunchResult::Started {
                    run_id: body.and_then(|b| b.run_id),
                })
            }
            status if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => Err(
                IngestError::Transient(format!("ETL launcher answered {}", status)),
            ),
            status => Err(IngestError::Validation(format!(
                "ETL launcher rejected the request with {}",
                status
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EtlReason {
    BelowThreshold,
    AlreadyRunning,
    Started,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EtlTriggerReport {
    pub triggered: bool,
    pub file_count: usize,
    pub reason: EtlReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

pub struct EtlTrigger {
    sink: Arc<dyn ObjectStore>,
    prefix: String,
    threshold: usize,
    job_name: String,
    launcher: Arc<dyn EtlLauncher>,
}

impl EtlTrigger {
    pub fn new(
        sink: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        threshold: usize,
        launcher: Arc<dyn EtlLauncher>,
    ) -> Self {
        Self {
            sink,
            prefix: prefix.into(),
            threshold,
            job_name: DEFAULT_ETL_JOB_NAME.to_string(),
            launcher,
        }
    }

    pub fn with_job_name(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = job_name.into();
        self
    }

    /// Count pending artifacts, ignoring directory markers
    pub async fn pending_files(&self) -> IngestResult<usize> {
        let objects = self.sink.list(&self.prefix).await?;
        Ok(objects.iter().filter(|o| !o.key.ends_with('/')).count())
    }

    #[instrument(skip(self), fields(bucket = self.sink.bucket(), prefix = %self.prefix))]
    pub async fn check_and_trigger(&self) -> IngestResult<EtlTriggerReport> {
        let file_count = self.pending_files().await?;
        info!(file_count, threshold = self.threshold, "Counted pending batch files");

        if file_count < self.threshold {
            info!(file_count, "Below threshold, not starting {}", self.job_name);
            return Ok(EtlTriggerReport {
                triggered: false,
                file_count,
                reason: EtlReason::BelowThreshold,
                run_id: None,
            });
        }

        match self.launcher.launch(&self.job_name).await? {
            LaunchResult::Started { run_id } => {
                info!(job = %self.job_name, run_id = ?run_id, "ETL job started");
                Ok(EtlTriggerReport {
                    triggered: true,
                    file_count,
                    reason: EtlReason::Started,
                    run_id,
                })
            }
            LaunchResult::AlreadyRunning => {
                info!(job = %self.job_name, "ETL job is already running, skipping");
                Ok(EtlTriggerReport {
                    triggered: false,
                    file_count,
                    reason: EtlReason::AlreadyRunning,
                    run_id: None,
                })
            }
        }
    }
}
