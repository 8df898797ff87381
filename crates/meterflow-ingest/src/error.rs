//! Failure taxonomy for the ingestion pipeline
//!
//! Every stage converts its local errors into an [`IngestError`] before
//! returning. Only [`FailureKind::Transient`] unwinds into the orchestrator's
//! retry loop; every other kind is terminal and routes the file to the zone
//! named by [`FailureKind::zone`].

use meterflow_common::types::ObjectLocation;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::detect::FileType;
use crate::orchestrator::state::Stage;
use crate::storage::Zone;

/// Result type alias for pipeline operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Errors raised by an [`crate::storage::ObjectStore`] implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage throttled: {0}")]
    Throttled(String),

    #[error("Storage timeout: {0}")]
    Timeout(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Timeout(_))
    }
}

/// Classification of a pipeline failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Validation,
    Parse,
    Mapping,
    Quarantine,
    Unclassified,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Validation => "validation",
            Self::Parse => "parse",
            Self::Mapping => "mapping",
            Self::Quarantine => "quarantine",
            Self::Unclassified => "unclassified",
        }
    }

    /// Error zone receiving files that failed this way; transient failures stay put
    pub fn zone(&self) -> Option<Zone> {
        match self {
            Self::Transient => None,
            Self::Validation => Some(Zone::Invalid),
            Self::Parse => Some(Zone::ParseError),
            Self::Mapping => Some(Zone::Unmapped),
            Self::Quarantine => Some(Zone::Quarantine),
            Self::Unclassified => Some(Zone::ManualReview),
        }
    }

    /// Unmapped files are an expected occasional case and stay quiet
    pub fn alerts(&self) -> bool {
        !matches!(self, Self::Mapping)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline error
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Invalid content: {0}")]
    Validation(String),

    #[error("Unparseable content: {0}")]
    Parse(String),

    #[error("No readings could be mapped: {0}")]
    Mapping(String),

    #[error("File did not stabilize after {retries} observations")]
    Quarantine { retries: u32 },

    #[error("File type could not be determined: {0}")]
    Unclassified(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IngestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) => FailureKind::Transient,
            Self::Validation(_) => FailureKind::Validation,
            Self::Parse(_) => FailureKind::Parse,
            Self::Mapping(_) => FailureKind::Mapping,
            Self::Quarantine { .. } => FailureKind::Quarantine,
            Self::Unclassified(_) => FailureKind::Unclassified,
            // A vanished landing file is handled by the callers that expect it
            Self::Storage(e) if e.is_transient() => FailureKind::Transient,
            Self::Storage(StorageError::NotFound(_)) => FailureKind::Transient,
            Self::Storage(_) => FailureKind::Validation,
            Self::Config(_) => FailureKind::Validation,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(StorageError::NotFound(_)))
    }
}

impl From<meterflow_common::MeterflowError> for IngestError {
    fn from(err: meterflow_common::MeterflowError) -> Self {
        match err {
            meterflow_common::MeterflowError::Io(e) => Self::Transient(e.to_string()),
            meterflow_common::MeterflowError::Config(msg) => Self::Config(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}

/// Triage context attached to every terminal failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub kind: FailureKind,
    pub location: ObjectLocation,
    pub detected_type: Option<FileType>,
    pub stage: Stage,
    pub message: String,
}

impl FailureContext {
    pub fn new(
        kind: FailureKind,
        location: ObjectLocation,
        stage: Stage,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            location,
            detected_type: None,
            stage,
            message: message.into(),
        }
    }

    pub fn with_detected_type(mut self, file_type: Option<FileType>) -> Self {
        self.detected_type = file_type;
        self
    }

    /// Emit the alert event for kinds that alert
    pub fn raise_alert(&self) {
        if self.kind.alerts() {
            tracing::error!(
                alert = true,
                kind = %self.kind,
                stage = ?self.stage,
                location = %self.location,
                detected_type = ?self.detected_type,
                "{}",
                self.message
            );
        } else {
            tracing::info!(
                kind = %self.kind,
                stage = ?self.stage,
                location = %self.location,
                "{}",
                self.message
            );
        }
    }
}
