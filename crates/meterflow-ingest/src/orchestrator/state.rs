//! Per-file pipeline state machine
//!
//! [`Machine::step`] is a pure transition function: it takes the current
//! [`PipelineState`] and an [`Event`] reported by the runner and returns the
//! next state together with the [`Effect`]s the runner must perform. The
//! state is persisted after every step, so [`Machine::resume`] can pick a
//! crashed file up where it stopped.

use meterflow_common::types::ObjectLocation;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::detect::{FileType, FileTypeResult};
use crate::error::{FailureContext, FailureKind};
use crate::split::SplitPolicy;
use crate::storage::Zone;
use crate::transform::TransformSummary;

/// Coarse position of a file in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Stabilizing,
    TypeDetecting,
    Splitting,
    Processing,
    BatchWriting,
    Archiving,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Stabilizing => "stabilizing",
            Self::TypeDetecting => "type_detecting",
            Self::Splitting => "splitting",
            Self::Processing => "processing",
            Self::BatchWriting => "batch_writing",
            Self::Archiving => "archiving",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful end of a file's run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Readings written to the sink
    Ingested {
        summary: TransformSummary,
        artifact: String,
    },
    /// Split into chunks that re-enter the pipeline on their own
    Delegated { chunks: Vec<String> },
    /// A document carrying no readings, passed on to the reports zone
    Forwarded,
}

/// How a file's run ends once its relocation is done
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "settlement", rename_all = "snake_case")]
pub enum Settlement {
    Completed(Outcome),
    Failed(FailureContext),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Stabilizing,
    TypeDetecting,
    Splitting {
        detection: FileTypeResult,
    },
    Processing {
        detection: FileTypeResult,
    },
    BatchWriting {
        detection: FileTypeResult,
        summary: TransformSummary,
    },
    Archiving {
        destination: Zone,
        settlement: Settlement,
    },
    Completed {
        outcome: Outcome,
    },
    Failed {
        failure: FailureContext,
    },
}

impl PipelineState {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Received => Stage::Received,
            Self::Stabilizing => Stage::Stabilizing,
            Self::TypeDetecting => Stage::TypeDetecting,
            Self::Splitting { .. } => Stage::Splitting,
            Self::Processing { .. } => Stage::Processing,
            Self::BatchWriting { .. } => Stage::BatchWriting,
            Self::Archiving { .. } => Stage::Archiving,
            Self::Completed { .. } => Stage::Completed,
            Self::Failed { .. } => Stage::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    pub fn detected_type(&self) -> Option<FileType> {
        match self {
            Self::Splitting { detection }
            | Self::Processing { detection }
            | Self::BatchWriting { detection, .. } => Some(detection.file_type),
            Self::Archiving {
                settlement: Settlement::Failed(failure),
                ..
            }
            | Self::Failed { failure } => failure.detected_type,
            _ => None,
        }
    }
}

/// What the runner observed while performing an effect
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start,
    Stable,
    Quarantined { retries: u32 },
    Detected {
        result: FileTypeResult,
        size: u64,
        channels: usize,
    },
    Split { chunks: Vec<String> },
    Unsplittable,
    Transformed { summary: TransformSummary },
    Written { artifact: String },
    Relocated,
    Failed { kind: FailureKind, message: String },
}

/// Work the runner must do to move the file forward
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    CheckStability,
    Detect,
    Split(FileTypeResult),
    Process(FileTypeResult),
    /// Hand the transformed readings to the batch writer and wait for its flush
    Buffer,
    Relocate(Zone),
    Alert(FailureContext),
}

/// Transition function for one file
#[derive(Debug, Clone)]
pub struct Machine {
    location: ObjectLocation,
    policy: SplitPolicy,
}

impl Machine {
    pub fn new(location: ObjectLocation, policy: SplitPolicy) -> Self {
        Self { location, policy }
    }

    pub fn location(&self) -> &ObjectLocation {
        &self.location
    }

    pub fn step(&self, state: PipelineState, event: Event) -> (PipelineState, Vec<Effect>) {
        use PipelineState as S;

        match (state, event) {
            (state, Event::Failed { kind, message }) if !state.is_terminal() => {
                self.fail(&state, kind, message)
            }

            (S::Received, Event::Start) => (S::Stabilizing, vec![Effect::CheckStability]),

            (S::Stabilizing, Event::Stable) => (S::TypeDetecting, vec![Effect::Detect]),
            (S::Stabilizing, Event::Quarantined { retries }) => self.fail(
                &S::Stabilizing,
                FailureKind::Quarantine,
                format!("file did not stabilize after {retries} observations"),
            ),

            (S::TypeDetecting, Event::Detected { result, size, channels }) => {
                if result.file_type.is_document() {
                    let settlement = Settlement::Completed(Outcome::Forwarded);
                    return self.archive(Zone::Reports, settlement);
                }
                if result.file_type.is_splittable() && self.policy.should_split(size, channels) {
                    let effect = Effect::Split(result.clone());
                    return (S::Splitting { detection: result }, vec![effect]);
                }
                let effect = Effect::Process(result.clone());
                (S::Processing { detection: result }, vec![effect])
            }

            (S::Splitting { .. }, Event::Split { chunks }) => {
                self.archive(Zone::Processed, Settlement::Completed(Outcome::Delegated { chunks }))
            }
            (S::Splitting { detection }, Event::Unsplittable) => {
                let effect = Effect::Process(detection.clone());
                (S::Processing { detection }, vec![effect])
            }

            (S::Processing { detection }, Event::Transformed { summary }) => {
                match summary.verdict() {
                    Ok(()) => (S::BatchWriting { detection, summary }, vec![Effect::Buffer]),
                    Err(e) => {
                        let state = S::Processing { detection };
                        self.fail(&state, e.kind(), e.to_string())
                    }
                }
            }

            (S::BatchWriting { summary, .. }, Event::Written { artifact }) => self.archive(
                Zone::Processed,
                Settlement::Completed(Outcome::Ingested { summary, artifact }),
            ),

            (S::Archiving { settlement, .. }, Event::Relocated) => match settlement {
                Settlement::Completed(outcome) => (S::Completed { outcome }, Vec::new()),
                Settlement::Failed(failure) => (S::Failed { failure }, Vec::new()),
            },

            (state, event) => {
                warn!(
                    location = %self.location,
                    stage = %state.stage(),
                    event = ?event,
                    "Ignoring event that does not apply to the current stage"
                );
                (state, Vec::new())
            }
        }
    }

    /// State and effects to re-drive a persisted state after a restart
    ///
    /// Buffered readings do not survive a restart, so a file caught between
    /// transform and flush is processed again.
    pub fn resume(&self, state: PipelineState) -> (PipelineState, Vec<Effect>) {
        use PipelineState as S;

        match state {
            S::Received => self.step(S::Received, Event::Start),
            S::Stabilizing => (S::Stabilizing, vec![Effect::CheckStability]),
            S::TypeDetecting => (S::TypeDetecting, vec![Effect::Detect]),
            S::Splitting { detection } => {
                let effect = Effect::Split(detection.clone());
                (S::Splitting { detection }, vec![effect])
            }
            S::Processing { detection } | S::BatchWriting { detection, .. } => {
                let effect = Effect::Process(detection.clone());
                (S::Processing { detection }, vec![effect])
            }
            S::Archiving {
                destination,
                settlement,
            } => (
                S::Archiving {
                    destination,
                    settlement,
                },
                vec![Effect::Relocate(destination)],
            ),
            terminal => (terminal, Vec::new()),
        }
    }

    fn archive(&self, destination: Zone, settlement: Settlement) -> (PipelineState, Vec<Effect>) {
        (
            PipelineState::Archiving {
                destination,
                settlement,
            },
            vec![Effect::Relocate(destination)],
        )
    }

    fn fail(
        &self,
        state: &PipelineState,
        kind: FailureKind,
        message: String,
    ) -> (PipelineState, Vec<Effect>) {
        let failure = FailureContext::new(kind, self.location.clone(), state.stage(), message)
            .with_detected_type(state.detected_type());
        let alert = Effect::Alert(failure.clone());

        match kind.zone() {
            Some(zone) => (
                PipelineState::Archiving {
                    destination: zone,
                    settlement: Settlement::Failed(failure),
                },
                vec![alert, Effect::Relocate(zone)],
            ),
            // Transient failures leave the file in landing for redelivery
            None => (PipelineState::Failed { failure }, vec![alert]),
        }
    }
}
