//! Meterflow ingestion engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Turns meter data files dropped into an object store into normalized sensor
//! readings for the data lake.
//!
//! # Pipeline
//!
//! ```text
//! trigger ─▶ stability ─▶ detect ─┬─▶ split ─▶ (chunks back to landing/)
//!                                 └─▶ parse ─▶ resolve ─▶ transform ─▶ batch ─▶ relocate
//! ```
//!
//! Each file is driven by the explicit state machine in [`orchestrator`]; its
//! state is persisted through [`idempotency`] so a crashed invocation resumes
//! where it stopped. Failures are classified by [`error::FailureKind`] and
//! routed to their error zone.
//!
//! Periodic jobs live beside the pipeline: [`archive`] moves settled files into
//! weekly partitions and [`etl`] starts the downstream lake import.

pub mod admin;
pub mod archive;
pub mod batch;
pub mod cli;
pub mod config;
pub mod detect;
pub mod error;
pub mod etl;
pub mod idempotency;
pub mod orchestrator;
pub mod parser;
pub mod resolve;
pub mod retry;
pub mod split;
pub mod stability;
pub mod storage;
pub mod transform;
pub mod trigger;

pub use config::IngestConfig;
pub use error::{FailureKind, IngestError, IngestResult};
