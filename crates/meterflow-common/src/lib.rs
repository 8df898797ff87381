//! Meterflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the meterflow workspace.
//!
//! - **Error Handling**: [`MeterflowError`] and the crate [`Result`] alias
//! - **Logging**: subscriber bootstrap shared by every binary
//! - **Checksums**: content hashes and deterministic fingerprints
//! - **Types**: object locations and ISO week partitions
//!
//! # Example
//!
//! ```no_run
//! use meterflow_common::checksum::sha256_hex;
//! use meterflow_common::types::ObjectLocation;
//!
//! let location = ObjectLocation::new("ingest-bucket", "landing/site_a.csv");
//! println!("{} -> {}", location, sha256_hex(b"100,NEM12"));
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{MeterflowError, Result};
