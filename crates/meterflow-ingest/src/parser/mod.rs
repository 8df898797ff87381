//! Format adapters turning raw file bytes into [`RawReading`]s
//!
//! Adapters are synchronous and CPU bound; the orchestrator runs them on the
//! blocking pool.

use chrono::{NaiveDate, NaiveDateTime};
use std::sync::Arc;
use tracing::debug;

use crate::detect::{decode_auto, FileType, TextEncoding};
use crate::error::{IngestError, IngestResult};

pub mod nem;
pub mod vendor;

pub use nem::NemParser;
pub use vendor::{
    ComxParser, EnviziBulkWaterParser, EnviziElectricityParser, EnviziWaterParser, OptimaParser,
    RacvParser,
};

/// One value read from a source file, before identifier resolution
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    pub meter_id: Arc<str>,
    pub channel: Arc<str>,
    pub unit: Arc<str>,
    pub timestamp: NaiveDateTime,
    /// Source text; validated during transform
    pub value: String,
    pub quality: Option<String>,
}

pub trait RecordParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(
        &self,
        file_name: &str,
        bytes: &[u8],
        encoding: TextEncoding,
    ) -> IngestResult<Vec<RawReading>>;
}

/// Adapter for a confidently detected type; documents have none
pub fn parser_for(file_type: FileType) -> Option<Box<dyn RecordParser>> {
    let parser: Box<dyn RecordParser> = match file_type {
        FileType::IntervalMeter | FileType::AccumulationMeter => Box::new(NemParser::default()),
        FileType::EnviziWater => Box::new(EnviziWaterParser),
        FileType::EnviziWaterBulk => Box::new(EnviziBulkWaterParser),
        FileType::EnviziElectricity => Box::new(EnviziElectricityParser),
        FileType::RacvElectricity => Box::new(RacvParser),
        FileType::OptimaInterval => Box::new(OptimaParser),
        FileType::ComxPrivateWire => Box::new(ComxParser),
        FileType::BillingReport | FileType::Pdf | FileType::Unknown => return None,
    };
    Some(parser)
}

/// Order in which adapters are tried for files detection could not place
pub const FALLBACK_ORDER: [FileType; 7] = [
    FileType::IntervalMeter,
    FileType::EnviziWater,
    FileType::EnviziElectricity,
    FileType::RacvElectricity,
    FileType::OptimaInterval,
    FileType::EnviziWaterBulk,
    FileType::ComxPrivateWire,
];

/// Try the low-confidence candidate, then every adapter in [`FALLBACK_ORDER`]
///
/// The first adapter producing readings wins. Returns
/// [`IngestError::Parse`] when none does.
pub fn parse_with_fallback(
    candidate: Option<FileType>,
    file_name: &str,
    bytes: &[u8],
    encoding: TextEncoding,
) -> IngestResult<(FileType, Vec<RawReading>)> {
    let mut order: Vec<FileType> = candidate.into_iter().collect();
    order.extend(FALLBACK_ORDER.iter().filter(|t| Some(**t) != candidate));

    for file_type in order {
        let Some(parser) = parser_for(file_type) else {
            continue;
        };
        match parser.parse(file_name, bytes, encoding) {
            Ok(readings) if !readings.is_empty() => {
                debug!(parser = parser.name(), "Fallback parser accepted {}", file_name);
                return Ok((file_type, readings));
            }
            Ok(_) => debug!(parser = parser.name(), "Fallback parser found no readings"),
            Err(e) => debug!(parser = parser.name(), error = %e, "Fallback parser rejected file"),
        }
    }

    Err(IngestError::Parse(format!("{}: no valid parser found", file_name)))
}

/// Decode with the detected encoding, falling back to the candidate list
pub(crate) fn decode_text(bytes: &[u8], encoding: TextEncoding) -> IngestResult<String> {
    encoding
        .decode(bytes)
        .or_else(|| decode_auto(bytes).map(|(_, text)| text))
        .ok_or_else(|| IngestError::Parse("content is not text".to_string()))
}

const ISO_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];
const DAY_FIRST_FORMATS: [&str; 4] = [
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
];
const MONTH_FIRST_FORMATS: [&str; 2] = ["%m/%d/%Y %H:%M:%S", "%m/%d/%Y %H:%M"];

/// Parse a vendor timestamp; ISO forms first, then slash dates in the given order
pub(crate) fn parse_timestamp(raw: &str, day_first: bool) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    let (preferred, other): (&[&str], &[&str]) = if day_first {
        (&DAY_FIRST_FORMATS[..], &MONTH_FIRST_FORMATS[..])
    } else {
        (&MONTH_FIRST_FORMATS[..], &DAY_FIRST_FORMATS[..])
    };

    ISO_FORMATS
        .iter()
        .chain(preferred)
        .chain(other)
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            ["%Y-%m-%d", if day_first { "%d/%m/%Y" } else { "%m/%d/%Y" }]
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}
