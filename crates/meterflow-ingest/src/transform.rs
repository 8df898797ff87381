//! Resolution and validation of parsed readings
//!
//! Readings are grouped per meter and the meters are processed concurrently on
//! a bounded pool. Within a meter, each channel stream keeps source order;
//! rows with non-numeric values or timestamps that do not advance are flagged
//! and counted without failing the file.

use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{IngestError, IngestResult};
use crate::parser::RawReading;
use crate::resolve::{is_valid_channel, mapping_key, IdentifierResolver};

/// Why a reading was left out of the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadingFlag {
    NonNumeric,
    DuplicateTimestamp,
    OutOfOrderTimestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReading {
    pub sensor_id: Option<String>,
    pub timestamp: NaiveDateTime,
    pub value: f64,
    pub unit: Arc<str>,
    pub meter_id: Arc<str>,
    pub channel: Arc<str>,
    /// Key of the file the reading came from
    pub source: Arc<str>,
}

/// Reading and monitor point counts for one file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformSummary {
    pub mapped: usize,
    pub unmapped: usize,
    pub flagged: usize,
    pub non_numeric: usize,
    pub duplicate_timestamps: usize,
    pub out_of_order_timestamps: usize,
    /// Readings on channels that are never resolved
    pub ignored: usize,
    pub meters: usize,
    pub monitor_points: usize,
    pub unmapped_points: BTreeSet<String>,
}

impl TransformSummary {
    fn merge(&mut self, other: TransformSummary) {
        self.mapped += other.mapped;
        self.unmapped += other.unmapped;
        self.flagged += other.flagged;
        self.non_numeric += other.non_numeric;
        self.duplicate_timestamps += other.duplicate_timestamps;
        self.out_of_order_timestamps += other.out_of_order_timestamps;
        self.ignored += other.ignored;
        self.meters += other.meters;
        self.monitor_points += other.monitor_points;
        self.unmapped_points.extend(other.unmapped_points);
    }

    fn flag(&mut self, flag: ReadingFlag) {
        self.flagged += 1;
        match flag {
            ReadingFlag::NonNumeric => self.non_numeric += 1,
            ReadingFlag::DuplicateTimestamp => self.duplicate_timestamps += 1,
            ReadingFlag::OutOfOrderTimestamp => self.out_of_order_timestamps += 1,
        }
    }

    /// File-level outcome: only a file with no mapped reading at all fails
    pub fn verdict(&self) -> IngestResult<()> {
        if self.mapped > 0 {
            return Ok(());
        }
        if self.unmapped > 0 || self.ignored > 0 {
            return Err(IngestError::Mapping(format!(
                "{} readings unmapped, {} on unresolvable channels",
                self.unmapped, self.ignored
            )));
        }
        Err(IngestError::Validation(format!(
            "no valid readings ({} flagged)",
            self.flagged
        )))
    }
}

pub struct TransformOutput {
    pub readings: Vec<NormalizedReading>,
    pub summary: TransformSummary,
}

fn parse_value(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

async fn transform_meter(
    readings: Vec<RawReading>,
    resolver: Arc<dyn IdentifierResolver>,
    source: Arc<str>,
) -> IngestResult<(Vec<NormalizedReading>, TransformSummary)> {
    let mut summary = TransformSummary {
        meters: 1,
        ..Default::default()
    };
    let mut out = Vec::with_capacity(readings.len());
    let mut sensors: HashMap<Arc<str>, Option<String>> = HashMap::new();
    let mut last_seen: HashMap<Arc<str>, NaiveDateTime> = HashMap::new();

    for reading in readings {
        if !is_valid_channel(&reading.channel) {
            summary.ignored += 1;
            continue;
        }

        let Some(value) = parse_value(&reading.value) else {
            summary.flag(ReadingFlag::NonNumeric);
            continue;
        };

        match last_seen.get(&reading.channel) {
            Some(last) if reading.timestamp == *last => {
                summary.flag(ReadingFlag::DuplicateTimestamp);
                continue;
            }
            Some(last) if reading.timestamp < *last => {
                summary.flag(ReadingFlag::OutOfOrderTimestamp);
                continue;
            }
            _ => {
                last_seen.insert(Arc::clone(&reading.channel), reading.timestamp);
            }
        }

        if !sensors.contains_key(&reading.channel) {
            let sensor = resolver.resolve(&reading.meter_id, &reading.channel).await?;
            match &sensor {
                Some(_) => summary.monitor_points += 1,
                None => {
                    summary
                        .unmapped_points
                        .insert(mapping_key(&reading.meter_id, &reading.channel));
                }
            }
            sensors.insert(Arc::clone(&reading.channel), sensor);
        }

        let sensor_id = sensors.get(&reading.channel).cloned().flatten();
        match sensor_id {
            Some(_) => summary.mapped += 1,
            None => {
                summary.unmapped += 1;
                continue;
            }
        }

        out.push(NormalizedReading {
            sensor_id,
            timestamp: reading.timestamp,
            value,
            unit: reading.unit,
            meter_id: reading.meter_id,
            channel: reading.channel,
            source: Arc::clone(&source),
        });
    }

    Ok((out, summary))
}

pub struct Transformer {
    workers: usize,
}

impl Transformer {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Resolve and validate `readings` from the file at `source`
    ///
    /// Only resolver failures abort; they are transient by construction.
    #[instrument(skip(self, readings, resolver), fields(readings = readings.len()))]
    pub async fn transform(
        &self,
        source: &str,
        readings: Vec<RawReading>,
        resolver: Arc<dyn IdentifierResolver>,
    ) -> IngestResult<TransformOutput> {
        let mut order: Vec<Arc<str>> = Vec::new();
        let mut by_meter: HashMap<Arc<str>, Vec<RawReading>> = HashMap::new();
        for reading in readings {
            let group = by_meter.entry(Arc::clone(&reading.meter_id)).or_insert_with(|| {
                order.push(Arc::clone(&reading.meter_id));
                Vec::new()
            });
            group.push(reading);
        }

        let source: Arc<str> = Arc::from(source);
        let units = order.into_iter().filter_map(|meter| by_meter.remove(&meter)).map(|group| {
            transform_meter(group, Arc::clone(&resolver), Arc::clone(&source))
        });

        let results: Vec<_> = stream::iter(units)
            .buffer_unordered(self.workers)
            .try_collect()
            .await?;

        let mut summary = TransformSummary::default();
        let mut normalized = Vec::new();
        for (readings, unit_summary) in results {
            normalized.extend(readings);
            summary.merge(unit_summary);
        }

        debug!(
            mapped = summary.mapped,
            unmapped = summary.unmapped,
            flagged = summary.flagged,
            ignored = summary.ignored,
            "Transformed {}",
            source
        );
        Ok(TransformOutput {
            readings: normalized,
            summary,
        })
    }
}
