//! Interval (`NEM12`) and accumulation (`NEM13`) meter data files

use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::sync::Arc;
use tracing::warn;

use super::{decode_text, RawReading, RecordParser};
use crate::detect::TextEncoding;
use crate::error::{IngestError, IngestResult};

pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Parse the `Date8`, `DateTime12` and `DateTime14` forms
pub fn parse_nem_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    match raw.len() {
        8 => NaiveDate::parse_from_str(raw, "%Y%m%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0)),
        12 => NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M").ok(),
        14 => NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S").ok(),
        _ => None,
    }
}

/// Number of `200` channel records in a decoded file
pub fn channel_count(text: &str) -> usize {
    text.lines()
        .filter(|line| line.trim_start().starts_with("200,"))
        .count()
}

struct Channel {
    nmi: Arc<str>,
    suffix: Arc<str>,
    unit: Arc<str>,
    interval_minutes: u32,
}

fn field(record: &csv::StringRecord, index: usize) -> &str {
    record.get(index).unwrap_or("").trim()
}

impl Channel {
    fn from_record(record: &csv::StringRecord, line: u64) -> IngestResult<Self> {
        let nmi = field(record, 1);
        let suffix = field(record, 4);
        if nmi.is_empty() || suffix.is_empty() {
            return Err(IngestError::Validation(format!(
                "line {}: 200 record without NMI or suffix",
                line
            )));
        }

        let interval_minutes: u32 = field(record, 8).parse().map_err(|_| {
            IngestError::Validation(format!(
                "line {}: invalid interval length '{}'",
                line,
                field(record, 8)
            ))
        })?;
        if interval_minutes == 0 || MINUTES_PER_DAY % interval_minutes != 0 {
            return Err(IngestError::Validation(format!(
                "line {}: interval length {} does not divide a day",
                line, interval_minutes
            )));
        }

        let unit = match field(record, 7) {
            "" => "kWh",
            unit => unit,
        };

        Ok(Self {
            nmi: Arc::from(nmi),
            suffix: Arc::from(suffix),
            unit: Arc::from(unit),
            interval_minutes,
        })
    }

    fn intervals_per_day(&self) -> usize {
        (MINUTES_PER_DAY / self.interval_minutes) as usize
    }

    fn reading(&self, timestamp: NaiveDateTime, value: String, quality: &str) -> RawReading {
        RawReading {
            meter_id: Arc::clone(&self.nmi),
            channel: Arc::clone(&self.suffix),
            unit: Arc::clone(&self.unit),
            timestamp,
            value,
            quality: (!quality.is_empty()).then(|| quality.to_string()),
        }
    }
}

/// Parser for both NEM variants
///
/// With `split_days`, accumulation reads spanning midnight are divided into
/// per-day readings in proportion to the time spent in each day.
#[derive(Debug, Clone)]
pub struct NemParser {
    pub split_days: bool,
}

impl Default for NemParser {
    fn default() -> Self {
        Self { split_days: true }
    }
}

impl RecordParser for NemParser {
    fn name(&self) -> &'static str {
        "nem"
    }

    fn parse(
        &self,
        file_name: &str,
        bytes: &[u8],
        encoding: TextEncoding,
    ) -> IngestResult<Vec<RawReading>> {
        let text = decode_text(bytes, encoding)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut readings: Vec<RawReading> = Vec::new();
        let mut channel: Option<Channel> = None;
        // Span of `readings` produced by the latest 300 record
        let mut last_day: Option<std::ops::Range<usize>> = None;
        let mut saw_header = false;
        let mut end_records = 0usize;

        for (index, record) in reader.records().enumerate() {
            let line = index as u64 + 1;
            let record = record
                .map_err(|e| IngestError::Parse(format!("{}: line {}: {}", file_name, line, e)))?;
            let indicator = field(&record, 0);
            if indicator.is_empty() {
                continue;
            }

            if !saw_header {
                if indicator != "100" {
                    return Err(IngestError::Parse(format!(
                        "{}: expected 100 header record, found '{}'",
                        file_name, indicator
                    )));
                }
                saw_header = true;
                let version = field(&record, 1);
                if version != "NEM12" && version != "NEM13" {
                    warn!("{}: unexpected version header {}", file_name, version);
                }
                continue;
            }

            match indicator {
                "200" => {
                    channel = Some(Channel::from_record(&record, line)?);
                    last_day = None;
                }
                "300" => {
                    let current = channel.as_ref().ok_or_else(|| {
                        IngestError::Validation(format!(
                            "line {}: 300 record before any 200 record",
                            line
                        ))
                    })?;
                    let start = readings.len();
                    if parse_interval_day(current, &record, line, file_name, &mut readings) {
                        last_day = Some(start..readings.len());
                    }
                }
                "400" => match (&channel, &last_day) {
                    (Some(current), Some(day)) => {
                        apply_event(current, &record, line, file_name, &mut readings[day.clone()])
                    }
                    _ => warn!("{}: line {}: 400 record without interval data", file_name, line),
                },
                "250" => parse_accumulation(&record, line, file_name, self.split_days, &mut readings),
                "900" => {
                    end_records += 1;
                    channel = None;
                    last_day = None;
                }
                _ => {}
            }
        }

        if !saw_header {
            return Err(IngestError::Parse(format!("{}: empty file", file_name)));
        }
        if end_records == 0 {
            warn!("{}: missing end of data (900) record", file_name);
        }
        if readings.is_empty() {
            return Err(IngestError::Validation(format!(
                "{}: no interval or accumulation data",
                file_name
            )));
        }

        Ok(readings)
    }
}

/// Returns false when the row was skipped
fn parse_interval_day(
    channel: &Channel,
    record: &csv::StringRecord,
    line: u64,
    file_name: &str,
    readings: &mut Vec<RawReading>,
) -> bool {
    let intervals = channel.intervals_per_day();
    // indicator, date, values, quality method
    if record.len() < intervals + 3 {
        warn!(
            "{}: line {}: expected {} intervals, got {} values; skipping",
            file_name,
            line,
            intervals,
            record.len().saturating_sub(3)
        );
        return false;
    }

    let Some(day) = parse_nem_datetime(field(record, 1)) else {
        warn!("{}: line {}: invalid date '{}'; skipping", file_name, line, field(record, 1));
        return false;
    };

    let quality = field(record, intervals + 2);
    let step = Duration::minutes(i64::from(channel.interval_minutes));
    readings.extend((0..intervals).map(|i| {
        channel.reading(
            day + step * i as i32,
            field(record, i + 2).to_string(),
            quality,
        )
    }));
    true
}

/// Override quality on a 1-based interval range of the latest day
fn apply_event(
    channel: &Channel,
    record: &csv::StringRecord,
    line: u64,
    file_name: &str,
    day: &mut [RawReading],
) {
    let intervals = channel.intervals_per_day();
    let start: Option<usize> = field(record, 1).parse().ok();
    let end: Option<usize> = field(record, 2).parse().ok();

    match (start, end) {
        (Some(start), Some(end)) if 1 <= start && start <= end && end <= intervals => {
            let quality = field(record, 3);
            for reading in day.iter_mut().take(end).skip(start - 1) {
                reading.quality = (!quality.is_empty()).then(|| quality.to_string());
            }
        }
        _ => warn!(
            "{}: line {}: invalid event range {}..{}",
            file_name,
            line,
            field(record, 1),
            field(record, 2)
        ),
    }
}

fn parse_accumulation(
    record: &csv::StringRecord,
    line: u64,
    file_name: &str,
    split_days: bool,
    readings: &mut Vec<RawReading>,
) {
    let previous = parse_nem_datetime(field(record, 9));
    let current = parse_nem_datetime(field(record, 14));
    let quantity: Option<f64> = field(record, 18).parse().ok();

    let (Some(start), Some(end), Some(quantity)) = (previous, current, quantity) else {
        warn!("{}: line {}: incomplete 250 record; skipping", file_name, line);
        return;
    };

    let channel = Channel {
        nmi: Arc::from(field(record, 1)),
        suffix: Arc::from(field(record, 4)),
        unit: Arc::from(match field(record, 19) {
            "" => "kWh",
            unit => unit,
        }),
        interval_minutes: MINUTES_PER_DAY,
    };
    let quality = field(record, 15);

    if !split_days || end <= start {
        readings.push(channel.reading(start, quantity.to_string(), quality));
        return;
    }

    let total = (end - start).num_seconds() as f64;
    let mut piece_start = start;
    while piece_start < end {
        let next_midnight = (piece_start.date() + Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .unwrap_or(end);
        let piece_end = next_midnight.min(end);
        let share = (piece_end - piece_start).num_seconds() as f64 / total;
        readings.push(channel.reading(piece_start, (quantity * share).to_string(), quality));
        piece_start = piece_end;
    }
}
