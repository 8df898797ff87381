//! Vendor CSV exports
//!
//! Each adapter emits channel `E1` (and `B1` for generation) per meter, with
//! meters in sorted order and rows in source order within a meter.

use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{decode_text, parse_timestamp, RawReading, RecordParser};
use crate::detect::TextEncoding;
use crate::error::{IngestError, IngestResult};

const GENERATION_EXPORT_NAME: &str = "OptimaGenerationData";
const COMX_DEVICE: &str = "ComX510_Green_Square";
/// Zero-based line holding the ComX column header
const COMX_HEADER_LINE: usize = 6;

/// Header-indexed view over a CSV body
struct Table {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<csv::StringRecord>,
}

impl Table {
    fn read(text: &str) -> IngestResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(text.as_bytes());

        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| IngestError::Parse(format!("unreadable header: {}", e)))?
            .iter()
            .map(|c| c.trim().to_string())
            .collect();
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();

        let rows = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| IngestError::Parse(format!("unreadable row: {}", e)))?;

        Ok(Self {
            columns,
            index,
            rows,
        })
    }

    fn column(&self, name: &str) -> IngestResult<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| IngestError::Parse(format!("missing column '{}'", name)))
    }

    fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }
}

fn cell(row: &csv::StringRecord, index: usize) -> &str {
    row.get(index).unwrap_or("").trim()
}

fn reject_generation_export(file_name: &str) -> IngestResult<()> {
    if file_name.contains(GENERATION_EXPORT_NAME) {
        return Err(IngestError::Parse("not relevant parser for file".to_string()));
    }
    Ok(())
}

fn no_readings(file_name: &str) -> IngestError {
    IngestError::Parse(format!("{}: no valid data", file_name))
}

/// Accumulates readings per meter so output is grouped and sorted by meter
#[derive(Default)]
struct MeterReadings {
    meters: BTreeMap<String, Vec<RawReading>>,
    names: HashMap<String, Arc<str>>,
    skipped_rows: usize,
}

impl MeterReadings {
    fn interned(&mut self, value: &str) -> Arc<str> {
        self.names
            .entry(value.to_string())
            .or_insert_with(|| Arc::from(value))
            .clone()
    }

    fn push(
        &mut self,
        meter: &str,
        channel: &str,
        unit: &str,
        timestamp: Option<NaiveDateTime>,
        value: &str,
    ) {
        let Some(timestamp) = timestamp else {
            self.skipped_rows += 1;
            return;
        };
        let reading = RawReading {
            meter_id: self.interned(meter),
            channel: self.interned(channel),
            unit: self.interned(unit),
            timestamp,
            value: value.to_string(),
            quality: None,
        };
        self.meters.entry(meter.to_string()).or_default().push(reading);
    }

    fn finish(self, parser: &str, file_name: &str) -> IngestResult<Vec<RawReading>> {
        if self.skipped_rows > 0 {
            debug!(parser, skipped = self.skipped_rows, "Rows without a timestamp skipped");
        }
        let readings: Vec<_> = self.meters.into_values().flatten().collect();
        if readings.is_empty() {
            return Err(no_readings(file_name));
        }
        Ok(readings)
    }
}

/// `Serial_No, Interval_Start, Consumption, Consumption Unit`
pub struct EnviziWaterParser;

impl RecordParser for EnviziWaterParser {
    fn name(&self) -> &'static str {
        "envizi-water"
    }

    fn parse(
        &self,
        file_name: &str,
        bytes: &[u8],
        encoding: TextEncoding,
    ) -> IngestResult<Vec<RawReading>> {
        reject_generation_export(file_name)?;
        let table = Table::read(&decode_text(bytes, encoding)?)?;
        let serial = table.column("Serial_No")?;
        let start = table.column("Interval_Start")?;
        let consumption = table.column("Consumption")?;
        let unit_column = table.column("Consumption Unit")?;

        // One unit per meter: the first one seen
        let mut units: HashMap<String, String> = HashMap::new();
        let mut out = MeterReadings::default();
        for row in &table.rows {
            let meter = format!("Envizi_{}", cell(row, serial));
            let unit = units
                .entry(meter.clone())
                .or_insert_with(|| cell(row, unit_column).to_string())
                .clone();
            if unit != cell(row, unit_column) {
                warn!(meter = %meter, "Multiple consumption units for one meter");
            }
            out.push(
                &meter,
                "E1",
                &unit,
                parse_timestamp(cell(row, start), false),
                cell(row, consumption),
            );
        }
        out.finish(self.name(), file_name)
    }
}

/// `Serial_No, Date_Time, kL`
pub struct EnviziBulkWaterParser;

impl RecordParser for EnviziBulkWaterParser {
    fn name(&self) -> &'static str {
        "envizi-water-bulk"
    }

    fn parse(
        &self,
        file_name: &str,
        bytes: &[u8],
        encoding: TextEncoding,
    ) -> IngestResult<Vec<RawReading>> {
        reject_generation_export(file_name)?;
        let table = Table::read(&decode_text(bytes, encoding)?)?;
        let serial = table.column("Serial_No")?;
        let time = table.column("Date_Time")?;
        let volume = table.column("kL")?;

        let mut out = MeterReadings::default();
        for row in &table.rows {
            out.push(
                &format!("Envizi_{}", cell(row, serial)),
                "E1",
                "kL",
                parse_timestamp(cell(row, time), false),
                cell(row, volume),
            );
        }
        out.finish(self.name(), file_name)
    }
}

/// `Serial_No, Interval_Start, kWh`
pub struct EnviziElectricityParser;

impl RecordParser for EnviziElectricityParser {
    fn name(&self) -> &'static str {
        "envizi-electricity"
    }

    fn parse(
        &self,
        file_name: &str,
        bytes: &[u8],
        encoding: TextEncoding,
    ) -> IngestResult<Vec<RawReading>> {
        reject_generation_export(file_name)?;
        let table = Table::read(&decode_text(bytes, encoding)?)?;
        let serial = table.column("Serial_No")?;
        let start = table.column("Interval_Start")?;
        let energy = table.column("kWh")?;

        let mut out = MeterReadings::default();
        for row in &table.rows {
            out.push(
                &format!("Envizi_{}", cell(row, serial)),
                "E1",
                "kWh",
                parse_timestamp(cell(row, start), false),
                cell(row, energy),
            );
        }
        out.finish(self.name(), file_name)
    }
}

/// RACV electricity report: two preamble rows, then one kWh column per meter
///
/// Days on which a meter's total is zero are dropped.
pub struct RacvParser;

impl RecordParser for RacvParser {
    fn name(&self) -> &'static str {
        "racv-electricity"
    }

    fn parse(
        &self,
        file_name: &str,
        bytes: &[u8],
        encoding: TextEncoding,
    ) -> IngestResult<Vec<RawReading>> {
        reject_generation_export(file_name)?;
        let text = decode_text(bytes, encoding)?;
        let body: String = text.lines().skip(2).collect::<Vec<_>>().join("\n");
        let table = Table::read(&body)?;
        let date = table.column("Date")?;
        let start = table.column("Start Time")?;

        let meter_columns: Vec<(usize, &String)> = table
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.contains("kWh"))
            .collect();

        let timestamps: Vec<Option<NaiveDateTime>> = table
            .rows
            .iter()
            .map(|row| {
                parse_timestamp(&format!("{} {}", cell(row, date), cell(row, start)), true)
            })
            .collect();

        let mut out = MeterReadings::default();
        for (column, name) in meter_columns {
            let meter = format!("Optima_{}", name.split(' ').next().unwrap_or(name));

            let mut daily: BTreeMap<chrono::NaiveDate, f64> = BTreeMap::new();
            for (row, ts) in table.rows.iter().zip(&timestamps) {
                if let (Some(ts), Ok(value)) = (ts, cell(row, column).parse::<f64>()) {
                    *daily.entry(ts.date()).or_default() += value;
                }
            }

            for (row, ts) in table.rows.iter().zip(&timestamps) {
                let active_day = ts
                    .map(|ts| daily.get(&ts.date()).is_some_and(|total| *total != 0.0))
                    .unwrap_or(false);
                if active_day {
                    out.push(&meter, "E1", "kWh", *ts, cell(row, column));
                }
            }
        }
        out.finish(self.name(), file_name)
    }
}

/// Optima interval export: `Identifier, Date, Start Time, Usage?, Generation?`
pub struct OptimaParser;

impl RecordParser for OptimaParser {
    fn name(&self) -> &'static str {
        "optima-interval"
    }

    fn parse(
        &self,
        file_name: &str,
        bytes: &[u8],
        encoding: TextEncoding,
    ) -> IngestResult<Vec<RawReading>> {
        let table = Table::read(&decode_text(bytes, encoding)?)?;
        let identifier = table.column("Identifier")?;
        let date = table.column("Date")?;
        let start = table.column("Start Time")?;

        let mut channels: Vec<(&str, usize)> = Vec::new();
        if table.has("Usage") {
            channels.push(("E1", table.column("Usage")?));
        }
        if table.has("Generation") {
            channels.push(("B1", table.column("Generation")?));
        }
        if channels.is_empty() {
            return Err(IngestError::Parse("no Usage or Generation column".to_string()));
        }

        let mut out = MeterReadings::default();
        for row in &table.rows {
            let meter = format!("Optima_{}", cell(row, identifier));
            let ts = parse_timestamp(&format!("{} {}", cell(row, date), cell(row, start)), true);
            for (channel, column) in &channels {
                out.push(&meter, channel, "kWh", ts, cell(row, *column));
            }
        }
        out.finish(self.name(), file_name)
    }
}

/// Schneider ComX private-wire export
pub struct ComxParser;

impl RecordParser for ComxParser {
    fn name(&self) -> &'static str {
        "comx-private-wire"
    }

    fn parse(
        &self,
        file_name: &str,
        bytes: &[u8],
        encoding: TextEncoding,
    ) -> IngestResult<Vec<RawReading>> {
        let text = decode_text(bytes, encoding)?;
        let lines: Vec<&str> = text.lines().collect();

        let banner = lines
            .get(1)
            .map(|line| Table::read(&format!("{}\n", line)))
            .transpose()?
            .map(|t| t.columns)
            .unwrap_or_default();
        if banner.first().map(String::as_str) != Some(COMX_DEVICE) {
            return Err(IngestError::Parse("not relevant parser for file".to_string()));
        }
        let site = banner.get(4).map(|s| s.replace(' ', "")).unwrap_or_default();
        let meter = format!("GPWComX_{}", site);

        let body = lines
            .get(COMX_HEADER_LINE..)
            .map(|rest| rest.join("\n"))
            .ok_or_else(|| no_readings(file_name))?;
        let table = Table::read(&body)?;
        let timestamp = table.column("Local Time Stamp")?;

        let (energy, scale) = if table.has("Active energy (Wh)") {
            (table.column("Active energy (Wh)")?, 1000.0)
        } else if table.has("Active energy (kWh)") {
            (table.column("Active energy (kWh)")?, 1.0)
        } else {
            return Err(IngestError::Parse("missing Active energy column".to_string()));
        };

        let mut out = MeterReadings::default();
        for row in &table.rows {
            let raw = cell(row, energy);
            let ts = parse_timestamp(cell(row, timestamp), true);
            if ts.is_none() && raw.is_empty() {
                continue;
            }
            // Non-numeric values pass through and are flagged downstream
            let value = match raw.parse::<f64>() {
                Ok(v) => (v / scale).to_string(),
                Err(_) => raw.to_string(),
            };
            out.push(&meter, "E1", "kWh", ts, &value);
        }
        out.finish(self.name(), file_name)
    }
}
