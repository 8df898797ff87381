//! Operator commands outside the event-driven path

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::archive::{relocate_all, Relocation, RelocationResult, RelocationTally};
use crate::batch::BatchWriter;
use crate::detect::TypeDetector;
use crate::orchestrator::parse_file;
use crate::resolve::IdentifierResolver;
use crate::storage::{ObjectStore, Zone};
use crate::transform::Transformer;

/// Outcome of processing one local file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalSummary {
    pub file_type: String,
    pub meters_total: usize,
    pub meters_mapped: usize,
    pub meters_unmapped: usize,
    pub monitor_points: usize,
    pub readings: usize,
    pub flagged: usize,
    pub unmapped_points: Vec<String>,
    pub artifact: Option<String>,
}

impl LocalSummary {
    pub fn print(&self) {
        println!("{}", "=".repeat(60));
        println!("Processing Summary");
        println!("{}", "=".repeat(60));
        println!("File type:            {}", self.file_type);
        println!("Total meters:         {}", self.meters_total);
        println!("Mapped meters:        {}", self.meters_mapped);
        println!("Unmapped meters:      {}", self.meters_unmapped);
        println!("Monitor points:       {}", self.monitor_points);
        println!("Total readings:       {}", self.readings);
        println!("Flagged readings:     {}", self.flagged);
        match &self.artifact {
            Some(key) => println!("Artifact:             {}", key),
            None => println!("Artifact:             (not written)"),
        }
        if !self.unmapped_points.is_empty() {
            println!("\nUnmapped monitor points ({} total):", self.unmapped_points.len());
            for point in self.unmapped_points.iter().take(10) {
                println!("  - {}", point);
            }
            if self.unmapped_points.len() > 10 {
                println!("  ... and {} more", self.unmapped_points.len() - 10);
            }
        }
        println!("{}", "=".repeat(60));
    }
}

/// Parse, resolve and (with a writer) publish one file from local disk
///
/// `writer` is `None` for dry runs.
#[instrument(skip(resolver, writer))]
pub async fn process_local(
    path: &Path,
    resolver: Arc<dyn IdentifierResolver>,
    writer: Option<&mut BatchWriter>,
    workers: usize,
) -> Result<LocalSummary> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let detection = TypeDetector::default().detect(&name, &bytes);
    info!(file_type = %detection.file_type, confidence = detection.confidence, "Detected {}", name);

    if detection.file_type.is_document() {
        warn!("{} is a document without readings", name);
        return Ok(LocalSummary {
            file_type: detection.file_type.to_string(),
            ..Default::default()
        });
    }

    let readings = {
        let name = name.clone();
        let detection = detection.clone();
        tokio::task::spawn_blocking(move || parse_file(&detection, &name, &bytes))
            .await
            .context("Parser task panicked")??
    };

    let output = Transformer::new(workers)
        .transform(&path.display().to_string(), readings, resolver)
        .await?;
    let summary = &output.summary;

    let unmapped_meters: BTreeSet<&str> = summary
        .unmapped_points
        .iter()
        .map(|point| point.rsplit_once('-').map_or(point.as_str(), |(meter, _)| meter))
        .collect();

    let mut local = LocalSummary {
        file_type: detection.file_type.to_string(),
        meters_total: summary.meters,
        meters_mapped: summary.meters.saturating_sub(unmapped_meters.len()),
        meters_unmapped: unmapped_meters.len(),
        monitor_points: summary.monitor_points,
        readings: output.readings.len(),
        flagged: summary.flagged,
        unmapped_points: summary.unmapped_points.iter().cloned().collect(),
        artifact: None,
    };

    if let Some(writer) = writer {
        if !output.readings.is_empty() {
            let origin = meterflow_common::types::ObjectLocation::new("local", name);
            writer.add(output.readings, origin);
            local.artifact = writer.flush().await?.map(|artifact| artifact.key);
        }
    }

    Ok(local)
}

/// Selection of error-zone files to send back to landing
#[derive(Debug, Clone)]
pub struct ReprocessFilter {
    pub project: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub zones: Vec<Zone>,
}

impl ReprocessFilter {
    pub fn new(project: impl Into<String>, start: NaiveDate, end: NaiveDate, zone: Option<Zone>) -> Result<Self> {
        if end < start {
            anyhow::bail!("End date {} is before start date {}", end, start);
        }
        let zones = match zone {
            Some(zone) if !zone.is_error_zone() => {
                anyhow::bail!("{} is not an error zone", zone)
            }
            Some(zone) => vec![zone],
            None => vec![
                Zone::ParseError,
                Zone::Unmapped,
                Zone::Invalid,
                Zone::Quarantine,
                Zone::ManualReview,
            ],
        };
        Ok(Self {
            project: project.into(),
            start,
            end,
            zones,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReprocessReport {
    pub planned: Vec<Relocation>,
    pub tally: RelocationTally,
    pub dry_run: bool,
}

/// Move matching error-zone files back to `landing/`
#[instrument(skip(store, filter), fields(project = %filter.project))]
pub async fn reprocess(
    store: &dyn ObjectStore,
    filter: &ReprocessFilter,
    dry_run: bool,
    workers: usize,
) -> Result<ReprocessReport> {
    let project = filter.project.to_lowercase();
    let mut planned = Vec::new();

    for zone in &filter.zones {
        let objects = store
            .list(zone.prefix())
            .await
            .with_context(|| format!("Failed to list {}", zone.prefix()))?;

        for object in objects {
            let Some(rest) = object.key.strip_prefix(zone.prefix()) else {
                continue;
            };
            // Archived partitions stay where they are
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            if !rest.to_lowercase().contains(&project) {
                continue;
            }
            let Some(modified) = object.last_modified.map(|t| t.date_naive()) else {
                continue;
            };
            if modified < filter.start || modified > filter.end {
                continue;
            }
            planned.push(Relocation {
                dst: Zone::Landing.destination(&object.key),
                src: object.key,
            });
        }
    }

    info!(files = planned.len(), dry_run, "Selected files for reprocessing");
    if dry_run {
        for relocation in &planned {
            info!(src = %relocation.src, dst = %relocation.dst, "Would reprocess");
        }
        return Ok(ReprocessReport {
            planned,
            tally: RelocationTally::default(),
            dry_run,
        });
    }

    let tally = relocate_all(store, planned.clone(), workers, &|relocation, result| {
        if let RelocationResult::Moved = result {
            info!(src = %relocation.src, "Returned to landing");
        }
    })
    .await;

    Ok(ReprocessReport {
        planned,
        tally,
        dry_run,
    })
}
