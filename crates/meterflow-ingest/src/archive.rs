//! Weekly archive partitions
//!
//! Settled files are moved from the top of the processed, unmapped and
//! parse-error zones into `<zone>archived/<ISO week>/`. Planning is pure:
//! [`plan_week`] and [`plan_migration`] turn a listing into relocations and
//! [`Archiver`] performs them with a bounded worker pool. A source that has
//! already disappeared counts as skipped, since a concurrent run moved it.

use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use meterflow_common::types::{file_name, IsoWeek};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, instrument};

use crate::error::{IngestResult, StorageError};
use crate::storage::{relocate, ObjectMeta, ObjectStore, Zone};

/// Zones whose settled files are archived
pub const ARCHIVE_ZONES: [Zone; 3] = [Zone::Processed, Zone::Unmapped, Zone::ParseError];

/// `<zone>archived/`
pub fn archive_root(zone: Zone) -> String {
    format!("{}archived/", zone.prefix())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relocation {
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocationResult {
    Moved,
    Skipped,
    Errored(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelocationTally {
    pub moved: usize,
    pub skipped: usize,
    pub errored: usize,
    pub errors: Vec<String>,
}

impl RelocationTally {
    pub fn record(&mut self, relocation: &Relocation, result: &RelocationResult) {
        match result {
            RelocationResult::Moved => self.moved += 1,
            RelocationResult::Skipped => self.skipped += 1,
            RelocationResult::Errored(message) => {
                self.errored += 1;
                self.errors.push(format!("{}: {}", relocation.src, message));
            }
        }
    }

    pub fn absorb(&mut self, other: &RelocationTally) {
        self.moved += other.moved;
        self.skipped += other.skipped;
        self.errored += other.errored;
        self.errors.extend(other.errors.iter().cloned());
    }

    pub fn total(&self) -> usize {
        self.moved + self.skipped + self.errored
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    Succeeded,
    PartiallyFailed,
    InvalidTarget,
}

impl ArchiveStatus {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Succeeded => 200,
            Self::PartiallyFailed => 207,
            Self::InvalidTarget => 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    pub status: ArchiveStatus,
    pub week: Option<String>,
    pub tally: RelocationTally,
    pub zones: BTreeMap<String, RelocationTally>,
    pub error: Option<String>,
}

impl ArchiveReport {
    fn invalid(target: &str) -> Self {
        Self {
            status: ArchiveStatus::InvalidTarget,
            week: None,
            tally: RelocationTally::default(),
            zones: BTreeMap::new(),
            error: Some(format!(
                "Invalid target week: {target}. Expected YYYY-Www (e.g., 2026-W01)"
            )),
        }
    }
}

/// Files at the top of `zone` last modified during `week`
///
/// Only direct children count, as with a delimited listing; subfolders,
/// archive partitions included, are left alone.
pub fn plan_week(zone: Zone, objects: &[ObjectMeta], week: IsoWeek) -> Vec<Relocation> {
    let root = archive_root(zone);
    objects
        .iter()
        .filter(|o| {
            o.key
                .strip_prefix(zone.prefix())
                .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
        })
        .filter(|o| o.last_modified.map(IsoWeek::of) == Some(week))
        .map(|o| Relocation {
            src: o.key.clone(),
            dst: format!("{}{}/{}", root, week, file_name(&o.key)),
        })
        .collect()
}

fn compile(pattern: &'static str, cell: &'static OnceLock<Option<Regex>>) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn stamp_pattern() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    compile(r"(?i)_(\d{4})(\d{2})(\d{2})\d{6,10}\.csv$", &CELL)
}

fn iso_date_pattern() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    compile(r"(\d{4})-(\d{2})-(\d{2})", &CELL)
}

fn date_from_captures(pattern: Option<&Regex>, name: &str) -> Option<NaiveDate> {
    let caps = pattern?.captures(name)?;
    let year = caps.get(1)?.as_str().parse().ok()?;
    let month = caps.get(2)?.as_str().parse().ok()?;
    let day = caps.get(3)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Week of the date embedded in a file name, if any
pub fn week_from_file_name(name: &str) -> Option<IsoWeek> {
    date_from_captures(stamp_pattern(), name)
        .or_else(|| date_from_captures(iso_date_pattern(), name))
        .map(IsoWeek::of_date)
}

/// Week for a file in a `YYYY-MM` partition without a usable name date
fn week_from_month(partition: &str) -> Option<IsoWeek> {
    if partition.len() != 7 || partition.as_bytes().get(4) != Some(&b'-') {
        return None;
    }
    let year = partition[..4].parse().ok()?;
    let month = partition[5..].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, 15).map(IsoWeek::of_date)
}

/// Monthly-partition files of `zone` moved into week partitions
pub fn plan_migration(zone: Zone, objects: &[ObjectMeta]) -> Vec<Relocation> {
    let root = archive_root(zone);
    objects
        .iter()
        .filter_map(|o| {
            let rest = o.key.strip_prefix(&root)?;
            let (partition, name) = rest.split_once('/')?;
            if name.is_empty() || name.contains('/') || partition.parse::<IsoWeek>().is_ok() {
                return None;
            }
            let month_week = week_from_month(partition)?;
            let week = week_from_file_name(name).unwrap_or(month_week);
            Some(Relocation {
                src: o.key.clone(),
                dst: format!("{}{}/{}", root, week, name),
            })
        })
        .collect()
}

pub struct Archiver {
    store: Arc<dyn ObjectStore>,
    workers: usize,
}

impl Archiver {
    pub fn new(store: Arc<dyn ObjectStore>, workers: usize) -> Self {
        Self {
            store,
            workers: workers.max(1),
        }
    }

    /// Archive the files of `target` week, or of the week before `now`
    #[instrument(skip(self))]
    pub async fn archive_week(&self, target: Option<&str>, now: DateTime<Utc>) -> ArchiveReport {
        let week = match target {
            Some(raw) => match raw.parse::<IsoWeek>() {
                Ok(week) => week,
                Err(_) => {
                    error!(target_week = raw, "Invalid target week");
                    return ArchiveReport::invalid(raw);
                }
            },
            None => IsoWeek::previous(now),
        };
        info!(target_week = %week, "Starting weekly archive");

        let mut tally = RelocationTally::default();
        let mut zones = BTreeMap::new();
        for zone in ARCHIVE_ZONES {
            let zone_tally = match self.store.list(zone.prefix()).await {
                Ok(objects) => {
                    let plan = plan_week(zone, &objects, week);
                    if !plan.is_empty() {
                        info!(zone = %zone, count = plan.len(), "Found files to archive");
                    }
                    relocate_all(self.store.as_ref(), plan, self.workers, &|_, _| {}).await
                }
                Err(e) => {
                    error!(zone = %zone, error = %e, "Failed to list zone");
                    RelocationTally {
                        errored: 1,
                        errors: vec![format!("{}: {}", zone.prefix(), e)],
                        ..Default::default()
                    }
                }
            };
            info!(
                zone = %zone,
                target_week = %week,
                moved = zone_tally.moved,
                skipped = zone_tally.skipped,
                errored = zone_tally.errored,
                "Archived zone"
            );
            tally.absorb(&zone_tally);
            zones.insert(zone.to_string(), zone_tally);
        }

        let status = if tally.errored > 0 {
            ArchiveStatus::PartiallyFailed
        } else {
            ArchiveStatus::Succeeded
        };
        info!(
            target_week = %week,
            archive_moved = tally.moved,
            archive_skipped = tally.skipped,
            archive_errored = tally.errored,
            status_code = status.status_code(),
            "Weekly archive completed"
        );

        ArchiveReport {
            status,
            week: Some(week.to_string()),
            tally,
            zones,
            error: None,
        }
    }

    /// Move monthly archive partitions into week partitions
    ///
    /// With `dry_run` nothing is touched and every planned move counts as moved.
    pub async fn migrate_archives(
        &self,
        dry_run: bool,
        on_progress: &(dyn Fn(&Relocation, &RelocationResult) + Send + Sync),
    ) -> IngestResult<RelocationTally> {
        let mut plan = Vec::new();
        for zone in ARCHIVE_ZONES {
            let objects = self.store.list(&archive_root(zone)).await?;
            let zone_plan = plan_migration(zone, &objects);
            info!(zone = %zone, count = zone_plan.len(), "Collected files to migrate");
            plan.extend(zone_plan);
        }

        if dry_run {
            let mut tally = RelocationTally::default();
            for relocation in &plan {
                debug!(src = %relocation.src, dst = %relocation.dst, "Would migrate");
                tally.record(relocation, &RelocationResult::Moved);
                on_progress(relocation, &RelocationResult::Moved);
            }
            return Ok(tally);
        }

        Ok(relocate_all(self.store.as_ref(), plan, self.workers, on_progress).await)
    }

    /// Count of migration candidates, for progress display
    pub async fn migration_size(&self) -> IngestResult<usize> {
        let mut total = 0;
        for zone in ARCHIVE_ZONES {
            let objects = self.store.list(&archive_root(zone)).await?;
            total += plan_migration(zone, &objects).len();
        }
        Ok(total)
    }
}

/// Run `plan` on at most `workers` concurrent relocations
///
/// `on_progress` sees every result as it completes.
pub async fn relocate_all(
    store: &dyn ObjectStore,
    plan: Vec<Relocation>,
    workers: usize,
    on_progress: &(dyn Fn(&Relocation, &RelocationResult) + Send + Sync),
) -> RelocationTally {
    let mut results = stream::iter(plan)
        .map(|relocation| async move {
            let result = match relocate(store, &relocation.src, &relocation.dst).await {
                Ok(()) => RelocationResult::Moved,
                Err(StorageError::NotFound(_)) => {
                    debug!(key = %relocation.src, "File no longer exists, skipping");
                    RelocationResult::Skipped
                }
                Err(e) => {
                    error!(key = %relocation.src, dst = %relocation.dst, error = %e, "Failed to relocate file");
                    RelocationResult::Errored(e.to_string())
                }
            };
            (relocation, result)
        })
        .buffer_unordered(workers.max(1));

    let mut tally = RelocationTally::default();
    while let Some((relocation, result)) = results.next().await {
        tally.record(&relocation, &result);
        on_progress(&relocation, &result);
    }
    tally
}
