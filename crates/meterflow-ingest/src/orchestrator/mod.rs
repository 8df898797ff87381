//! Pipeline runner
//!
//! [`Pipeline::run_invocation`] takes the stable file set of one trigger,
//! claims it through the [`IdempotencyGuard`] and drives every file through
//! its [`Machine`]. Each file also has its own processing record holding the
//! persisted [`PipelineState`], so a crashed attempt resumes instead of
//! restarting, and split chunks can be registered before they arrive.

use futures::FutureExt;
use meterflow_common::types::ObjectLocation;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::batch::BatchWriter;
use crate::config::IngestConfig;
use crate::detect::{FileType, FileTypeResult, TextEncoding, TypeDetector, DETECTION_HEAD_BYTES};
use crate::error::{FailureContext, FailureKind, IngestError, IngestResult};
use crate::idempotency::{
    file_fingerprint, set_fingerprint, Admission, IdempotencyGuard, ProcessingRecord,
    ProcessingStatus, ProcessingStore,
};
use crate::parser::{nem, parse_with_fallback, parser_for, RawReading};
use crate::resolve::IdentifierResolver;
use crate::retry::{with_backoff, RetryPolicy};
use crate::split::{FileSplitter, SplitOutcome};
use crate::stability::{StabilityChecker, StabilityVerdict};
use crate::storage::{relocate, ObjectMeta, ObjectStore};
use crate::transform::{NormalizedReading, TransformSummary, Transformer};

pub mod state;

pub use state::{Effect, Event, Machine, Outcome, PipelineState, Settlement, Stage};

/// A file handed to the pipeline
#[derive(Debug, Clone)]
pub struct FileInput {
    pub location: ObjectLocation,
    /// Metadata of an observation already known to be stable
    pub observed: Option<ObjectMeta>,
}

impl FileInput {
    /// A file whose stability still has to be checked
    pub fn new(location: ObjectLocation) -> Self {
        Self {
            location,
            observed: None,
        }
    }

    pub fn stable(location: ObjectLocation, meta: ObjectMeta) -> Self {
        Self {
            location,
            observed: Some(meta),
        }
    }
}

/// Where a file ended up after an invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    Ingested {
        summary: TransformSummary,
        artifact: String,
    },
    Delegated {
        chunks: Vec<String>,
    },
    Forwarded,
    Failed {
        kind: FailureKind,
        stage: Stage,
        message: String,
    },
    /// Not finished in this invocation; the trigger should be delivered again
    Deferred {
        reason: String,
    },
    AlreadyProcessed,
    Vanished,
}

impl Disposition {
    fn from_state(state: &PipelineState) -> Self {
        match state {
            PipelineState::Completed { outcome } => match outcome {
                Outcome::Ingested { summary, artifact } => Self::Ingested {
                    summary: summary.clone(),
                    artifact: artifact.clone(),
                },
                Outcome::Delegated { chunks } => Self::Delegated {
                    chunks: chunks.clone(),
                },
                Outcome::Forwarded => Self::Forwarded,
            },
            PipelineState::Failed { failure } => Self::Failed {
                kind: failure.kind,
                stage: failure.stage,
                message: failure.message.clone(),
            },
            other => Self::Deferred {
                reason: format!("stopped at {}", other.stage()),
            },
        }
    }

    fn deferred(reason: impl Into<String>) -> Self {
        Self::Deferred {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    pub location: ObjectLocation,
    #[serde(flatten)]
    pub disposition: Disposition,
}

/// Operational counters for one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvocationCounters {
    pub valid_files: usize,
    pub parse_error_files: usize,
    pub invalid_files: usize,
    pub unmapped_files: usize,
    pub quarantined_files: usize,
    pub manual_review_files: usize,
    pub delegated_files: usize,
    pub deferred_files: usize,
    pub monitor_points_processed: usize,
    pub monitor_points_total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationReport {
    pub fingerprint: String,
    pub files: Vec<FileReport>,
    pub artifacts: Vec<String>,
    /// Served from a previous attempt without doing any work
    #[serde(default)]
    pub cached: bool,
}

impl InvocationReport {
    fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            files: Vec::new(),
            artifacts: Vec::new(),
            cached: false,
        }
    }

    /// Any file-level failure other than an unmapped file
    pub fn has_failures(&self) -> bool {
        self.files.iter().any(|f| {
            matches!(&f.disposition, Disposition::Failed { kind, .. } if *kind != FailureKind::Mapping)
        })
    }

    pub fn exit_code(&self) -> i32 {
        i32::from(self.has_failures())
    }

    /// Files that must be delivered again
    pub fn retry_locations(&self) -> Vec<&ObjectLocation> {
        self.files
            .iter()
            .filter(|f| match &f.disposition {
                Disposition::Deferred { .. } => true,
                Disposition::Failed { kind, .. } => kind.is_retryable(),
                _ => false,
            })
            .map(|f| &f.location)
            .collect()
    }

    pub fn counters(&self) -> InvocationCounters {
        let mut counters = InvocationCounters::default();
        for file in &self.files {
            match &file.disposition {
                Disposition::Ingested { summary, .. } => {
                    counters.valid_files += 1;
                    counters.monitor_points_processed += summary.monitor_points;
                    counters.monitor_points_total +=
                        summary.monitor_points + summary.unmapped_points.len();
                }
                Disposition::Delegated { .. } => counters.delegated_files += 1,
                Disposition::Failed { kind, .. } => match kind {
                    FailureKind::Parse => counters.parse_error_files += 1,
                    FailureKind::Validation => counters.invalid_files += 1,
                    FailureKind::Mapping => counters.unmapped_files += 1,
                    FailureKind::Quarantine => counters.quarantined_files += 1,
                    FailureKind::Unclassified => counters.manual_review_files += 1,
                    FailureKind::Transient => counters.deferred_files += 1,
                },
                Disposition::Deferred { .. } => counters.deferred_files += 1,
                Disposition::Forwarded | Disposition::AlreadyProcessed | Disposition::Vanished => {}
            }
        }
        counters
    }

    fn log_counters(&self) {
        let c = self.counters();
        info!(
            fingerprint = %self.fingerprint,
            cached = self.cached,
            valid_processed_files = c.valid_files,
            parse_error_files = c.parse_error_files,
            invalid_files = c.invalid_files,
            unmapped_files = c.unmapped_files,
            quarantined_files = c.quarantined_files,
            manual_review_files = c.manual_review_files,
            delegated_files = c.delegated_files,
            deferred_files = c.deferred_files,
            monitor_points_processed = c.monitor_points_processed,
            monitor_points_total = c.monitor_points_total,
            artifacts = self.artifacts.len(),
            "Invocation finished"
        );
    }
}

/// Why a file stopped before reaching a terminal state
#[derive(Debug)]
enum Halt {
    Deadline,
    Superseded,
    Vanished,
    Store(IngestError),
}

impl Halt {
    fn disposition(self) -> Disposition {
        match self {
            Self::Deadline => Disposition::deferred("invocation budget exhausted"),
            Self::Superseded => Disposition::deferred("taken over by another attempt"),
            Self::Vanished => Disposition::Vanished,
            Self::Store(e) => Disposition::deferred(format!("processing store unavailable: {e}")),
        }
    }
}

/// One file claimed by this invocation
struct FileRun {
    location: ObjectLocation,
    meta: ObjectMeta,
    verified: bool,
    fingerprint: String,
    record: ProcessingRecord,
    machine: Machine,
    state: PipelineState,
    bytes: Option<Arc<Vec<u8>>>,
    readings: Vec<NormalizedReading>,
}

/// Per-invocation state shared by all files
struct Invocation {
    batch: BatchWriter,
    resolver: Arc<dyn IdentifierResolver>,
    cancel: CancellationToken,
    deadline: Instant,
    artifacts: Vec<String>,
}

impl Invocation {
    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }
}

pub struct Pipeline {
    config: IngestConfig,
    store: Arc<dyn ObjectStore>,
    sink: Arc<dyn ObjectStore>,
    guard: IdempotencyGuard,
    detector: TypeDetector,
    checker: StabilityChecker,
    splitter: FileSplitter,
    transformer: Transformer,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        config: IngestConfig,
        store: Arc<dyn ObjectStore>,
        sink: Arc<dyn ObjectStore>,
        processing: Arc<dyn ProcessingStore>,
    ) -> Self {
        let guard = IdempotencyGuard::new(
            processing,
            std::time::Duration::from_secs(config.idempotency_ttl_secs),
            std::time::Duration::from_secs(config.processing_lease_secs),
        );
        let checker = StabilityChecker::new(
            Arc::clone(&store),
            config.stability_poll_interval(),
            config.stability_max_retries,
        );
        let splitter = FileSplitter::new(
            Arc::clone(&store),
            config.split_policy(),
            config.processing_workers,
        );

        Self {
            detector: TypeDetector::new(config.detection_threshold),
            transformer: Transformer::new(config.processing_workers),
            retry: config.retry_policy(),
            guard,
            checker,
            splitter,
            store,
            sink,
            config,
        }
    }

    pub fn with_detector(mut self, detector: TypeDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    pub fn stability(&self) -> &StabilityChecker {
        &self.checker
    }

    /// Process one trigger's file set
    ///
    /// Redelivery of a set that already finished returns the stored report
    /// with `cached` set. Files the invocation could not finish are reported
    /// as [`Disposition::Deferred`] and left where they are.
    #[instrument(skip_all, fields(files = files.len()))]
    pub async fn run_invocation(
        &self,
        files: Vec<FileInput>,
        resolver: Arc<dyn IdentifierResolver>,
        cancel: CancellationToken,
    ) -> IngestResult<InvocationReport> {
        let deadline = Instant::now() + self.config.invocation_budget();

        let mut early: Vec<FileReport> = Vec::new();
        let mut claimed: Vec<(FileInput, ObjectMeta, String)> = Vec::new();
        for input in files {
            let (meta, verified) = match input.observed.clone() {
                Some(meta) => (meta, true),
                None => match self.head(&input.location.key).await {
                    Ok(Some(meta)) => (meta, false),
                    Ok(None) => {
                        warn!(location = %input.location, "File vanished before processing");
                        early.push(FileReport {
                            location: input.location,
                            disposition: Disposition::Vanished,
                        });
                        continue;
                    }
                    Err(e) => {
                        early.push(FileReport {
                            location: input.location,
                            disposition: Disposition::deferred(e.to_string()),
                        });
                        continue;
                    }
                },
            };
            let fingerprint = file_fingerprint(&input.location, meta.etag.as_deref());
            let input = FileInput {
                observed: verified.then(|| meta.clone()),
                ..input
            };
            claimed.push((input, meta, fingerprint));
        }

        let set = set_fingerprint(claimed.iter().map(|(_, _, fp)| fp.clone()));
        let mut report = InvocationReport::new(&set);
        report.files = early;
        if claimed.is_empty() {
            report.log_counters();
            return Ok(report);
        }

        let locations: Vec<ObjectLocation> = claimed.iter().map(|(i, _, _)| i.location.clone()).collect();
        let mut set_record = match self.guard.begin(&set, locations).await? {
            Admission::Proceed(record) => record,
            Admission::Cached(record) => {
                info!(fingerprint = %set, "File set already processed; returning cached result");
                let mut cached = record
                    .result
                    .and_then(|value| serde_json::from_value::<InvocationReport>(value).ok())
                    .unwrap_or_else(|| {
                        let mut r = InvocationReport::new(&set);
                        r.files = claimed
                            .iter()
                            .map(|(i, _, _)| FileReport {
                                location: i.location.clone(),
                                disposition: Disposition::AlreadyProcessed,
                            })
                            .collect();
                        r
                    });
                cached.cached = true;
                cached.log_counters();
                return Ok(cached);
            }
            Admission::InFlight(_) => {
                info!(fingerprint = %set, "File set is being processed by another attempt");
                for (input, _, _) in claimed {
                    report.files.push(FileReport {
                        location: input.location,
                        disposition: Disposition::deferred("file set in flight"),
                    });
                }
                return Ok(report);
            }
        };

        let mut inv = Invocation {
            batch: BatchWriter::new(
                Arc::clone(&self.sink),
                self.config.sink_prefix.clone(),
                self.config.batch_threshold,
            )
            .with_retry_policy(self.retry),
            resolver,
            cancel,
            deadline,
            artifacts: Vec::new(),
        };
        let mut waiting: Vec<FileRun> = Vec::new();

        for (input, meta, fingerprint) in claimed {
            if inv.should_stop() {
                report.files.push(FileReport {
                    location: input.location,
                    disposition: Halt::Deadline.disposition(),
                });
                continue;
            }

            let mut run = match self.open(input, meta, fingerprint).await {
                Ok(run) => run,
                Err(file_report) => {
                    report.files.push(file_report);
                    continue;
                }
            };

            let (state, effects) = run.machine.resume(run.state.clone());
            let resumed = state != run.state || run.record.state.is_none();
            run.state = state;
            let result = if resumed {
                match self.persist(&mut run).await {
                    Ok(()) => self.drive(&mut run, effects, &mut inv).await,
                    Err(halt) => Err(halt),
                }
            } else {
                self.drive(&mut run, effects, &mut inv).await
            };

            match result {
                Ok(()) if matches!(run.state, PipelineState::BatchWriting { .. }) => waiting.push(run),
                outcome => {
                    let file_report = self.settle(&mut run, outcome).await;
                    report.files.push(file_report);
                }
            }

            if inv.batch.is_due() {
                self.flush(&mut inv, &mut waiting, &mut report.files).await;
            }
        }

        // Normal shutdown flush, also when the budget ran out
        self.flush(&mut inv, &mut waiting, &mut report.files).await;
        report.artifacts = std::mem::take(&mut inv.artifacts);

        let unfinished = report.retry_locations().len();
        set_record.result = serde_json::to_value(&report).ok();
        if unfinished == 0 {
            set_record.status = ProcessingStatus::Completed;
        } else {
            set_record.status = ProcessingStatus::Failed;
            set_record.error = Some(FailureContext::new(
                FailureKind::Transient,
                set_record
                    .locations
                    .first()
                    .cloned()
                    .unwrap_or_else(|| ObjectLocation::new(self.store.bucket(), "")),
                Stage::Processing,
                format!("{unfinished} files left unfinished"),
            ));
        }
        match self.guard.update(&mut set_record).await {
            Ok(true) => {}
            Ok(false) => warn!(fingerprint = %set, "File set record was taken over before completion"),
            Err(e) => warn!(fingerprint = %set, error = %e, "Failed to record file set result"),
        }

        report.log_counters();
        Ok(report)
    }

    /// Claim a single file's record
    async fn open(
        &self,
        input: FileInput,
        meta: ObjectMeta,
        fingerprint: String,
    ) -> Result<FileRun, FileReport> {
        let location = input.location;
        let admission = match self.guard.begin(&fingerprint, vec![location.clone()]).await {
            Ok(admission) => admission,
            Err(e) => {
                return Err(FileReport {
                    location,
                    disposition: Halt::Store(e).disposition(),
                })
            }
        };

        let record = match admission {
            Admission::Proceed(record) => record,
            Admission::Cached(_) => {
                debug!(location = %location, "File already processed");
                return Err(FileReport {
                    location,
                    disposition: Disposition::AlreadyProcessed,
                });
            }
            Admission::InFlight(_) => {
                return Err(FileReport {
                    location,
                    disposition: Disposition::deferred("file in flight"),
                })
            }
        };

        let state = record.state.clone().unwrap_or(PipelineState::Received);
        if state != PipelineState::Received {
            info!(location = %location, stage = %state.stage(), "Resuming file");
        }

        Ok(FileRun {
            machine: Machine::new(location.clone(), self.config.split_policy()),
            verified: input.observed.is_some(),
            location,
            meta,
            fingerprint,
            record,
            state,
            bytes: None,
            readings: Vec::new(),
        })
    }

    /// Report a file, handing its record back when the invocation stopped early
    async fn settle(&self, run: &mut FileRun, outcome: Result<(), Halt>) -> FileReport {
        if matches!(outcome, Err(Halt::Deadline)) {
            match self.guard.release(&mut run.record).await {
                Ok(true) => debug!(
                    location = %run.location,
                    stage = %run.state.stage(),
                    "Released processing record for the next delivery"
                ),
                Ok(false) => warn!(location = %run.location, "Processing record taken over before release"),
                Err(e) => warn!(location = %run.location, error = %e, "Failed to release processing record"),
            }
        }
        Self::file_report(run, outcome)
    }

    fn file_report(run: &FileRun, outcome: Result<(), Halt>) -> FileReport {
        let disposition = match outcome {
            Ok(()) => Disposition::from_state(&run.state),
            Err(halt) => halt.disposition(),
        };
        FileReport {
            location: run.location.clone(),
            disposition,
        }
    }

    /// Perform effects until the file is terminal or waits for a flush
    async fn drive(
        &self,
        run: &mut FileRun,
        effects: Vec<Effect>,
        inv: &mut Invocation,
    ) -> Result<(), Halt> {
        let mut pending: VecDeque<Effect> = effects.into();
        while let Some(effect) = pending.pop_front() {
            if inv.should_stop() {
                warn!(location = %run.location, stage = %run.state.stage(), "Stopping file early");
                return Err(Halt::Deadline);
            }

            let Some(event) = self.perform(run, effect, inv).await? else {
                continue;
            };
            let (next, effects) = run.machine.step(run.state.clone(), event);
            run.state = next;
            self.persist(run).await?;
            pending.extend(effects);
        }
        Ok(())
    }

    async fn persist(&self, run: &mut FileRun) -> Result<(), Halt> {
        run.record.state = Some(run.state.clone());
        run.record.status = match &run.state {
            PipelineState::Received => ProcessingStatus::Received,
            PipelineState::Stabilizing => ProcessingStatus::Stabilizing,
            PipelineState::Completed { outcome } => {
                run.record.result = serde_json::to_value(outcome).ok();
                ProcessingStatus::Completed
            }
            PipelineState::Failed { failure } => {
                run.record.error = Some(failure.clone());
                ProcessingStatus::Failed
            }
            _ => ProcessingStatus::Processing,
        };

        match self.guard.update(&mut run.record).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(location = %run.location, "Lost ownership of processing record");
                Err(Halt::Superseded)
            }
            Err(e) => Err(Halt::Store(e)),
        }
    }

    async fn perform(
        &self,
        run: &mut FileRun,
        effect: Effect,
        inv: &mut Invocation,
    ) -> Result<Option<Event>, Halt> {
        let event = match effect {
            Effect::Alert(failure) => {
                failure.raise_alert();
                return Ok(None);
            }
            Effect::Buffer => {
                let readings = std::mem::take(&mut run.readings);
                inv.batch.add(readings, run.location.clone());
                return Ok(None);
            }
            Effect::CheckStability => self.check_stability(run).await,
            Effect::Detect => self.detect(run).await,
            Effect::Split(detection) => self.split(run, &detection).await,
            Effect::Process(detection) => self.process(run, &detection, inv).await,
            Effect::Relocate(zone) => {
                let destination = zone.destination(&run.location.key);
                let store = self.store.as_ref();
                let (src, dst) = (run.location.key.as_str(), destination.as_str());
                let moved = with_backoff(&self.retry, "relocate", move || async move {
                    Ok::<_, IngestError>(relocate(store, src, dst).await?)
                })
                .await;
                match moved {
                    Ok(()) => {
                        info!(from = %run.location, to = %destination, "Relocated file");
                        Ok(Event::Relocated)
                    }
                    Err(e) if e.is_not_found() => {
                        debug!(location = %run.location, "Source already moved");
                        Ok(Event::Relocated)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match event {
            Ok(event) => Ok(Some(event)),
            Err(e) if e.is_not_found() => {
                warn!(location = %run.location, "File vanished during processing");
                Err(Halt::Vanished)
            }
            Err(e) => Ok(Some(Event::Failed {
                kind: e.kind(),
                message: e.to_string(),
            })),
        }
    }

    async fn check_stability(&self, run: &mut FileRun) -> IngestResult<Event> {
        if run.verified {
            return Ok(Event::Stable);
        }
        let (verdict, meta) = self.checker.check(&run.location.key).await?;
        run.meta = meta;
        Ok(match verdict {
            StabilityVerdict::Stable => Event::Stable,
            _ => Event::Quarantined {
                retries: self.config.stability_max_retries,
            },
        })
    }

    async fn detect(&self, run: &mut FileRun) -> IngestResult<Event> {
        let store = self.store.as_ref();
        let key = run.location.key.as_str();
        let head = with_backoff(&self.retry, "get head", move || async move {
            Ok::<_, IngestError>(store.get_head(key, DETECTION_HEAD_BYTES).await?)
        })
        .await?;
        let result = self.detector.detect(key, &head);

        let size = run.meta.size;
        let policy = self.config.split_policy();
        let mut channels = 0;
        if result.file_type.is_splittable() && size <= policy.size_threshold_bytes {
            let bytes = self.load(run).await?;
            channels = result
                .encoding
                .decode(&bytes)
                .map(|text| nem::channel_count(&text))
                .unwrap_or_default();
        }

        info!(
            location = %run.location,
            file_type = %result.file_type,
            encoding = %result.encoding,
            confidence = result.confidence,
            size,
            channels,
            "Detected file type"
        );
        Ok(Event::Detected {
            result,
            size,
            channels,
        })
    }

    async fn split(&self, run: &mut FileRun, detection: &FileTypeResult) -> IngestResult<Event> {
        let bytes = self.load(run).await?;
        let (splitter, location, encoding) = (&self.splitter, &run.location, detection.encoding);
        let outcome = with_backoff(&self.retry, "split", move || {
            let bytes = Arc::clone(&bytes);
            async move { splitter.split(location, &bytes, encoding).await }
        })
        .await?;

        let chunks = match outcome {
            SplitOutcome::Unsplittable => return Ok(Event::Unsplittable),
            SplitOutcome::Chunks(chunks) => chunks,
        };

        for chunk in &chunks {
            let fingerprint = file_fingerprint(&chunk.location, chunk.etag.as_deref());
            self.guard
                .register_child(&fingerprint, chunk.location.clone(), &run.fingerprint)
                .await?;
            run.record.children.push(fingerprint);
        }

        Ok(Event::Split {
            chunks: chunks.into_iter().map(|c| c.location.key).collect(),
        })
    }

    async fn process(
        &self,
        run: &mut FileRun,
        detection: &FileTypeResult,
        inv: &Invocation,
    ) -> IngestResult<Event> {
        let bytes = self.load(run).await?;
        let file_name = run.location.file_name().to_string();
        let parse_detection = detection.clone();
        let raw = tokio::task::spawn_blocking(move || parse_file(&parse_detection, &file_name, &bytes))
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(IngestError::Parse(format!("parser aborted: {e}"))))
            })
            .await?;

        let output = self
            .transformer
            .transform(&run.location.key, raw, Arc::clone(&inv.resolver))
            .await?;
        let summary = output.summary;
        info!(
            location = %run.location,
            mapped = summary.mapped,
            unmapped = summary.unmapped,
            flagged = summary.flagged,
            ignored = summary.ignored,
            meters = summary.meters,
            "Transformed readings"
        );
        run.readings = output.readings;
        Ok(Event::Transformed { summary })
    }

    /// Full object bytes, fetched once per file
    async fn load(&self, run: &mut FileRun) -> IngestResult<Arc<Vec<u8>>> {
        if let Some(bytes) = &run.bytes {
            return Ok(Arc::clone(bytes));
        }
        let store = self.store.as_ref();
        let key = run.location.key.as_str();
        let bytes = with_backoff(&self.retry, "get", move || async move {
            Ok::<_, IngestError>(store.get(key).await?)
        })
        .await?;
        let bytes = Arc::new(bytes);
        run.bytes = Some(Arc::clone(&bytes));
        Ok(bytes)
    }

    async fn head(&self, key: &str) -> IngestResult<Option<ObjectMeta>> {
        let store = self.store.as_ref();
        with_backoff(&self.retry, "head", move || async move {
            Ok::<_, IngestError>(store.head(key).await?)
        })
        .await
    }

    /// Write the buffered batch and move its files on
    async fn flush(
        &self,
        inv: &mut Invocation,
        waiting: &mut Vec<FileRun>,
        reports: &mut Vec<FileReport>,
    ) {
        let event = match inv.batch.flush().await {
            Ok(Some(artifact)) => {
                inv.artifacts.push(artifact.key.clone());
                Event::Written {
                    artifact: artifact.key,
                }
            }
            Ok(None) => return,
            // A sink failure says nothing about the files themselves, so they
            // stay in landing for the next delivery
            Err(e) => {
                let discarded = inv.batch.discard();
                error!(error = %e, units = discarded, "Batch flush failed");
                Event::Failed {
                    kind: FailureKind::Transient,
                    message: format!("batch flush failed: {e}"),
                }
            }
        };

        for mut run in waiting.drain(..) {
            let (next, effects) = run.machine.step(run.state.clone(), event.clone());
            run.state = next;
            let result = match self.persist(&mut run).await {
                Ok(()) => self.drive(&mut run, effects, inv).await,
                Err(halt) => Err(halt),
            };
            reports.push(self.settle(&mut run, result).await);
        }
    }
}

/// Parse with the detected adapter, or the fallback chain for unknown files
pub(crate) fn parse_file(
    detection: &FileTypeResult,
    file_name: &str,
    bytes: &[u8],
) -> IngestResult<Vec<RawReading>> {
    if detection.file_type == FileType::Unknown {
        // Nothing in the fallback chain reads non-text content
        if detection.encoding == TextEncoding::Binary {
            return Err(IngestError::Unclassified(format!("{file_name}: content is not text")));
        }
        let (file_type, readings) =
            parse_with_fallback(detection.candidate(), file_name, bytes, detection.encoding)?;
        info!(file_name, file_type = %file_type, "Parsed unclassified file with fallback adapter");
        return Ok(readings);
    }

    let parser = parser_for(detection.file_type).ok_or_else(|| {
        IngestError::Unclassified(format!("no adapter for {}", detection.file_type))
    })?;
    parser.parse(file_name, bytes, detection.encoding)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::idempotency::MemoryProcessingStore;
    use crate::resolve::MappingTable;
    use crate::storage::{MemoryObjectStore, Zone};

    const NEM12: &str = "100,NEM12,200506081149,UNITEDDP,NEMMCO\n\
        200,NEM1201009,E1,E1,E1,N1,01009,kWh,30,20050610\n\
        300,20050301,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31,32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47,48,A,,,20050310121004,\n\
        900\n";

    struct Harness {
        store: MemoryObjectStore,
        sink: MemoryObjectStore,
        pipeline: Pipeline,
    }

    fn harness() -> Harness {
        let store = MemoryObjectStore::new("ingest");
        let sink = MemoryObjectStore::new("lake");
        let pipeline = Pipeline::new(
            IngestConfig::default(),
            Arc::new(store.clone()),
            Arc::new(sink.clone()),
            Arc::new(MemoryProcessingStore::new()),
        )
        .with_retry_policy(RetryPolicy::none());
        Harness {
            store,
            sink,
            pipeline,
        }
    }

    fn mappings() -> Arc<dyn IdentifierResolver> {
        Arc::new(MappingTable::from_iter([(
            "NEM1201009-E1".to_string(),
            "sensor-1".to_string(),
        )]))
    }

    async fn stable_input(store: &MemoryObjectStore, key: &str) -> FileInput {
        let meta = store.head(key).await.unwrap().unwrap();
        FileInput::stable(ObjectLocation::new("ingest", key), meta)
    }

    #[tokio::test]
    async fn test_interval_file_is_ingested_and_archived() {
        let h = harness();
        h.store.put("landing/a.csv", NEM12.as_bytes().to_vec(), None).await.unwrap();
        let input = stable_input(&h.store, "landing/a.csv").await;

        let report = h
            .pipeline
            .run_invocation(vec![input], mappings(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.artifacts.len(), 1);
        let Disposition::Ingested { summary, .. } = &report.files[0].disposition else {
            panic!("expected ingestion");
        };
        assert_eq!(summary.mapped, 48);
        assert!(h.store.contains("processed/a.csv"));
        assert!(!h.store.contains("landing/a.csv"));
        assert_eq!(h.sink.keys().len(), 1);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_garbage_goes_to_manual_review() {
        let h = harness();
        h.store.put("landing/x.bin", vec![0u8, 159, 146, 150], None).await.unwrap();
        let input = stable_input(&h.store, "landing/x.bin").await;

        let report = h
            .pipeline
            .run_invocation(vec![input], mappings(), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            report.files[0].disposition,
            Disposition::Failed {
                kind: FailureKind::Unclassified,
                ..
            }
        ));
        assert!(h.store.contains(&Zone::ManualReview.destination("landing/x.bin")));
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_invocation_leaves_files_untouched() {
        let h = harness();
        h.store.put("landing/a.csv", NEM12.as_bytes().to_vec(), None).await.unwrap();
        let input = stable_input(&h.store, "landing/a.csv").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = h.pipeline.run_invocation(vec![input], mappings(), cancel).await.unwrap();

        assert!(matches!(report.files[0].disposition, Disposition::Deferred { .. }));
        assert_eq!(report.retry_locations().len(), 1);
        assert!(h.store.contains("landing/a.csv"));
        assert!(h.sink.keys().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_file_is_reported() {
        let h = harness();
        let report = h
            .pipeline
            .run_invocation(
                vec![FileInput::new(ObjectLocation::new("ingest", "landing/gone.csv"))],
                mappings(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.files[0].disposition, Disposition::Vanished);
    }

    #[test]
    fn test_counters() {
        let location = ObjectLocation::new("ingest", "landing/a.csv");
        let report = InvocationReport {
            fingerprint: "fp".into(),
            files: vec![
                FileReport {
                    location: location.clone(),
                    disposition: Disposition::Ingested {
                        summary: TransformSummary {
                            mapped: 3,
                            unmapped: 7,
                            monitor_points: 4,
                            unmapped_points: ["m-E2".to_string()].into_iter().collect(),
                            ..Default::default()
                        },
                        artifact: "batch.csv".into(),
                    },
                },
                FileReport {
                    location,
                    disposition: Disposition::Failed {
                        kind: FailureKind::Mapping,
                        stage: Stage::Processing,
                        message: "all unmapped".into(),
                    },
                },
            ],
            artifacts: vec!["batch.csv".into()],
            cached: false,
        };

        let counters = report.counters();
        assert_eq!(counters.valid_files, 1);
        assert_eq!(counters.unmapped_files, 1);
        assert_eq!(counters.monitor_points_processed, 4);
        assert_eq!(counters.monitor_points_total, 5);
        assert_eq!(report.exit_code(), 0);
    }
}
