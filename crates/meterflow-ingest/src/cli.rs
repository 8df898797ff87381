//! Command-line surface of `meterflow-ingest`

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admin::{self, ReprocessFilter};
use crate::archive::{ArchiveStatus, Archiver, RelocationResult};
use crate::batch::BatchWriter;
use crate::config::{IngestConfig, DEFAULT_PROCESSING_WORKERS};
use crate::etl::{EtlTrigger, HttpEtlLauncher, DEFAULT_ETL_JOB_NAME};
use crate::idempotency::{MemoryProcessingStore, ProcessingStore};
use crate::orchestrator::Pipeline;
use crate::resolve::{HttpGraphClient, IdentifierResolver, MappingRefresher, MappingTable};
use crate::storage::{ObjectStore, S3ObjectStore, StorageConfig, Zone};
use crate::trigger::{MemoryQueue, QueueBatch, TriggerHandler};

/// Meter data ingestion pipeline
#[derive(Parser, Debug)]
#[command(name = "meterflow-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the trigger handler on one queue delivery
    HandleEvent {
        /// Queue-batch JSON file, or `-` for stdin
        #[arg(long, default_value = "-")]
        event: String,
    },

    /// Parse, resolve and publish a file from local disk
    ProcessLocal {
        file: PathBuf,

        /// Mapping table JSON; defaults to the table in the ingest bucket
        #[arg(long)]
        mappings: Option<PathBuf>,

        /// Preview without writing the artifact
        #[arg(long)]
        dry_run: bool,

        #[arg(long, default_value_t = DEFAULT_PROCESSING_WORKERS)]
        workers: usize,
    },

    /// Send error-zone files back to landing
    Reprocess {
        /// Only files whose name contains this project
        #[arg(long)]
        project: String,

        /// First day of the modification window (YYYY-MM-DD)
        #[arg(long)]
        start_date: NaiveDate,

        /// Last day of the modification window (YYYY-MM-DD)
        #[arg(long)]
        end_date: NaiveDate,

        /// Restrict to one error zone
        #[arg(long)]
        zone: Option<Zone>,

        #[arg(long)]
        dry_run: bool,

        #[arg(long, default_value_t = DEFAULT_PROCESSING_WORKERS)]
        workers: usize,
    },

    /// Move last week's settled files into weekly archive partitions
    Archive {
        /// Week to archive (YYYY-Www); defaults to the previous ISO week
        #[arg(long)]
        target_week: Option<String>,

        #[arg(long)]
        workers: Option<usize>,
    },

    /// Move monthly archive partitions into weekly ones
    MigrateArchives {
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        workers: Option<usize>,
    },

    /// Start the lake import when enough batches are waiting
    TriggerEtl {
        /// Job-runner endpoint
        #[arg(long, env = "ETL_LAUNCH_URL")]
        launch_url: String,

        #[arg(long, env = "ETL_JOB_NAME", default_value = DEFAULT_ETL_JOB_NAME)]
        job_name: String,
    },

    /// Rebuild the mapping table from the identifier graph
    RefreshMappings {
        /// Graph database HTTP endpoint
        #[arg(long, env = "GRAPH_ENDPOINT")]
        graph_endpoint: String,
    },
}

/// Storage handles shared by the commands
struct Handles {
    config: IngestConfig,
    store: Arc<dyn ObjectStore>,
    sink: Arc<dyn ObjectStore>,
}

impl Handles {
    async fn connect() -> Result<Self> {
        let config = IngestConfig::from_env().context("Invalid ingest configuration")?;
        let storage = StorageConfig::from_env();
        let store = S3ObjectStore::new(&storage, config.bucket.clone()).await;
        let sink = store.with_bucket(config.sink_bucket.clone());
        Ok(Self {
            config,
            store: Arc::new(store),
            sink: Arc::new(sink),
        })
    }

    async fn mappings(&self) -> Result<MappingTable> {
        Ok(MappingTable::load(self.store.as_ref(), &self.config.mappings_key).await?)
    }
}

async fn processing_store() -> Result<Arc<dyn ProcessingStore>> {
    #[cfg(feature = "postgres")]
    if let Ok(url) = std::env::var("DATABASE_URL") {
        let store = crate::idempotency::PgProcessingStore::connect(&url).await?;
        store.migrate().await?;
        info!("Using Postgres processing store");
        return Ok(Arc::new(store));
    }

    warn!("No shared processing store configured; idempotency is per process");
    Ok(Arc::new(MemoryProcessingStore::new()))
}

async fn read_event(source: &str) -> Result<String> {
    if source == "-" {
        let mut body = String::new();
        tokio::io::stdin()
            .read_to_string(&mut body)
            .await
            .context("Failed to read event from stdin")?;
        Ok(body)
    } else {
        tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("Failed to read event from {}", source))
    }
}

fn progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    pb
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Execute `cli`, returning the process exit code
pub async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::HandleEvent { event } => handle_event(&event).await,
        Commands::ProcessLocal {
            file,
            mappings,
            dry_run,
            workers,
        } => process_local(file, mappings, dry_run, workers).await,
        Commands::Reprocess {
            project,
            start_date,
            end_date,
            zone,
            dry_run,
            workers,
        } => {
            let filter = ReprocessFilter::new(project, start_date, end_date, zone)?;
            let ctx = Handles::connect().await?;
            let report = admin::reprocess(ctx.store.as_ref(), &filter, dry_run, workers).await?;

            for relocation in &report.planned {
                println!("{} -> {}", relocation.src, relocation.dst);
            }
            println!(
                "{} file(s) selected, {} moved, {} skipped, {} errored{}",
                report.planned.len(),
                report.tally.moved,
                report.tally.skipped,
                report.tally.errored,
                if dry_run { " (dry run)" } else { "" }
            );
            Ok(i32::from(!dry_run && report.tally.errored > 0))
        }
        Commands::Archive {
            target_week,
            workers,
        } => {
            let ctx = Handles::connect().await?;
            let archiver = Archiver::new(
                Arc::clone(&ctx.store),
                workers.unwrap_or(ctx.config.archive_workers),
            );
            let report = archiver.archive_week(target_week.as_deref(), Utc::now()).await;
            print_json(&json!({
                "statusCode": report.status.status_code(),
                "body": report,
            }))?;
            Ok(i32::from(report.status != ArchiveStatus::Succeeded))
        }
        Commands::MigrateArchives { dry_run, workers } => {
            let ctx = Handles::connect().await?;
            let archiver = Archiver::new(
                Arc::clone(&ctx.store),
                workers.unwrap_or(ctx.config.archive_workers),
            );
            let total = archiver.migration_size().await?;
            let pb = progress_bar(total as u64, "Migrating archives");

            let tally = archiver
                .migrate_archives(dry_run, &|relocation, result| {
                    if let RelocationResult::Errored(message) = result {
                        pb.println(format!("ERROR {}: {}", relocation.src, message));
                    }
                    pb.inc(1);
                })
                .await?;
            pb.finish_with_message("Migration finished");

            println!(
                "Total: {}, migrated: {}, skipped: {}, errors: {}{}",
                tally.total(),
                tally.moved,
                tally.skipped,
                tally.errored,
                if dry_run { " (dry run)" } else { "" }
            );
            Ok(i32::from(!dry_run && tally.errored > 0))
        }
        Commands::TriggerEtl {
            launch_url,
            job_name,
        } => {
            let ctx = Handles::connect().await?;
            let launcher = Arc::new(HttpEtlLauncher::new(launch_url)?);
            let report = EtlTrigger::new(
                Arc::clone(&ctx.sink),
                ctx.config.sink_prefix.clone(),
                ctx.config.etl_files_threshold,
                launcher,
            )
            .with_job_name(job_name)
            .check_and_trigger()
            .await?;
            print_json(&report)?;
            Ok(0)
        }
        Commands::RefreshMappings { graph_endpoint } => {
            let ctx = Handles::connect().await?;
            let graph = Arc::new(HttpGraphClient::new(graph_endpoint)?);
            let count = MappingRefresher::new(graph, Arc::clone(&ctx.store), ctx.config.mappings_key.clone())
                .refresh()
                .await?;
            println!("Wrote {} mappings to {}", count, ctx.config.mappings_key);
            Ok(0)
        }
    }
}

async fn handle_event(source: &str) -> Result<i32> {
    let body = read_event(source).await?;
    let batch: QueueBatch = serde_json::from_str(&body).context("Event is not a queue batch")?;

    let ctx = Handles::connect().await?;
    let resolver: Arc<dyn IdentifierResolver> = Arc::new(ctx.mappings().await?);
    let pipeline = Arc::new(Pipeline::new(
        ctx.config.clone(),
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.sink),
        processing_store().await?,
    ));
    let queue = Arc::new(MemoryQueue::new());
    let handler = TriggerHandler::new(pipeline, queue.clone());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing the current file and flushing");
            on_signal.cancel();
        }
    });

    let summary = handler.handle(batch, resolver, cancel).await?;
    let failures: Vec<_> = summary
        .failed_message_ids
        .iter()
        .map(|id| json!({ "itemIdentifier": id }))
        .collect();
    print_json(&json!({
        "summary": summary,
        "requeue": queue.drain(),
        "batchItemFailures": failures,
    }))?;

    let failed = summary.report.as_ref().is_some_and(|r| r.has_failures());
    Ok(i32::from(failed || !summary.failed_message_ids.is_empty()))
}

async fn process_local(
    file: PathBuf,
    mappings: Option<PathBuf>,
    dry_run: bool,
    workers: usize,
) -> Result<i32> {
    let needs_storage = mappings.is_none() || !dry_run;
    let ctx = if needs_storage {
        Some(Handles::connect().await?)
    } else {
        None
    };

    let table = match (&mappings, &ctx) {
        (Some(path), _) => {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            MappingTable::from_json(&data)?
        }
        (None, Some(ctx)) => ctx.mappings().await?,
        (None, None) => anyhow::bail!("No mapping table available"),
    };
    info!(mappings = table.len(), "Mapping table ready");

    let mut writer = match (&ctx, dry_run) {
        (Some(ctx), false) => Some(
            BatchWriter::new(Arc::clone(&ctx.sink), ctx.config.sink_prefix.clone(), 1)
                .with_retry_policy(ctx.config.retry_policy()),
        ),
        _ => None,
    };

    let summary = admin::process_local(&file, Arc::new(table), writer.as_mut(), workers).await?;
    summary.print();

    Ok(i32::from(!dry_run && summary.meters_total > 0 && summary.readings == 0))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_reprocess() {
        let cli = Cli::try_parse_from([
            "meterflow-ingest",
            "reprocess",
            "--project",
            "racv",
            "--start-date",
            "2026-01-01",
            "--end-date",
            "2026-01-31",
            "--zone",
            "parse-err",
            "--dry-run",
        ])
        .unwrap();

        let Commands::Reprocess {
            project,
            zone,
            dry_run,
            workers,
            ..
        } = cli.command
        else {
            panic!("expected reprocess");
        };
        assert_eq!(project, "racv");
        assert_eq!(zone, Some(Zone::ParseError));
        assert!(dry_run);
        assert_eq!(workers, DEFAULT_PROCESSING_WORKERS);
    }

    #[test]
    fn test_bad_date_rejected() {
        let parsed = Cli::try_parse_from([
            "meterflow-ingest",
            "reprocess",
            "--project",
            "racv",
            "--start-date",
            "01/01/2026",
            "--end-date",
            "2026-01-31",
        ]);
        assert!(parsed.is_err());
    }
}
