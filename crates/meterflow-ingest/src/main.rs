//! meterflow-ingest - Main entry point

use clap::Parser;
use meterflow_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use meterflow_ingest::cli::{run, Cli};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Environment settings win; the flag only raises verbosity
    let mut log_config = LogConfig::from_env().unwrap_or_else(|_| {
        LogConfig::builder()
            .level(LogLevel::Info)
            .output(LogOutput::Console)
            .log_file_prefix("meterflow-ingest")
            .build()
    });
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }

    // The CLI still works without logging
    let guard = init_logging(&log_config).ok();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            1
        }
    };

    drop(guard);
    process::exit(code);
}
