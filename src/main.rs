use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use cachelog_jobs::{
    LogManager, OperationId, ProcessingState, ProcessingStatus, RemovalReport, RemovalStatus,
};

mod config;

/// cachelog - processing and service removal for cache server logs
#[derive(Parser, Debug)]
#[command(name = "cachelog")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file (defaults are used when omitted)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the logs directory
    #[arg(long, value_name = "DIR")]
    logs_dir: Option<PathBuf>,

    /// Override the log worker executable
    #[arg(long, value_name = "PATH")]
    worker: Option<PathBuf>,

    /// Status polling interval while waiting for a job, in milliseconds
    #[arg(long, default_value = "1000")]
    poll_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the logs directory and whether it exists
    Info,

    /// Count log lines per service
    Counts,

    /// Rewind the processing position to the start of the logs
    ResetPosition,

    /// Show processing status and any retained removals
    Status,

    /// Run a log processing pass and wait for it to finish
    Process,

    /// Remove one service's entries from the logs and wait for it to finish
    Remove {
        /// Service name, e.g. "steam"
        service: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr, results to stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let mut settings = config::load(args.config.as_deref())?;
    if let Some(logs_dir) = args.logs_dir {
        settings.logs_dir = logs_dir;
    }
    if let Some(worker) = args.worker {
        settings.worker_program = worker;
    }

    let manager = LogManager::from_config(settings).context("Failed to initialise log manager")?;
    let poll = Duration::from_millis(args.poll_ms.max(10));

    match args.command {
        Command::Info => print_json(&manager.log_info().await),
        Command::Counts => {
            let counts = manager
                .service_counts()
                .await
                .context("Failed to count services")?;
            print_json(&counts)
        }
        Command::ResetPosition => {
            manager.reset_log_position();
            print_json(&manager.processing_status())
        }
        Command::Status => print_json(&manager.status_overview()),
        // Jobs run on this process's runtime, so the CLI stays until they end
        Command::Process => {
            manager
                .start_processing()
                .context("Failed to start log processing")?;

            let status = wait_for_processing(&manager, poll).await;
            print_json(&status)?;
            if status.state == ProcessingState::Failed {
                anyhow::bail!(
                    "Log processing failed: {}",
                    status.last_error.as_deref().unwrap_or("unknown error")
                );
            }
            Ok(())
        }
        Command::Remove { service } => {
            let operation_id = manager
                .start_service_removal(&service)
                .with_context(|| format!("Failed to start removal of '{}'", service))?;

            let status = wait_for_removal(&manager, &operation_id, poll).await?;
            print_json(&status)?;
            if let Some(error) = &status.error {
                anyhow::bail!("Removal of '{}' failed: {}", service, error);
            }
            Ok(())
        }
    }
}

/// Poll until the processing pass leaves `Running`
async fn wait_for_processing(manager: &LogManager, poll: Duration) -> ProcessingStatus {
    loop {
        tokio::time::sleep(poll).await;
        let status = manager.processing_status();
        if status.state != ProcessingState::Running {
            return status;
        }
        if let Some(progress) = &status.progress {
            tracing::info!(
                percent = progress.percent_complete,
                message = progress.message.as_deref(),
                "processing"
            );
        }
    }
}

/// Poll until the removal reaches a terminal state
async fn wait_for_removal(
    manager: &LogManager,
    operation_id: &OperationId,
    poll: Duration,
) -> Result<RemovalStatus> {
    loop {
        tokio::time::sleep(poll).await;
        let status = match manager.removal_status(Some(operation_id)) {
            RemovalReport::Found(status) => status,
            RemovalReport::NotFound { .. } => {
                anyhow::bail!("Removal operation {} disappeared", operation_id)
            }
        };
        if status.state.is_terminal() {
            return Ok(status);
        }
        if let Some(progress) = &status.progress {
            tracing::info!(
                service = %status.service,
                percent = progress.percent_complete,
                message = progress.message.as_deref(),
                "removing"
            );
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{}", json);
    Ok(())
}
