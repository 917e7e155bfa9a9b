//! CLI binary for convert-worker.
//!
//! A thin shim over the library crate that maps flags and environment
//! variables to `WorkerConfig`, installs signal handling and runs the loop.

use anyhow::{Context, Result};
use clap::Parser;
use convert_worker::{ConvertMode, PollMethod, Worker, WorkerConfig};
use std::io;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve tasks forever with a streaming converter
  POLL_URL=http://coordinator/tasks convert-worker

  # Single-file converter that writes 0.json / 0.blob
  convert-worker --poll-url http://coordinator/tasks \
      --converter /app/do-convert-single-file --mode single-file

  # Poll exactly once (no backoff), then exit
  convert-worker --once

EXIT STATUS:
  0  stopped by SIGINT/SIGTERM (the converter is interrupted first),
     or --once finished
  1  fatal error: unexpected coordinator response, malformed task,
     missing converter, unusable working directory

ENVIRONMENT VARIABLES:
  POLL_URL              Coordinator endpoint (required)
  POLL_METHOD           get | post
  CONVERTER_PATH        Converter executable
  CONVERT_WORK_DIR      Scratch directory, wiped before every task
  CONVERT_MODE          stream | single-file
  RETRY_BACKOFF_SECS    Delay between polls when there is no work
  RUST_LOG              Overrides --verbose / --quiet
"#;

/// Claim conversion tasks and stream converter results back to the coordinator.
#[derive(Parser, Debug)]
#[command(
    name = "convert-worker",
    version,
    about = "Claim conversion tasks and stream converter results back to the coordinator",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Coordinator endpoint that hands out one task per request.
    #[arg(long, env = "POLL_URL")]
    poll_url: String,

    /// HTTP method used to poll.
    #[arg(long, env = "POLL_METHOD", value_enum, default_value = "get")]
    poll_method: PollMethodArg,

    /// Converter executable.
    #[arg(long, env = "CONVERTER_PATH", default_value = "/app/convert")]
    converter: PathBuf,

    /// Working directory for the converter; wiped before every task.
    #[arg(long, env = "CONVERT_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// How the converter reports results.
    #[arg(long, env = "CONVERT_MODE", value_enum, default_value = "stream")]
    mode: ModeArg,

    /// Seconds to wait before polling again when there is no work.
    #[arg(long, env = "RETRY_BACKOFF_SECS", default_value_t = 10)]
    backoff: u64,

    /// Poll request timeout in seconds.
    #[arg(long, env = "POLL_TIMEOUT_SECS", default_value_t = 60)]
    poll_timeout: u64,

    /// Converter stdout read size in bytes.
    #[arg(long, env = "CONVERT_READ_BUFFER", default_value_t = convert_worker::config::DEFAULT_READ_BUFFER_SIZE)]
    read_buffer: usize,

    /// Poll once without backoff, run the task if any, then exit.
    #[arg(long, alias = "just-one-tick")]
    once: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "CONVERT_WORKER_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "CONVERT_WORKER_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum ModeArg {
    Stream,
    SingleFile,
}

impl From<ModeArg> for ConvertMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Stream => ConvertMode::Stream,
            ModeArg::SingleFile => ConvertMode::SingleFile,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum PollMethodArg {
    Get,
    Post,
}

impl From<PollMethodArg> for PollMethod {
    fn from(v: PollMethodArg) -> Self {
        match v {
            PollMethodArg::Get => PollMethod::Get,
            PollMethodArg::Post => PollMethod::Post,
        }
    }
}

impl Cli {
    fn to_config(&self) -> Result<WorkerConfig> {
        let mut builder = WorkerConfig::builder(&self.poll_url)
            .poll_method(self.poll_method.clone().into())
            .converter_path(&self.converter)
            .mode(self.mode.clone().into())
            .retry_backoff_secs(if self.once { 0 } else { self.backoff })
            .request_timeout_secs(self.poll_timeout)
            .read_buffer_size(self.read_buffer);
        if let Some(dir) = &self.work_dir {
            builder = builder.work_dir(dir);
        }
        builder.build().context("Invalid configuration")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = cli.to_config()?;
    let worker = Worker::new(config).context("Failed to start worker")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown requested; interrupting converter");
            cancel.cancel();
        }
    });

    let result = if cli.once {
        worker.run_once(&cancel).await.map(|_| ())
    } else {
        worker.run(&cancel).await
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => {
            info!("Worker stopped");
            Ok(())
        }
        Err(e) => Err(e).context("Worker stopped"),
    }
}

/// Resolves on SIGINT or SIGTERM (Ctrl-C elsewhere).
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(mut int), Ok(mut term)) => {
            tokio::select! {
                _ = int.recv() => {}
                _ = term.recv() => {}
            }
        }
        _ => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
