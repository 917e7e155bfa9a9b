//! # convert-worker
//!
//! A worker that claims conversion tasks from a coordinator, runs a converter
//! program on each, and streams the converter's multipart result back to the
//! task's callback URL as it is produced.
//!
//! ## Attempt Overview
//!
//! ```text
//! coordinator
//!  │
//!  ├─ 1. Poll     GET POLL_URL → 200 {task} | 204 retry later
//!  ├─ 2. Prepare  wipe the working directory, draw a boundary
//!  ├─ 3. Convert  spawn the converter; feed it the blob
//!  ├─ 4. Relay    converter stdout → multipart body, constant memory
//!  └─ 5. Deliver  streaming POST to the task's callback URL
//! ```
//!
//! Every result stream ends with exactly one `done` or `error` fragment and a
//! close-delimiter, even when the converter crashes or misbehaves.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use convert_worker::{Worker, WorkerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WorkerConfig::from_env()?;
//!     let worker = Worker::new(config)?;
//!     let cancel = CancellationToken::new();
//!     match worker.run(&cancel).await {
//!         Err(e) if !e.is_cancelled() => Err(e.into()),
//!         _ => Ok(()),
//!     }
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `convert-worker` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when embedding the worker as a library:
//! ```toml
//! convert-worker = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod multipart;
pub mod pipeline;
pub mod progress;
pub mod task;
pub mod workdir;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConvertMode, PollMethod, WorkerConfig, WorkerConfigBuilder};
pub use error::{TaskError, WorkerError};
pub use multipart::Boundary;
pub use pipeline::scan::BoundaryScanner;
pub use pipeline::sink::Delivery;
pub use pipeline::source::{PollOutcome, RetryReason, TaskSource};
pub use task::{AcquiredTask, Blob, Task};
pub use worker::{AttemptOutcome, AttemptReport, Worker};
