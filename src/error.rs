//! Error types for the convert-worker runtime.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`WorkerError`] — **Fatal**: the worker cannot keep running (the
//!   coordinator broke its contract, the converter binary is missing, the
//!   scratch directory cannot be created). Returned as `Err(WorkerError)` from
//!   the top-level [`crate::worker::Worker`] operations; the process stops and
//!   no further tasks are polled.
//!
//! * [`TaskError`] — **Task-level**: one attempt went wrong (converter bug,
//!   missing artifact, truncated blob) but the multipart stream is still
//!   terminated properly. Its `Display` text becomes the body of the `error`
//!   fragment sent to the coordinator; it never propagates as a process
//!   failure.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the worker.
///
/// Task-level failures use [`TaskError`] and are rendered into the result
/// stream rather than propagated here.
#[derive(Debug, Error)]
pub enum WorkerError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed, or a required setting is absent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Coordinator errors ────────────────────────────────────────────────
    /// The poll request failed with a network error that is not retryable.
    #[error("Polling '{url}' failed: {source}")]
    PollRequestFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The coordinator answered with a status other than 200, 201 or 204.
    #[error("Coordinator responded to poll with status {status}")]
    UnexpectedPollStatus { status: u16 },

    /// The task body could not be received.
    #[error("Could not receive task body from coordinator: {source}")]
    PollBodyUnreadable {
        #[source]
        source: reqwest::Error,
    },

    /// The task body is not a valid task descriptor.
    #[error("Could not parse task from coordinator: {source}")]
    MalformedTask {
        #[source]
        source: serde_json::Error,
    },

    // ── Converter errors ──────────────────────────────────────────────────
    /// The converter binary does not exist or is not executable.
    #[error("Converter '{path}' does not exist or is not executable")]
    ConverterNotFound { path: PathBuf },

    /// The converter binary exists but could not be started.
    #[error("Could not start converter '{path}': {source}")]
    ConverterSpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the converter failed at the OS level.
    #[error("Could not wait for converter to exit: {source}")]
    ConverterWaitFailed {
        #[source]
        source: std::io::Error,
    },

    // ── Filesystem errors ─────────────────────────────────────────────────
    /// The per-attempt working directory could not be wiped or created.
    #[error("Failed to prepare working directory '{path}': {source}")]
    WorkDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Lifecycle ─────────────────────────────────────────────────────────
    /// The attempt was interrupted; the converter has already exited.
    #[error("Interrupted; converter stopped")]
    Cancelled,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Whether this error is the cooperative-cancellation outcome rather than
    /// a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerError::Cancelled)
    }
}

/// A non-fatal error for a single task attempt.
///
/// Rendered as the body of an `error` fragment, so the coordinator always
/// receives a parsable multipart response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The converter exited with a non-zero status.
    #[error("{program} exited with status code {code}")]
    ConverterExited { program: String, code: i32 },

    /// The converter was terminated by a signal before exiting.
    #[error("{program} was killed by a signal")]
    ConverterKilled { program: String },

    /// The converter printed a line that is not a progress report.
    #[error("{0}")]
    ConverterReportedError(String),

    /// The converter printed a line too long to buffer; only its start is kept.
    #[error("Converter output line exceeds {limit} bytes: {prefix}...")]
    ConverterLineTooLong { limit: usize, prefix: String },

    /// The converter's stream ended without a `done` or `error` fragment.
    #[error("{program} did not output a 'done' or 'error' fragment")]
    MissingTerminalFragment { program: String },

    /// A mandatory output artifact was not written.
    #[error("{program} did not output {name}")]
    MissingArtifact { program: String, name: String },

    /// An output artifact exists but could not be read back.
    #[error("Could not read {name}: {reason}")]
    ArtifactUnreadable { name: String, reason: String },

    /// The blob could not be downloaded.
    #[error("Failed to fetch blob '{url}': {reason}")]
    BlobFetchFailed { url: String, reason: String },

    /// The blob had a different length than the task declared.
    #[error("Blob length mismatch: task declared {declared} bytes but {actual} bytes were copied")]
    BlobLengthMismatch { declared: u64, actual: u64 },

    /// The blob could not be written to the converter or working directory.
    #[error("Failed to write blob: {reason}")]
    BlobWriteFailed { reason: String },

    /// Reading the converter's stdout failed.
    #[error("Failed to read output of {program}: {reason}")]
    OutputUnreadable { program: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converter_exit_display_names_status() {
        let e = TaskError::ConverterExited {
            program: "/app/convert".into(),
            code: 3,
        };
        assert_eq!(e.to_string(), "/app/convert exited with status code 3");
    }

    #[test]
    fn length_mismatch_display() {
        let e = TaskError::BlobLengthMismatch {
            declared: 100,
            actual: 80,
        };
        let msg = e.to_string();
        assert!(msg.contains("100"), "got: {msg}");
        assert!(msg.contains("80"), "got: {msg}");
    }

    #[test]
    fn reported_error_is_verbatim() {
        let e = TaskError::ConverterReportedError("not a PDF".into());
        assert_eq!(e.to_string(), "not a PDF");
    }

    #[test]
    fn missing_artifact_display() {
        let e = TaskError::MissingArtifact {
            program: "do-convert".into(),
            name: "0.json".into(),
        };
        assert_eq!(e.to_string(), "do-convert did not output 0.json");
    }

    #[test]
    fn cancelled_is_flagged() {
        assert!(WorkerError::Cancelled.is_cancelled());
        assert!(!WorkerError::UnexpectedPollStatus { status: 500 }.is_cancelled());
    }

    #[test]
    fn unexpected_status_display() {
        let e = WorkerError::UnexpectedPollStatus { status: 418 };
        assert!(e.to_string().contains("418"));
    }
}
