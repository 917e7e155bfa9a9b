//! Configuration types for the conversion worker.
//!
//! All worker behaviour is controlled through [`WorkerConfig`], built via its
//! [`WorkerConfigBuilder`]. One struct holds every knob so the orchestrator,
//! the task source and the relay all read from the same validated snapshot.

use crate::error::WorkerError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default chunk size for reading converter stdout: 1 MiB.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Smallest accepted read buffer. Must exceed the scanner's retained suffix.
pub const MIN_READ_BUFFER_SIZE: usize = 256;

/// Configuration for a conversion worker.
///
/// Built via [`WorkerConfig::builder()`] or [`WorkerConfig::from_env()`].
///
/// # Example
/// ```rust
/// use convert_worker::{ConvertMode, WorkerConfig};
///
/// let config = WorkerConfig::builder("http://coordinator/tasks")
///     .converter_path("/app/do-convert-single-file")
///     .mode(ConvertMode::SingleFile)
///     .retry_backoff_secs(3)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator endpoint that hands out one task per request.
    pub poll_url: String,

    /// HTTP method used to poll. Default: [`PollMethod::Get`].
    pub poll_method: PollMethod,

    /// Converter executable. Default: `/app/convert`.
    pub converter_path: PathBuf,

    /// Scratch directory, wiped at the start of every attempt.
    /// Default: `$TMPDIR/convert-worker`.
    pub work_dir: PathBuf,

    /// How the converter talks to us. Default: [`ConvertMode::Stream`].
    pub mode: ConvertMode,

    /// Delay before re-polling after "no work" or a transient network error.
    /// Default: 10.
    pub retry_backoff_secs: u64,

    /// Chunk size for reading converter stdout. Default: 1 MiB.
    ///
    /// Bounds the relay's memory: at most one chunk plus the retained suffix
    /// is held at any time, however large the converter output is.
    pub read_buffer_size: usize,

    /// Chunks buffered between the relay and the HTTP body. Default: 4.
    ///
    /// When the callback endpoint reads slowly the relay blocks here, which in
    /// turn stops reading the converter's stdout.
    pub body_channel_capacity: usize,

    /// Timeout for a single poll request in seconds. Default: 60.
    pub request_timeout_secs: u64,
}

impl WorkerConfig {
    /// Create a new builder for `WorkerConfig`.
    pub fn builder(poll_url: impl Into<String>) -> WorkerConfigBuilder {
        WorkerConfigBuilder {
            config: Self {
                poll_url: poll_url.into(),
                poll_method: PollMethod::default(),
                converter_path: PathBuf::from("/app/convert"),
                work_dir: std::env::temp_dir().join("convert-worker"),
                mode: ConvertMode::default(),
                retry_backoff_secs: 10,
                read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
                body_channel_capacity: 4,
                request_timeout_secs: 60,
            },
        }
    }

    /// Build a configuration from the process environment.
    ///
    /// `POLL_URL` is required. `CONVERTER_PATH`, `CONVERT_WORK_DIR`,
    /// `CONVERT_MODE` (`stream` / `single-file`) and `RETRY_BACKOFF_SECS`
    /// override their defaults when set.
    pub fn from_env() -> Result<Self, WorkerError> {
        let poll_url = std::env::var("POLL_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                WorkerError::InvalidConfig("You must set POLL_URL before starting the worker".into())
            })?;

        let mut builder = Self::builder(poll_url);
        if let Ok(path) = std::env::var("CONVERTER_PATH") {
            builder = builder.converter_path(path);
        }
        if let Ok(dir) = std::env::var("CONVERT_WORK_DIR") {
            builder = builder.work_dir(dir);
        }
        if let Ok(mode) = std::env::var("CONVERT_MODE") {
            builder = builder.mode(mode.parse()?);
        }
        if let Ok(secs) = std::env::var("RETRY_BACKOFF_SECS") {
            let secs = secs.parse::<u64>().map_err(|e| {
                WorkerError::InvalidConfig(format!("RETRY_BACKOFF_SECS '{secs}': {e}"))
            })?;
            builder = builder.retry_backoff_secs(secs);
        }
        builder.build()
    }

    /// Program name used in task-level error messages.
    pub fn converter_name(&self) -> String {
        self.converter_path.display().to_string()
    }
}

/// Builder for [`WorkerConfig`].
#[derive(Debug)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    pub fn poll_method(mut self, method: PollMethod) -> Self {
        self.config.poll_method = method;
        self
    }

    pub fn converter_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.converter_path = path.into();
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn mode(mut self, mode: ConvertMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn retry_backoff_secs(mut self, secs: u64) -> Self {
        self.config.retry_backoff_secs = secs;
        self
    }

    pub fn read_buffer_size(mut self, bytes: usize) -> Self {
        self.config.read_buffer_size = bytes;
        self
    }

    pub fn body_channel_capacity(mut self, chunks: usize) -> Self {
        self.config.body_channel_capacity = chunks.max(1);
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<WorkerConfig, WorkerError> {
        let c = &self.config;
        if c.poll_url.trim().is_empty() {
            return Err(WorkerError::InvalidConfig("Poll URL must not be empty".into()));
        }
        reqwest::Url::parse(&c.poll_url).map_err(|e| {
            WorkerError::InvalidConfig(format!("Poll URL '{}' is invalid: {e}", c.poll_url))
        })?;
        if c.read_buffer_size < MIN_READ_BUFFER_SIZE {
            return Err(WorkerError::InvalidConfig(format!(
                "Read buffer must be ≥ {MIN_READ_BUFFER_SIZE} bytes, got {}",
                c.read_buffer_size
            )));
        }
        if c.request_timeout_secs == 0 {
            return Err(WorkerError::InvalidConfig(
                "Request timeout must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How the converter reports its progress and results.
///
/// | Mode | Blob delivery | Converter stdout |
/// |------|---------------|------------------|
/// | `Stream` | piped to stdin | a complete multipart stream |
/// | `SingleFile` | `input.blob` in the working directory | plain progress lines |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConvertMode {
    /// Converter emits its own multipart stream; we relay it. (default)
    #[default]
    Stream,
    /// Converter emits progress lines and writes fixed-name artifacts.
    SingleFile,
}

impl std::str::FromStr for ConvertMode {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stream" => Ok(ConvertMode::Stream),
            "single-file" | "single_file" | "singlefile" => Ok(ConvertMode::SingleFile),
            other => Err(WorkerError::InvalidConfig(format!(
                "Unknown convert mode '{other}' (expected 'stream' or 'single-file')"
            ))),
        }
    }
}

/// HTTP method for the coordinator poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PollMethod {
    #[default]
    Get,
    Post,
}

impl From<PollMethod> for reqwest::Method {
    fn from(m: PollMethod) -> Self {
        match m {
            PollMethod::Get => reqwest::Method::GET,
            PollMethod::Post => reqwest::Method::POST,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let c = WorkerConfig::builder("http://localhost/poll").build().unwrap();
        assert_eq!(c.poll_method, PollMethod::Get);
        assert_eq!(c.mode, ConvertMode::Stream);
        assert_eq!(c.retry_backoff_secs, 10);
        assert_eq!(c.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(c.converter_path, PathBuf::from("/app/convert"));
        assert!(c.work_dir.ends_with("convert-worker"));
    }

    #[test]
    fn empty_poll_url_is_rejected() {
        let err = WorkerConfig::builder("  ").build().unwrap_err();
        assert!(matches!(err, WorkerError::InvalidConfig(_)));
    }

    #[test]
    fn unparseable_poll_url_is_rejected() {
        let err = WorkerConfig::builder("not a url").build().unwrap_err();
        assert!(err.to_string().contains("not a url"), "got: {err}");
    }

    #[test]
    fn tiny_read_buffer_is_rejected() {
        let err = WorkerConfig::builder("http://localhost/poll")
            .read_buffer_size(64)
            .build()
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidConfig(_)));
    }

    #[test]
    fn channel_capacity_is_at_least_one() {
        let c = WorkerConfig::builder("http://localhost/poll")
            .body_channel_capacity(0)
            .build()
            .unwrap();
        assert_eq!(c.body_channel_capacity, 1);
    }

    #[test]
    fn convert_mode_parses() {
        assert_eq!("stream".parse::<ConvertMode>().unwrap(), ConvertMode::Stream);
        assert_eq!(
            "Single-File".parse::<ConvertMode>().unwrap(),
            ConvertMode::SingleFile
        );
        assert!("pdf".parse::<ConvertMode>().is_err());
    }

    #[test]
    fn poll_method_maps_to_http() {
        assert_eq!(reqwest::Method::from(PollMethod::Get), reqwest::Method::GET);
        assert_eq!(reqwest::Method::from(PollMethod::Post), reqwest::Method::POST);
    }
}
