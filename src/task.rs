//! Task descriptors handed out by the coordinator.

use crate::error::WorkerError;
use serde::{Deserialize, Serialize};

/// The fields of a task descriptor the worker itself needs.
///
/// The coordinator may send more; everything else is only meaningful to the
/// converter, which receives the raw descriptor verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Where the multipart result is POSTed.
    #[serde(rename = "url")]
    pub callback_url: String,

    /// The input blob, if the task has one.
    #[serde(default)]
    pub blob: Blob,
}

/// Location and declared size of a task's input blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    #[serde(rename = "url", default)]
    pub source_url: Option<String>,

    #[serde(rename = "nBytes", default)]
    pub declared_len: Option<u64>,
}

/// A claimed task: the raw descriptor bytes plus the parsed fields.
///
/// The raw bytes are preserved exactly as received because they are passed,
/// unmodified, as the converter's task argument.
#[derive(Debug, Clone)]
pub struct AcquiredTask {
    raw: Vec<u8>,
    task: Task,
}

impl AcquiredTask {
    /// Parse a descriptor. A body that does not match the schema is fatal.
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self, WorkerError> {
        let task = serde_json::from_slice(&raw)
            .map_err(|source| WorkerError::MalformedTask { source })?;
        Ok(Self { raw, task })
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The raw descriptor as a command-line argument.
    pub fn raw_arg(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_descriptor() {
        let raw = br#"{"url":"http://cb/1","blob":{"url":"http://blob/1","nBytes":100},"extra":true}"#;
        let t = AcquiredTask::from_bytes(raw.to_vec()).unwrap();
        assert_eq!(t.task().callback_url, "http://cb/1");
        assert_eq!(t.task().blob.source_url.as_deref(), Some("http://blob/1"));
        assert_eq!(t.task().blob.declared_len, Some(100));
        assert_eq!(t.raw(), raw);
    }

    #[test]
    fn blob_is_optional() {
        let t = AcquiredTask::from_bytes(br#"{"url":"http://cb/2"}"#.to_vec()).unwrap();
        assert_eq!(t.task().blob, Blob::default());
    }

    #[test]
    fn missing_callback_is_fatal() {
        let err = AcquiredTask::from_bytes(br#"{"blob":{}}"#.to_vec()).unwrap_err();
        assert!(matches!(err, WorkerError::MalformedTask { .. }));
    }

    #[test]
    fn negative_length_is_fatal() {
        let err = AcquiredTask::from_bytes(br#"{"url":"x","blob":{"nBytes":-1}}"#.to_vec())
            .unwrap_err();
        assert!(matches!(err, WorkerError::MalformedTask { .. }));
    }

    #[test]
    fn raw_arg_is_verbatim() {
        let raw = "{ \"url\" : \"http://cb/3\" }";
        let t = AcquiredTask::from_bytes(raw.as_bytes().to_vec()).unwrap();
        assert_eq!(t.raw_arg(), raw);
    }
}
