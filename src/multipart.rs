//! Multipart wire format: boundary tokens, fragments and the close-delimiter.
//!
//! A fragment is rendered as
//!
//! ```text
//! --BOUNDARY\r\n
//! Content-Disposition: form-data; name="<name>"\r\n
//! \r\n
//! <body>\r\n
//! ```
//!
//! and a stream ends with the close-delimiter `--BOUNDARY--`. Because every
//! fragment body is followed by `\r\n`, each boundary after the first is
//! preceded by CRLF as RFC 2046 requires.

use crate::error::WorkerError;
use bytes::{BufMut, Bytes, BytesMut};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::fmt;

/// Length of a generated boundary token.
pub const BOUNDARY_LEN: usize = 50;

/// Longest boundary RFC 2046 allows.
pub const MAX_BOUNDARY_LEN: usize = 70;

/// Terminal fragment reporting success.
pub const DONE: &str = "done";
/// Terminal fragment reporting failure.
pub const ERROR: &str = "error";
/// Progress report fragment.
pub const PROGRESS: &str = "progress";

/// The multipart delimiter for one task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Boundary(String);

impl Boundary {
    /// Draw a fresh random token. Collisions with converter output are
    /// excluded by length, not by checking.
    pub fn generate() -> Self {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(BOUNDARY_LEN)
            .map(char::from)
            .collect();
        Self(token)
    }

    /// Use a caller-chosen token: 1 to 70 ASCII alphanumerics.
    pub fn new(token: impl Into<String>) -> Result<Self, WorkerError> {
        let token = token.into();
        if token.is_empty()
            || token.len() > MAX_BOUNDARY_LEN
            || !token.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(WorkerError::InvalidConfig(format!(
                "Boundary '{token}' must be 1-{MAX_BOUNDARY_LEN} alphanumeric characters"
            )));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `Content-Type` header value for a body delimited by this boundary.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary=\"{}\"", self.0)
    }

    /// Everything of a fragment up to (not including) its body.
    pub fn fragment_header(&self, name: &str) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.0.len() + name.len() + 48);
        buf.put_slice(b"--");
        buf.put_slice(self.0.as_bytes());
        buf.put_slice(b"\r\nContent-Disposition: form-data; name=\"");
        buf.put_slice(name.as_bytes());
        buf.put_slice(b"\"\r\n\r\n");
        buf.freeze()
    }

    /// A complete fragment, body and trailing CRLF included.
    pub fn fragment(&self, name: &str, body: &[u8]) -> Bytes {
        let header = self.fragment_header(name);
        let mut buf = BytesMut::with_capacity(header.len() + body.len() + 2);
        buf.put_slice(&header);
        buf.put_slice(body);
        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// `--BOUNDARY--`
    pub fn close_delimiter(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.0.len() + 4);
        buf.put_slice(b"--");
        buf.put_slice(self.0.as_bytes());
        buf.put_slice(b"--");
        buf.freeze()
    }

    /// An `error` fragment followed by the close-delimiter.
    pub fn error_and_close(&self, message: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(&self.fragment(ERROR, message.as_bytes()));
        buf.put_slice(&self.close_delimiter());
        buf.freeze()
    }

    /// An empty `done` fragment followed by the close-delimiter.
    pub fn done_and_close(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(&self.fragment(DONE, b""));
        buf.put_slice(&self.close_delimiter());
        buf.freeze()
    }
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
