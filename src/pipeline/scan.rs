//! Incremental boundary scanning over a converter's own multipart stream.
//!
//! The converter writes a complete multipart body to stdout. We forward its
//! bytes as soon as they arrive but still need to notice two things:
//!
//! 1. a `done` / `error` fragment header (the stream reached its terminal
//!    fragment), and
//! 2. the close-delimiter `--BOUNDARY--` (everything after it is garbage).
//!
//! Both patterns start with `\r\n--BOUNDARY`, so one regex finds the earliest
//! of either. A pattern can be split across two reads, so the last
//! [`MAX_RETAINED`] bytes of every scanned window are kept and re-scanned
//! in front of the next chunk. Those bytes have already been emitted; they are
//! retained for matching only. Memory is therefore one chunk plus at most
//! 200 bytes, whatever the stream length.
//!
//! The very first window starts with a synthetic `\r\n` (counted as already
//! emitted) so a boundary at byte 0 of the stream matches the same pattern as
//! every later one.

use crate::error::WorkerError;
use crate::multipart::{Boundary, MAX_BOUNDARY_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use regex::bytes::Regex;
use tracing::{debug, warn};

/// Bytes kept from one window to the next.
///
/// The longest match is `\r\n--` + boundary (≤ 70) + a terminal header with
/// bounded whitespace, well under this.
pub const MAX_RETAINED: usize = 200;

/// Which terminal fragment the converter emitted last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Done,
    Error,
}

/// Relay state for one converter stdout stream.
#[derive(Debug, Clone)]
pub struct BoundaryScanner {
    boundary: Boundary,
    pattern: Regex,
    close_match_len: usize,
    retained: Vec<u8>,
    terminal: Option<Terminal>,
    closed: bool,
}

impl BoundaryScanner {
    pub fn new(boundary: &Boundary) -> Result<Self, WorkerError> {
        debug_assert!(boundary.as_str().len() <= MAX_BOUNDARY_LEN);
        let b = regex::escape(boundary.as_str());
        let pattern = format!(
            r#"\r\n--{b}(?:--|\r\n(?i:content-disposition)[ \t]{{0,16}}:[ \t]{{0,16}}(?i:form-data);[ \t]{{0,16}}(?i:name=(?:"done"|"error"|done|error))\r\n\r\n)"#
        );
        let pattern = Regex::new(&pattern)
            .map_err(|e| WorkerError::Internal(format!("boundary pattern: {e}")))?;

        Ok(Self {
            boundary: boundary.clone(),
            pattern,
            close_match_len: 2 + boundary.as_str().len() + 4,
            retained: b"\r\n".to_vec(),
            terminal: None,
            closed: false,
        })
    }

    /// Scan the next chunk of converter output; return the bytes to forward.
    ///
    /// Once the close-delimiter has been forwarded every further chunk is
    /// discarded.
    pub fn feed(&mut self, chunk: &[u8]) -> Bytes {
        if self.closed || chunk.is_empty() {
            return Bytes::new();
        }

        let mut window = std::mem::take(&mut self.retained);
        // window[..written] has already been forwarded (or is the synthetic CRLF)
        let mut written = window.len();
        window.extend_from_slice(chunk);

        let mut out = BytesMut::with_capacity(chunk.len());
        let mut pos = 0;

        loop {
            let Some(m) = self.pattern.find_at(&window, pos) else {
                out.put_slice(&window[written..]);
                let keep = (window.len() - pos).min(MAX_RETAINED);
                self.retained = window[window.len() - keep..].to_vec();
                break;
            };

            let end = m.end().max(written);
            out.put_slice(&window[written..end]);
            written = end;

            if m.len() == self.close_match_len {
                self.closed = true;
                if self.terminal.is_none() {
                    warn!("Converter closed its stream without a 'done' or 'error' fragment");
                }
                break;
            }

            let header = &m.as_bytes()[self.close_match_len - 2..];
            let terminal = if header.to_ascii_lowercase().windows(5).any(|w| w == b"error") {
                Terminal::Error
            } else {
                Terminal::Done
            };
            debug!(?terminal, "Terminal fragment header seen");
            self.terminal = Some(terminal);
            pos = m.end();
        }

        out.freeze()
    }

    /// Bytes to append once the converter's stdout hit end-of-stream.
    ///
    /// * closed → nothing; the stream's own shape stands.
    /// * terminal fragment but no close-delimiter → the close-delimiter.
    /// * neither → an `error` fragment carrying `message`, then the
    ///   close-delimiter.
    pub fn finish(&mut self, message: &str) -> Bytes {
        if self.closed {
            return Bytes::new();
        }
        self.closed = true;
        self.retained.clear();

        let mut out = BytesMut::new();
        out.put_slice(b"\r\n");
        if self.terminal.is_some() {
            warn!("Converter did not output its closing delimiter; adding it");
            out.put_slice(&self.boundary.close_delimiter());
        } else {
            out.put_slice(&self.boundary.error_and_close(message));
        }
        out.freeze()
    }

    pub fn terminal(&self) -> Option<Terminal> {
        self.terminal
    }

    pub fn terminal_seen(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }
}
