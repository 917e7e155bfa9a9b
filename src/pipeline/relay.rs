//! Converter stdout → HTTP request body.
//!
//! The relay never holds more than one read buffer of converter output. Bytes
//! flow through a bounded channel into the streaming request body; when the
//! callback endpoint is slow the channel fills, [`BodyWriter::write`] blocks,
//! and we stop reading stdout until it drains.

use crate::error::TaskError;
use crate::multipart::{Boundary, PROGRESS};
use crate::pipeline::scan::BoundaryScanner;
use crate::progress::{classify, ConverterLine};
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// One item of the request body.
pub type BodyChunk = Result<Bytes, std::io::Error>;

/// The receiving half: handed to `reqwest::Body::wrap_stream`.
pub type BodyStream = ReceiverStream<BodyChunk>;

/// Sending half of the request-body channel.
#[derive(Debug)]
pub struct BodyWriter {
    tx: mpsc::Sender<BodyChunk>,
    relayed: u64,
    detached: bool,
}

impl BodyWriter {
    /// Create a writer and the body stream it feeds. `capacity` is in chunks.
    pub fn channel(capacity: usize) -> (Self, BodyStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = Self {
            tx,
            relayed: 0,
            detached: false,
        };
        (writer, ReceiverStream::new(rx))
    }

    /// Queue bytes for the request body, waiting while the channel is full.
    ///
    /// If the request has already gone away the bytes are dropped. The caller
    /// keeps draining the converter so it is never blocked on a full pipe.
    pub async fn write(&mut self, bytes: Bytes) {
        if bytes.is_empty() || self.detached {
            return;
        }
        let len = bytes.len() as u64;
        if self.tx.send(Ok(bytes)).await.is_err() {
            warn!(
                relayed = self.relayed,
                "Result upload ended early; discarding further converter output"
            );
            self.detached = true;
            return;
        }
        self.relayed += len;
    }

    /// Fail the request body so the upload does not complete as if the
    /// stream were whole.
    pub fn abort(self, reason: &str) {
        let err = std::io::Error::new(std::io::ErrorKind::Interrupted, reason.to_string());
        // A full channel is fine: the delivery task is aborted right after.
        let _ = self.tx.try_send(Err(err));
    }

    /// Bytes accepted into the body so far.
    pub fn bytes_relayed(&self) -> u64 {
        self.relayed
    }

    /// Whether the receiving side has gone away.
    pub fn is_detached(&self) -> bool {
        self.detached
    }
}

/// Relay a converter's own multipart stream verbatim, watching for its
/// terminal fragment and close-delimiter.
///
/// Reads until end-of-stream even after the close-delimiter, discarding, so
/// the converter never blocks writing to a pipe nobody reads.
pub async fn relay_passive<R>(
    mut stdout: R,
    scanner: &mut BoundaryScanner,
    writer: &mut BodyWriter,
    buffer_size: usize,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut discarded = 0u64;
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if scanner.is_closed() {
            discarded += n as u64;
            continue;
        }
        let out = scanner.feed(&buf[..n]);
        writer.write(out).await;
    }
    if discarded > 0 {
        warn!(discarded, "Converter wrote output after its closing delimiter");
    }
    Ok(())
}

/// Longest single-file converter line accepted, excluding the line ending.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// How much of an over-long line is quoted back in the `error` fragment.
const QUOTED_PREFIX_LEN: usize = 200;

/// How a line-reformatting relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRelayEnd {
    /// stdout reached end-of-stream; no terminal fragment written yet.
    Eof,
    /// The converter printed an error line. An `error` fragment and the
    /// close-delimiter have already been written.
    Reported(TaskError),
}

/// Rewrite single-file converter lines into `progress` fragments.
///
/// Lines end at `\n`; one trailing `\r` is stripped and blank lines are
/// skipped. The first line that is not a progress report ends the relay, as
/// does a line longer than [`MAX_LINE_LEN`].
pub async fn relay_lines<R>(
    stdout: R,
    boundary: &Boundary,
    writer: &mut BodyWriter,
) -> std::io::Result<LineRelayEnd>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match read_bounded_line(&mut reader, &mut raw, MAX_LINE_LEN).await? {
            LineRead::Eof => return Ok(LineRelayEnd::Eof),
            LineRead::TooLong => {
                let prefix = &raw[..raw.len().min(QUOTED_PREFIX_LEN)];
                let e = TaskError::ConverterLineTooLong {
                    limit: MAX_LINE_LEN,
                    prefix: String::from_utf8_lossy(prefix).into_owned(),
                };
                warn!(limit = MAX_LINE_LEN, "Converter wrote an over-long line");
                writer.write(boundary.error_and_close(&e.to_string())).await;
                return Ok(LineRelayEnd::Reported(e));
            }
            LineRead::Line => {}
        }

        let text = String::from_utf8_lossy(&raw);
        let line = text.strip_suffix('\r').unwrap_or(text.as_ref());
        if line.is_empty() {
            continue;
        }

        match classify(line) {
            ConverterLine::Message(message) => {
                debug!(%message, "Converter reported an error");
                writer.write(boundary.error_and_close(&message)).await;
                return Ok(LineRelayEnd::Reported(TaskError::ConverterReportedError(
                    message,
                )));
            }
            progress => {
                if let Some(body) = progress.progress_body() {
                    writer
                        .write(boundary.fragment(PROGRESS, body.as_bytes()))
                        .await;
                }
            }
        }
    }
}

enum LineRead {
    Line,
    TooLong,
    Eof,
}

/// Read one line into `line` without its `\n`, keeping at most `limit` bytes.
///
/// On `TooLong`, `line` holds the first `limit` bytes and the reader is left
/// somewhere inside the line.
async fn read_bounded_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if line.is_empty() {
                LineRead::Eof
            } else {
                LineRead::Line
            });
        }
        let newline = available.iter().position(|&b| b == b'\n');
        let content = newline.unwrap_or(available.len());
        if line.len() + content > limit {
            let keep = limit - line.len();
            line.extend_from_slice(&available[..keep]);
            reader.consume(keep);
            return Ok(LineRead::TooLong);
        }
        line.extend_from_slice(&available[..content]);
        match newline {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(LineRead::Line);
            }
            None => reader.consume(content),
        }
    }
}
