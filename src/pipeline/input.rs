//! Blob delivery: stream the task's input to the converter.
//!
//! Two routes, one per [`crate::ConvertMode`]:
//!
//! * stream mode pipes the blob into the converter's stdin while it runs;
//! * single-file mode downloads it to [`INPUT_BLOB`] in the working directory
//!   before the converter starts.
//!
//! Neither route buffers the blob: chunks go from the HTTP response straight
//! to the pipe or file. Both check the byte count against the task's declared
//! length, because a silently truncated input produces a plausible but wrong
//! conversion.

use crate::error::TaskError;
use crate::task::Blob;
use futures::StreamExt;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// File name of the downloaded blob in single-file mode.
pub const INPUT_BLOB: &str = "input.blob";

/// Stream the blob into the converter's stdin, then close it.
///
/// Returns the number of bytes written. If the converter closes stdin early
/// (it does not need the whole blob) feeding stops quietly and the length is
/// not checked.
pub async fn feed_stdin<W>(
    client: reqwest::Client,
    blob: Blob,
    mut stdin: W,
) -> Result<u64, TaskError>
where
    W: AsyncWrite + Unpin,
{
    let Some(url) = blob.source_url.as_deref() else {
        debug!("Task has no blob; closing converter stdin");
        close_stdin(&mut stdin).await;
        return Ok(0);
    };

    let copied = match copy_blob(&client, url, &mut stdin).await {
        Ok(n) => n,
        Err(CopyError::Write(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!("Converter closed stdin before the blob ended");
            return Ok(0);
        }
        Err(e) => return Err(e.into_task_error(url)),
    };
    close_stdin(&mut stdin).await;

    check_length(&blob, copied)?;
    debug!(bytes = copied, "Blob piped to converter");
    Ok(copied)
}

// The converter may already have exited; nothing is lost if the close fails.
async fn close_stdin<W: AsyncWrite + Unpin>(stdin: &mut W) {
    if let Err(e) = stdin.shutdown().await {
        debug!(error = %e, "Could not close converter stdin");
    }
}

/// Download the blob to `dest`. A task without a blob writes nothing.
pub async fn download_to_file(
    client: &reqwest::Client,
    blob: &Blob,
    dest: &Path,
) -> Result<u64, TaskError> {
    let Some(url) = blob.source_url.as_deref() else {
        debug!("Task has no blob to download");
        return Ok(0);
    };
    info!("Downloading blob from: {}", url);

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| TaskError::BlobWriteFailed {
            reason: format!("{}: {e}", dest.display()),
        })?;
    let copied = copy_blob(client, url, &mut file)
        .await
        .map_err(|e| e.into_task_error(url))?;
    file.flush().await.map_err(|e| TaskError::BlobWriteFailed {
        reason: e.to_string(),
    })?;

    check_length(blob, copied)?;
    info!(bytes = copied, "Downloaded to: {}", dest.display());
    Ok(copied)
}

fn check_length(blob: &Blob, actual: u64) -> Result<(), TaskError> {
    match blob.declared_len {
        Some(declared) if declared != actual => {
            Err(TaskError::BlobLengthMismatch { declared, actual })
        }
        _ => Ok(()),
    }
}

#[derive(Debug)]
enum CopyError {
    Fetch(String),
    Write(std::io::Error),
}

impl CopyError {
    fn into_task_error(self, url: &str) -> TaskError {
        match self {
            CopyError::Fetch(reason) => TaskError::BlobFetchFailed {
                url: url.to_string(),
                reason,
            },
            CopyError::Write(e) => TaskError::BlobWriteFailed {
                reason: e.to_string(),
            },
        }
    }
}

async fn copy_blob<W>(client: &reqwest::Client, url: &str, dest: &mut W) -> Result<u64, CopyError>
where
    W: AsyncWrite + Unpin,
{
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| CopyError::Fetch(e.to_string()))?;

    if !response.status().is_success() {
        return Err(CopyError::Fetch(format!("HTTP {}", response.status())));
    }

    let mut body = response.bytes_stream();
    let mut copied = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| CopyError::Fetch(e.to_string()))?;
        dest.write_all(&chunk).await.map_err(CopyError::Write)?;
        copied += chunk.len() as u64;
    }
    Ok(copied)
}
