//! Result delivery: one streaming POST per attempt.

use crate::error::TaskError;
use crate::multipart::Boundary;
use crate::pipeline::relay::{BodyStream, BodyWriter};
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Files a single-file converter leaves in the working directory, in the
/// order they are appended to the result stream.
pub const ARTIFACTS: &[Artifact] = &[
    Artifact::required("0.json"),
    Artifact::optional("0-thumbnail.png"),
    Artifact::optional("0-thumbnail.jpg"),
    Artifact::optional("0.txt"),
    Artifact::required("0.blob"),
];

/// A named output file; its name doubles as its fragment name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Artifact {
    pub name: &'static str,
    pub required: bool,
}

impl Artifact {
    const fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
        }
    }

    const fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
        }
    }
}

/// How the coordinator received an attempt's result stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// 2xx response.
    Accepted { status: u16 },
    /// The request completed but the coordinator refused it.
    Rejected { status: u16 },
    /// The request itself failed.
    Failed { reason: String },
}

impl Delivery {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Delivery::Accepted { .. })
    }
}

/// POSTs result streams to task callback URLs.
#[derive(Debug, Clone)]
pub struct ResultSink {
    client: reqwest::Client,
}

impl ResultSink {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Send `body` to `url` as it is produced.
    ///
    /// Failures are logged and reported, never raised: the coordinator is
    /// expected to notice a missing or truncated result on its own.
    pub async fn deliver(&self, url: &str, boundary: &Boundary, body: BodyStream) -> Delivery {
        debug!(%url, "Opening result stream");
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, boundary.content_type())
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(%url, error = %e, "Failed to deliver result");
                return Delivery::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let status = response.status();
        // drain so the connection can be reused
        if let Err(e) = response.bytes().await {
            debug!(%url, error = %e, "Could not read callback response body");
        }
        if status.is_success() {
            info!(%url, status = status.as_u16(), "Result delivered");
            Delivery::Accepted {
                status: status.as_u16(),
            }
        } else {
            warn!(%url, status = status.as_u16(), "Coordinator rejected result");
            Delivery::Rejected {
                status: status.as_u16(),
            }
        }
    }
}

/// Append every artifact in [`ARTIFACTS`] that exists in `dir` as a fragment.
///
/// Each file is read in `chunk_size` pieces. A missing required artifact
/// stops the sequence; the caller ends the stream with an `error` fragment.
pub async fn append_artifacts(
    dir: &Path,
    boundary: &Boundary,
    writer: &mut BodyWriter,
    chunk_size: usize,
    program: &str,
) -> Result<(), TaskError> {
    for artifact in ARTIFACTS {
        let path = dir.join(artifact.name);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if artifact.required {
                    return Err(TaskError::MissingArtifact {
                        program: program.to_string(),
                        name: artifact.name.to_string(),
                    });
                }
                debug!(name = artifact.name, "Optional artifact absent");
                continue;
            }
            Err(e) => {
                return Err(TaskError::ArtifactUnreadable {
                    name: artifact.name.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        writer.write(boundary.fragment_header(artifact.name)).await;
        let mut buf = vec![0u8; chunk_size];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    // end the half-written fragment so the error fragment parses
                    writer.write(Bytes::from_static(b"\r\n")).await;
                    return Err(TaskError::ArtifactUnreadable {
                        name: artifact.name.to_string(),
                        reason: e.to_string(),
                    });
                }
            };
            writer.write(Bytes::copy_from_slice(&buf[..n])).await;
        }
        writer.write(Bytes::from_static(b"\r\n")).await;
        debug!(name = artifact.name, "Artifact appended");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn boundary() -> Boundary {
        Boundary::new("SinkBoundary42").unwrap()
    }

    async fn drain(stream: BodyStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn artifacts_in_order_optional_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0.blob"), vec![9u8; 1000]).unwrap();
        std::fs::write(dir.path().join("0.txt"), "text").unwrap();
        std::fs::write(dir.path().join("0.json"), "{}").unwrap();

        let (mut writer, body) = BodyWriter::channel(64);
        append_artifacts(dir.path(), &boundary(), &mut writer, 256, "conv")
            .await
            .unwrap();
        drop(writer);

        let b = boundary();
        let mut expected = Vec::new();
        expected.extend_from_slice(&b.fragment("0.json", b"{}"));
        expected.extend_from_slice(&b.fragment("0.txt", b"text"));
        expected.extend_from_slice(&b.fragment("0.blob", &[9u8; 1000]));
        assert_eq!(drain(body).await, expected);
    }

    #[tokio::test]
    async fn missing_required_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0.blob"), b"x").unwrap();

        let (mut writer, _body) = BodyWriter::channel(64);
        let err = append_artifacts(dir.path(), &boundary(), &mut writer, 256, "conv")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "conv did not output 0.json");
        assert_eq!(writer.bytes_relayed(), 0);
    }

    #[tokio::test]
    async fn deliver_posts_streamed_body() {
        let server = MockServer::start().await;
        let b = boundary();
        Mock::given(method("POST"))
            .and(path("/result"))
            .and(header("content-type", b.content_type().as_str()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let (mut writer, body) = BodyWriter::channel(2);
        let sink = ResultSink::new(reqwest::Client::new());
        let url = format!("{}/result", server.uri());
        let delivery = tokio::spawn({
            let b = b.clone();
            async move { sink.deliver(&url, &b, body).await }
        });
        for _ in 0..8 {
            writer.write(Bytes::from_static(b"0123456789")).await;
        }
        writer.write(b.done_and_close()).await;
        drop(writer);

        assert_eq!(delivery.await.unwrap(), Delivery::Accepted { status: 204 });
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].body.ends_with(b.close_delimiter().as_ref()));
        assert!(requests[0].body.starts_with(b"0123456789"));
        assert_eq!(requests[0].body.len(), 80 + b.done_and_close().len());
    }

    #[tokio::test]
    async fn rejected_delivery_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (writer, body) = BodyWriter::channel(1);
        drop(writer);
        let delivery = ResultSink::new(reqwest::Client::new())
            .deliver(&format!("{}/r", server.uri()), &boundary(), body)
            .await;
        assert_eq!(delivery, Delivery::Rejected { status: 500 });
    }

    #[tokio::test]
    async fn unreachable_callback_is_a_failed_delivery() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_writer, body) = BodyWriter::channel(1);
        let delivery = ResultSink::new(reqwest::Client::new())
            .deliver(&format!("http://{addr}/r"), &boundary(), body)
            .await;
        assert!(matches!(delivery, Delivery::Failed { .. }));
    }
}
