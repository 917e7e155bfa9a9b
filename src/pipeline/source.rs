//! Task acquisition: poll the coordinator until it hands out work.
//!
//! Only a few outcomes are worth retrying: "no work right now" (HTTP 204) and
//! network conditions that clear up on their own (the coordinator is not
//! listening yet, its name does not resolve yet, the request timed out). Every
//! other outcome means the coordinator and the worker disagree about the
//! protocol, and the worker stops rather than spinning.

use crate::config::{PollMethod, WorkerConfig};
use crate::error::WorkerError;
use crate::task::AcquiredTask;
use reqwest::StatusCode;
use std::error::Error as _;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Why a poll produced no task but may be repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    NoTask,
    ConnectionRefused,
    DnsLookupFailed,
    TimedOut,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RetryReason::NoTask => "no task available",
            RetryReason::ConnectionRefused => "connection refused",
            RetryReason::DnsLookupFailed => "host not resolvable",
            RetryReason::TimedOut => "request timed out",
        })
    }
}

/// Result of a single poll.
#[derive(Debug)]
pub enum PollOutcome {
    Task(AcquiredTask),
    Retry(RetryReason),
}

/// Polls one coordinator endpoint.
#[derive(Debug, Clone)]
pub struct TaskSource {
    client: reqwest::Client,
    url: String,
    method: PollMethod,
    backoff: Duration,
    timeout: Duration,
}

impl TaskSource {
    pub fn new(client: reqwest::Client, config: &WorkerConfig) -> Self {
        Self {
            client,
            url: config.poll_url.clone(),
            method: config.poll_method,
            backoff: Duration::from_secs(config.retry_backoff_secs),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Ask the coordinator for a task once.
    pub async fn poll_once(&self) -> Result<PollOutcome, WorkerError> {
        debug!(url = %self.url, "Polling for a task");
        let response = match self
            .client
            .request(self.method.into(), &self.url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return match classify_transport_error(&e) {
                    Some(reason) => Ok(PollOutcome::Retry(reason)),
                    None => Err(WorkerError::PollRequestFailed {
                        url: self.url.clone(),
                        source: e,
                    }),
                }
            }
        };

        match response.status() {
            StatusCode::NO_CONTENT => Ok(PollOutcome::Retry(RetryReason::NoTask)),
            StatusCode::OK | StatusCode::CREATED => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|source| WorkerError::PollBodyUnreadable { source })?;
                let task = AcquiredTask::from_bytes(body.to_vec())?;
                info!(callback = %task.task().callback_url, "Acquired task");
                Ok(PollOutcome::Task(task))
            }
            other => Err(WorkerError::UnexpectedPollStatus {
                status: other.as_u16(),
            }),
        }
    }

    /// Poll until a task arrives, sleeping the backoff between retries.
    pub async fn next_task(&self, cancel: &CancellationToken) -> Result<AcquiredTask, WorkerError> {
        loop {
            let outcome = tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                outcome = self.poll_once() => outcome?,
            };

            let reason = match outcome {
                PollOutcome::Task(task) => return Ok(task),
                PollOutcome::Retry(reason) => reason,
            };
            info!(
                %reason,
                "Will poll again in {}s",
                self.backoff.as_secs()
            );

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
    }
}

/// Map a transport failure to a retry reason, or `None` if it is fatal.
pub fn classify_transport_error(err: &reqwest::Error) -> Option<RetryReason> {
    if err.is_timeout() {
        return Some(RetryReason::TimedOut);
    }
    if !err.is_connect() {
        return None;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return Some(RetryReason::ConnectionRefused);
            }
        }
        let text = cause.to_string();
        if text.contains("dns error")
            || text.contains("failed to lookup address")
            || text.contains("no such host")
        {
            return Some(RetryReason::DnsLookupFailed);
        }
        source = cause.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source_for(url: String, method: PollMethod) -> TaskSource {
        let config = WorkerConfig::builder(url)
            .poll_method(method)
            .retry_backoff_secs(0)
            .build()
            .unwrap();
        TaskSource::new(reqwest::Client::new(), &config)
    }

    fn source_with_timeout(url: String, timeout_secs: u64) -> TaskSource {
        let config = WorkerConfig::builder(url)
            .retry_backoff_secs(0)
            .request_timeout_secs(timeout_secs)
            .build()
            .unwrap();
        TaskSource::new(reqwest::Client::new(), &config)
    }

    async fn coordinator(status: u16, body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/task"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn ok_returns_task() {
        let server = coordinator(200, r#"{"url":"http://cb/1"}"#).await;
        let outcome = source_for(format!("{}/task", server.uri()), PollMethod::Get)
            .poll_once()
            .await
            .unwrap();
        match outcome {
            PollOutcome::Task(t) => assert_eq!(t.task().callback_url, "http://cb/1"),
            other => panic!("expected task, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn created_also_returns_task() {
        let server = coordinator(201, r#"{"url":"http://cb/2"}"#).await;
        let outcome = source_for(format!("{}/task", server.uri()), PollMethod::Get)
            .poll_once()
            .await
            .unwrap();
        assert!(matches!(outcome, PollOutcome::Task(_)));
    }

    #[tokio::test]
    async fn no_content_is_retryable() {
        let server = coordinator(204, "").await;
        let outcome = source_for(format!("{}/task", server.uri()), PollMethod::Get)
            .poll_once()
            .await
            .unwrap();
        assert!(matches!(outcome, PollOutcome::Retry(RetryReason::NoTask)));
    }

    #[tokio::test]
    async fn other_status_is_fatal() {
        let server = coordinator(500, "boom").await;
        let err = source_for(format!("{}/task", server.uri()), PollMethod::Get)
            .poll_once()
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::UnexpectedPollStatus { status: 500 }));
    }

    #[tokio::test]
    async fn malformed_task_is_fatal() {
        let server = coordinator(200, "not json").await;
        let err = source_for(format!("{}/task", server.uri()), PollMethod::Get)
            .poll_once()
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::MalformedTask { .. }));
    }

    #[tokio::test]
    async fn post_method_is_used() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/task"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        source_for(format!("{}/task", server.uri()), PollMethod::Post)
            .poll_once()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = source_for(format!("http://{addr}/task"), PollMethod::Get)
            .poll_once()
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            PollOutcome::Retry(RetryReason::ConnectionRefused)
        ));
    }

    #[tokio::test]
    async fn unresolvable_host_is_retryable() {
        // .invalid never resolves (RFC 6761)
        let outcome = source_for(
            "http://convert-worker-no-such-host.invalid/task".into(),
            PollMethod::Get,
        )
        .poll_once()
        .await
        .unwrap();
        assert!(matches!(
            outcome,
            PollOutcome::Retry(RetryReason::DnsLookupFailed)
        ));
    }

    #[tokio::test]
    async fn slow_coordinator_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        let outcome = source_with_timeout(server.uri(), 1)
            .poll_once()
            .await
            .unwrap();
        assert!(matches!(outcome, PollOutcome::Retry(RetryReason::TimedOut)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn next_task_retries_until_work_arrives() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"url":"http://cb/3"}"#))
            .mount(&server)
            .await;

        let task = source_for(server.uri(), PollMethod::Get)
            .next_task(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(task.task().callback_url, "http://cb/3");
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let server = coordinator(204, "").await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = source_for(format!("{}/task", server.uri()), PollMethod::Get)
            .next_task(&cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
