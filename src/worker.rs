//! The worker loop: poll → run one attempt → repeat.
//!
//! An attempt owns four concurrent activities:
//!
//! ```text
//!  blob URL ──GET──▶ converter stdin           (stream mode only)
//!  converter stdout ──relay──▶ body channel ──POST──▶ callback URL
//!  converter stderr ──copy──▶ our stderr
//! ```
//!
//! The attempt completes only once all of them have finished, so nothing from
//! one task leaks into the next. The one exception is a blob feed still
//! running after the converter exited with a settled stream: it is aborted. Cancellation is checked wherever an attempt
//! can wait: polling, the backoff sleep, every stdout read, waiting for the
//! converter and waiting for the POST. On cancellation the converter gets
//! SIGINT and is reaped, and the in-flight upload is aborted.

use crate::config::{ConvertMode, WorkerConfig};
use crate::error::{TaskError, WorkerError};
use crate::multipart::Boundary;
use crate::pipeline::input::{self, INPUT_BLOB};
use crate::pipeline::relay::{self, BodyWriter, LineRelayEnd};
use crate::pipeline::runner::{self, ConverterPipes, ConverterProcess};
use crate::pipeline::scan::{BoundaryScanner, Terminal};
use crate::pipeline::sink::{self, Delivery, ResultSink};
use crate::pipeline::source::{PollOutcome, TaskSource};
use crate::task::AcquiredTask;
use crate::workdir::WorkDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How an attempt's result stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The stream carries a `done` fragment.
    Done,
    /// The converter wrote its own `error` fragment.
    ConverterFailed,
    /// The worker ended the stream with an `error` fragment.
    Failed(TaskError),
    /// The converter closed its stream without a terminal fragment. Relayed
    /// as-is.
    Unterminated,
}

/// Everything worth knowing about one finished attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub outcome: AttemptOutcome,
    /// `None` if the converter never ran, was killed, or died by a signal.
    pub exit_code: Option<i32>,
    /// Bytes handed to the request body.
    pub bytes_relayed: u64,
    pub delivery: Delivery,
}

struct Relayed {
    outcome: AttemptOutcome,
    exit_code: Option<i32>,
}

enum Prepared {
    Running(ConverterProcess, ConverterPipes),
    /// The blob was unusable; the converter is not started.
    Rejected(TaskError),
}

/// A conversion worker bound to one coordinator and one converter.
#[derive(Debug)]
pub struct Worker {
    config: WorkerConfig,
    client: reqwest::Client,
    source: TaskSource,
    sink: ResultSink,
    work_dir: WorkDir,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| WorkerError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            source: TaskSource::new(client.clone(), &config),
            sink: ResultSink::new(client.clone()),
            work_dir: WorkDir::new(&config.work_dir),
            client,
            config,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Process tasks until a fatal error or cancellation.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        info!(
            url = %self.source.url(),
            converter = %self.config.converter_name(),
            mode = ?self.config.mode,
            "Worker started"
        );
        loop {
            let task = self.source.next_task(cancel).await?;
            let report = self.run_attempt(&task, cancel).await?;
            log_report(&report);
        }
    }

    /// Poll once without backoff; run the task if one was handed out.
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<AttemptReport>, WorkerError> {
        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            outcome = self.source.poll_once() => outcome?,
        };
        match outcome {
            PollOutcome::Retry(reason) => {
                info!(%reason, "No task acquired");
                Ok(None)
            }
            PollOutcome::Task(task) => {
                let report = self.run_attempt(&task, cancel).await?;
                log_report(&report);
                Ok(Some(report))
            }
        }
    }

    /// Run one task: start the converter, relay its output to the callback
    /// URL, and wait for everything to finish.
    ///
    /// Task-level problems end up in the result stream and the report. Only
    /// fatal problems and cancellation are returned as errors.
    pub async fn run_attempt(
        &self,
        task: &AcquiredTask,
        cancel: &CancellationToken,
    ) -> Result<AttemptReport, WorkerError> {
        self.work_dir.prepare().await?;
        let boundary = Boundary::generate();
        info!(callback = %task.task().callback_url, "Starting attempt");

        // Everything that can fail fatally happens before the POST opens.
        let prepared = match self.config.mode {
            ConvertMode::Stream => {
                let args = vec![boundary.to_string(), task.raw_arg()];
                let (process, pipes) = self.spawn(&args, true)?;
                Prepared::Running(process, pipes)
            }
            ConvertMode::SingleFile => match self.stage_blob(task, cancel).await? {
                Ok(()) => {
                    let (process, pipes) = self.spawn(&[task.raw_arg()], false)?;
                    Prepared::Running(process, pipes)
                }
                Err(e) => Prepared::Rejected(e),
            },
        };

        let (mut writer, body) = BodyWriter::channel(self.config.body_channel_capacity);
        let mut delivery = {
            let sink = self.sink.clone();
            let url = task.task().callback_url.clone();
            let boundary = boundary.clone();
            tokio::spawn(async move { sink.deliver(&url, &boundary, body).await })
        };

        let relayed = match prepared {
            Prepared::Rejected(e) => {
                warn!(error = %e, "Blob unusable; converter not started");
                writer.write(boundary.error_and_close(&e.to_string())).await;
                Ok(Relayed {
                    outcome: AttemptOutcome::Failed(e),
                    exit_code: None,
                })
            }
            Prepared::Running(process, pipes) => match self.config.mode {
                ConvertMode::Stream => {
                    self.relay_stream(task, &boundary, process, pipes, &mut writer, cancel)
                        .await
                }
                ConvertMode::SingleFile => {
                    self.relay_single_file(&boundary, process, pipes, &mut writer, cancel)
                        .await
                }
            },
        };

        let relayed = match relayed {
            Ok(r) => r,
            Err(e) => {
                writer.abort("attempt interrupted");
                delivery.abort();
                return Err(e);
            }
        };
        let bytes_relayed = writer.bytes_relayed();
        // closing the channel ends the request body
        drop(writer);

        let joined = tokio::select! {
            biased;

            _ = cancel.cancelled() => None,
            joined = &mut delivery => Some(joined),
        };
        let Some(joined) = joined else {
            delivery.abort();
            return Err(WorkerError::Cancelled);
        };
        let delivery = joined.unwrap_or_else(|e| Delivery::Failed {
            reason: format!("delivery task failed: {e}"),
        });

        Ok(AttemptReport {
            outcome: relayed.outcome,
            exit_code: relayed.exit_code,
            bytes_relayed,
            delivery,
        })
    }

    fn spawn(
        &self,
        args: &[String],
        pipe_stdin: bool,
    ) -> Result<(ConverterProcess, ConverterPipes), WorkerError> {
        ConverterProcess::spawn(
            &self.config.converter_path,
            args,
            self.work_dir.path(),
            pipe_stdin,
        )
    }

    async fn stage_blob(
        &self,
        task: &AcquiredTask,
        cancel: &CancellationToken,
    ) -> Result<Result<(), TaskError>, WorkerError> {
        let dest = self.work_dir.join(INPUT_BLOB);
        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(WorkerError::Cancelled),
            staged = input::download_to_file(&self.client, &task.task().blob, &dest) => {
                Ok(staged.map(|_| ()))
            }
        }
    }

    /// Stream mode: the converter writes a complete multipart stream.
    async fn relay_stream(
        &self,
        task: &AcquiredTask,
        boundary: &Boundary,
        mut process: ConverterProcess,
        pipes: ConverterPipes,
        writer: &mut BodyWriter,
        cancel: &CancellationToken,
    ) -> Result<Relayed, WorkerError> {
        let ConverterPipes {
            stdin,
            stdout,
            stderr,
        } = pipes;
        let stderr_task = tokio::spawn(runner::pass_through_stderr(stderr));
        let mut feed = tokio::spawn(match stdin {
            Some(stdin) => {
                let fed = input::feed_stdin(self.client.clone(), task.task().blob.clone(), stdin);
                futures::future::Either::Left(fed)
            }
            None => futures::future::Either::Right(async { Ok(0) }),
        });
        let feed_abort = feed.abort_handle();

        let mut scanner = BoundaryScanner::new(boundary)?;
        let read = tokio::select! {
            biased;

            _ = cancel.cancelled() => None,
            read = relay::relay_passive(stdout, &mut scanner, writer, self.config.read_buffer_size) => Some(read),
        };
        let Some(read) = read else {
            feed_abort.abort();
            process.interrupt().await;
            return Err(WorkerError::Cancelled);
        };
        let read_failure = match read {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "Lost converter stdout; stopping converter");
                process.kill().await;
                Some(TaskError::OutputUnreadable {
                    program: process.program().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let status = match process.wait(cancel).await {
            Ok(status) => status,
            Err(e) => {
                feed_abort.abort();
                return Err(e);
            }
        };
        // The converter is gone, so a feed still running can deliver nothing
        // more. Once its stream is settled the blob cannot change the result.
        let settled = scanner.terminal().is_some() || scanner.is_closed();
        let fed = if settled && !feed.is_finished() {
            debug!("Converter finished its stream; abandoning blob feed");
            feed_abort.abort();
            Ok(0)
        } else {
            let fed = tokio::select! {
                biased;

                _ = cancel.cancelled() => None,
                fed = &mut feed => Some(fed),
            };
            let Some(fed) = fed else {
                feed_abort.abort();
                return Err(WorkerError::Cancelled);
            };
            fed.unwrap_or_else(|e| {
                Err(TaskError::BlobWriteFailed {
                    reason: format!("blob feed task failed: {e}"),
                })
            })
        };
        if stderr_task.await.is_err() {
            warn!("Converter stderr task panicked");
        }

        let exit = runner::exit_failure(process.program(), status);
        let failure = read_failure.or(fed.err()).or(exit.clone());

        let outcome = match (scanner.terminal(), scanner.is_closed()) {
            (Some(Terminal::Done), _) => AttemptOutcome::Done,
            (Some(Terminal::Error), _) => AttemptOutcome::ConverterFailed,
            (None, true) => AttemptOutcome::Unterminated,
            (None, false) => AttemptOutcome::Failed(failure.clone().unwrap_or_else(|| {
                TaskError::MissingTerminalFragment {
                    program: process.program().to_string(),
                }
            })),
        };
        if let (Some(e), Some(_)) = (&failure, scanner.terminal()) {
            warn!(error = %e, "Converter failed after writing its result");
        }

        let message = match &outcome {
            AttemptOutcome::Failed(e) => e.to_string(),
            _ => String::new(),
        };
        writer.write(scanner.finish(&message)).await;

        Ok(Relayed {
            outcome,
            exit_code: status.code(),
        })
    }

    /// Single-file mode: progress lines on stdout, results in fixed files.
    async fn relay_single_file(
        &self,
        boundary: &Boundary,
        mut process: ConverterProcess,
        pipes: ConverterPipes,
        writer: &mut BodyWriter,
        cancel: &CancellationToken,
    ) -> Result<Relayed, WorkerError> {
        let ConverterPipes { stdout, stderr, .. } = pipes;
        let stderr_task = tokio::spawn(runner::pass_through_stderr(stderr));
        let program = process.program().to_string();

        let lines = tokio::select! {
            biased;

            _ = cancel.cancelled() => None,
            lines = relay::relay_lines(stdout, boundary, writer) => Some(lines),
        };
        let Some(lines) = lines else {
            process.interrupt().await;
            return Err(WorkerError::Cancelled);
        };

        let relayed = match lines {
            Ok(LineRelayEnd::Reported(e)) => {
                process.kill().await;
                Relayed {
                    outcome: AttemptOutcome::Failed(e),
                    exit_code: None,
                }
            }
            Err(e) => {
                let e = TaskError::OutputUnreadable {
                    program,
                    reason: e.to_string(),
                };
                writer.write(boundary.error_and_close(&e.to_string())).await;
                process.kill().await;
                Relayed {
                    outcome: AttemptOutcome::Failed(e),
                    exit_code: None,
                }
            }
            Ok(LineRelayEnd::Eof) => {
                let status = process.wait(cancel).await?;
                let outcome = match runner::exit_failure(&program, status) {
                    Some(e) => {
                        writer.write(boundary.error_and_close(&e.to_string())).await;
                        AttemptOutcome::Failed(e)
                    }
                    None => self.finish_with_artifacts(boundary, writer, &program, cancel).await?,
                };
                Relayed {
                    outcome,
                    exit_code: status.code(),
                }
            }
        };

        if stderr_task.await.is_err() {
            warn!("Converter stderr task panicked");
        }
        Ok(relayed)
    }

    async fn finish_with_artifacts(
        &self,
        boundary: &Boundary,
        writer: &mut BodyWriter,
        program: &str,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome, WorkerError> {
        let appended = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            appended = sink::append_artifacts(
                self.work_dir.path(),
                boundary,
                writer,
                self.config.read_buffer_size,
                program,
            ) => appended,
        };
        Ok(match appended {
            Ok(()) => {
                writer.write(boundary.done_and_close()).await;
                AttemptOutcome::Done
            }
            Err(e) => {
                writer.write(boundary.error_and_close(&e.to_string())).await;
                AttemptOutcome::Failed(e)
            }
        })
    }
}

fn log_report(report: &AttemptReport) {
    let AttemptReport {
        outcome,
        exit_code,
        bytes_relayed,
        delivery,
    } = report;
    match outcome {
        AttemptOutcome::Done => {
            info!(?exit_code, bytes_relayed, ?delivery, "Attempt finished")
        }
        AttemptOutcome::ConverterFailed => {
            info!(?exit_code, bytes_relayed, ?delivery, "Attempt finished; converter reported an error")
        }
        AttemptOutcome::Failed(e) => {
            warn!(error = %e, ?exit_code, bytes_relayed, ?delivery, "Attempt failed")
        }
        AttemptOutcome::Unterminated => {
            warn!(?exit_code, bytes_relayed, ?delivery, "Attempt finished without a terminal fragment")
        }
    }
}
