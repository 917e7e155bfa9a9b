//! Converter subprocess lifecycle.

use crate::error::{TaskError, WorkerError};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The converter's standard streams, taken from the child once.
#[derive(Debug)]
pub struct ConverterPipes {
    /// `None` unless the blob is fed on stdin.
    pub stdin: Option<ChildStdin>,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// A running converter.
#[derive(Debug)]
pub struct ConverterProcess {
    child: Child,
    program: String,
}

impl ConverterProcess {
    /// Start `path args...` inside `work_dir`.
    ///
    /// A missing or non-executable binary is fatal: no result stream is
    /// opened and the worker stops.
    pub fn spawn(
        path: &Path,
        args: &[String],
        work_dir: &Path,
        pipe_stdin: bool,
    ) -> Result<(Self, ConverterPipes), WorkerError> {
        let mut cmd = Command::new(path);
        cmd.args(args)
            .current_dir(work_dir)
            .stdin(if pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                WorkerError::ConverterNotFound {
                    path: path.to_path_buf(),
                }
            }
            _ => WorkerError::ConverterSpawnFailed {
                path: path.to_path_buf(),
                source,
            },
        })?;

        let missing = |what: &str| WorkerError::Internal(format!("converter {what} was not piped"));
        let pipes = ConverterPipes {
            stdin: child.stdin.take(),
            stdout: child.stdout.take().ok_or_else(|| missing("stdout"))?,
            stderr: child.stderr.take().ok_or_else(|| missing("stderr"))?,
        };

        info!(pid = child.id(), program = %path.display(), "Converter started");
        Ok((
            Self {
                child,
                program: path.display().to_string(),
            },
            pipes,
        ))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Wait for the converter to exit. On cancellation, interrupt it first
    /// and still wait, so it never outlives the attempt.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<ExitStatus, WorkerError> {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {}
            status = self.child.wait() => {
                return status.map_err(|source| WorkerError::ConverterWaitFailed { source });
            }
        }
        self.interrupt().await;
        Err(WorkerError::Cancelled)
    }

    /// Ask the converter to stop (SIGINT where available) and reap it.
    pub async fn interrupt(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let signalled = self
                .child
                .id()
                .and_then(|pid| i32::try_from(pid).ok())
                .map(|pid| kill(Pid::from_raw(pid), Signal::SIGINT));
            match signalled {
                Some(Ok(())) => debug!("Sent SIGINT to converter"),
                Some(Err(e)) => {
                    warn!(error = %e, "Could not signal converter; killing it");
                    if let Err(e) = self.child.start_kill() {
                        debug!(error = %e, "Converter already gone");
                    }
                }
                None => {}
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = self.child.start_kill() {
                debug!(error = %e, "Converter already gone");
            }
        }
        self.reap().await;
    }

    /// Kill the converter outright and reap it.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "Converter already gone");
        }
        self.reap().await;
    }

    async fn reap(&mut self) {
        match self.child.wait().await {
            Ok(status) => info!(%status, "Converter stopped"),
            Err(e) => warn!(error = %e, "Could not reap converter"),
        }
    }
}

/// The task-level failure an exit status represents, if any.
pub fn exit_failure(program: &str, status: ExitStatus) -> Option<TaskError> {
    if status.success() {
        return None;
    }
    Some(match status.code() {
        Some(code) => TaskError::ConverterExited {
            program: program.to_string(),
            code,
        },
        None => TaskError::ConverterKilled {
            program: program.to_string(),
        },
    })
}

/// Copy the converter's stderr to ours until it closes.
pub async fn pass_through_stderr(mut stderr: ChildStderr) {
    let mut out = tokio::io::stderr();
    if let Err(e) = tokio::io::copy(&mut stderr, &mut out).await {
        warn!(error = %e, "Lost converter stderr");
    }
}
