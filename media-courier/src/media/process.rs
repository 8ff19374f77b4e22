//! Running external tools under a timeout and a cancellation token.
//!
//! Whichever comes first wins: process exit, timeout, or cancellation. On
//! timeout or cancellation the child gets a terminate signal, a grace
//! period, then a kill.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use process_utils::{TerminationOutcome, terminate_gracefully, tokio_command};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Bytes of stderr kept for diagnostics.
const STDERR_TAIL_BYTES: usize = 4096;

/// What to run and how long to let it run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Label used in logs and timeout errors.
    pub operation: &'static str,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub timeout: Option<Duration>,
    pub grace: Duration,
    pub capture_stdout: bool,
}

impl ProcessSpec {
    pub fn new(operation: &'static str, program: impl Into<PathBuf>) -> Self {
        Self {
            operation,
            program: program.into(),
            args: Vec::new(),
            timeout: None,
            grace: Duration::from_secs(5),
            capture_stdout: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }
}

/// Output of a process that ran to completion.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    /// Last few KiB of stderr, lossily decoded.
    pub stderr_tail: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

enum Interrupt {
    Timeout(Duration),
    Cancelled,
}

/// Run a process to completion.
///
/// Returns [`Error::Cancelled`] when `cancel` fires first and
/// [`Error::Timeout`] when the timeout elapses first. A non-zero exit is not
/// an error here; callers decide what it means.
pub async fn run(spec: &ProcessSpec, cancel: Option<&CancellationToken>) -> Result<ProcessOutput> {
    if cancel.is_some_and(|c| c.is_cancelled()) {
        return Err(Error::Cancelled);
    }

    let mut cmd = tokio_command(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(if spec.capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::io_path("spawning", &spec.program, e))?;
    debug!(operation = spec.operation, pid = ?child.id(), "Spawned process");

    let stdout_task = child.stdout.take().map(spawn_read_all);
    let stderr_task = child.stderr.take().map(spawn_read_tail);

    let deadline = async {
        match spec.timeout {
            Some(timeout) => {
                tokio::time::sleep(timeout).await;
                timeout
            }
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => Ok(status),
        timeout = deadline => Err(Interrupt::Timeout(timeout)),
        _ = cancelled => Err(Interrupt::Cancelled),
    };

    match outcome {
        Ok(status) => {
            let status = status.map_err(|e| Error::io_path("waiting for", &spec.program, e))?;
            let stdout = match stdout_task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };
            let stderr_tail = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            if !status.success() {
                debug!(
                    operation = spec.operation,
                    code = ?status.code(),
                    stderr = %stderr_tail,
                    "Process exited with failure"
                );
            }
            Ok(ProcessOutput {
                status,
                stdout,
                stderr_tail,
            })
        }
        Err(interrupt) => {
            let outcome = terminate_gracefully(&mut child, spec.grace).await;
            if let Some(task) = stdout_task {
                task.abort();
            }
            if let Some(task) = stderr_task {
                task.abort();
            }
            match &outcome {
                Ok(TerminationOutcome::Killed) => {
                    warn!(operation = spec.operation, "Process ignored terminate, killed")
                }
                Ok(_) => debug!(operation = spec.operation, "Process terminated"),
                Err(e) => warn!(operation = spec.operation, error = %e, "Failed to terminate process"),
            }
            match interrupt {
                Interrupt::Cancelled => Err(Error::Cancelled),
                Interrupt::Timeout(timeout) => Err(Error::Timeout {
                    operation: spec.operation,
                    secs: timeout.as_secs(),
                }),
            }
        }
    }
}

fn spawn_read_all<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!(error = %e, "Failed to read process stdout");
        }
        buf
    })
}

fn spawn_read_tail<R>(mut reader: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail: Vec<u8> = Vec::with_capacity(STDERR_TAIL_BYTES);
        let mut chunk = [0u8; 1024];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&chunk[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        let excess = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..excess);
                    }
                }
            }
        }
        String::from_utf8_lossy(&tail).trim().to_string()
    })
}
