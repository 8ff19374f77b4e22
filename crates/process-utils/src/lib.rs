//! Small process-related helpers shared across the workspace.
//!
//! - hidden-window command construction on Windows
//! - graceful termination: terminate signal, bounded grace period, then kill

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
///
/// The child is killed if its handle is dropped while still running, so an
/// aborted task never leaves an orphaned process behind.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

#[cfg(feature = "tokio")]
pub use graceful::{TerminationOutcome, terminate_gracefully};

#[cfg(feature = "tokio")]
mod graceful {
    use std::process::ExitStatus;
    use std::time::Duration;

    use tokio::process::Child;
    use tracing::{debug, warn};

    /// How a child process ended after [`terminate_gracefully`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TerminationOutcome {
        /// The process had already exited before any signal was sent.
        AlreadyExited(ExitStatus),
        /// The process exited within the grace period after the terminate signal.
        Terminated(ExitStatus),
        /// The grace period elapsed and the process was force-killed.
        Killed,
    }

    /// Ask a child process to stop, waiting up to `grace` before force-killing it.
    ///
    /// On Unix the terminate signal is `SIGTERM`, delivered through `kill(1)`.
    /// On other targets there is no graceful signal, so the child is killed
    /// immediately.
    pub async fn terminate_gracefully(
        child: &mut Child,
        grace: Duration,
    ) -> std::io::Result<TerminationOutcome> {
        if let Some(status) = child.try_wait()? {
            return Ok(TerminationOutcome::AlreadyExited(status));
        }

        if send_terminate(child).await {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(pid = ?child.id(), "child exited after terminate signal");
                    return Ok(TerminationOutcome::Terminated(status));
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        pid = ?child.id(),
                        grace_ms = grace.as_millis() as u64,
                        "child ignored terminate signal, killing"
                    );
                }
            }
        }

        child.kill().await?;
        Ok(TerminationOutcome::Killed)
    }

    #[cfg(unix)]
    async fn send_terminate(child: &Child) -> bool {
        let Some(pid) = child.id() else {
            return false;
        };
        match tokio::process::Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(pid, error = %e, "failed to deliver SIGTERM");
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn send_terminate(_child: &Child) -> bool {
        false
    }
}
