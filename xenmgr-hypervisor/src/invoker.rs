//! Execution of the hypervisor tool.
//!
//! A non-zero exit code is a normal outcome here. Only the caller knows
//! whether it matters, so [`ToolInvocation`] carries it back unjudged.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Result of one tool run. Created per call and owned by the caller.
#[derive(Debug)]
pub struct ToolInvocation {
    /// Exit code; `None` if the process never ran or died from a signal
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: Vec<u8>,
    /// Captured standard error
    pub stderr: Vec<u8>,
    /// Set when the process could not be launched
    pub launch_error: Option<io::Error>,
}

/// Classification of a [`ToolInvocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// Exit code 0.
    Success,
    /// The process ran and reported failure.
    ToolError,
    /// The process could not be started.
    LaunchFailed,
}

impl ToolInvocation {
    /// A process that ran to completion.
    pub fn completed(exit_code: Option<i32>, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            launch_error: None,
        }
    }

    /// A process that could not be started.
    pub fn launch_failed(error: io::Error) -> Self {
        Self {
            exit_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            launch_error: Some(error),
        }
    }

    pub fn outcome(&self) -> InvocationOutcome {
        if self.launch_error.is_some() {
            InvocationOutcome::LaunchFailed
        } else if self.exit_code == Some(0) {
            InvocationOutcome::Success
        } else {
            InvocationOutcome::ToolError
        }
    }

    pub fn success(&self) -> bool {
        self.outcome() == InvocationOutcome::Success
    }

    /// Standard error, lossily decoded and trimmed.
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Seam between the controller and the hypervisor tool process.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Path of the tool, for diagnostics.
    fn binary(&self) -> &Path;

    /// Verify the tool can be launched, without running it.
    fn check_available(&self) -> io::Result<()> {
        if self.binary().is_file() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, "file not found"))
        }
    }

    /// Run the tool with `args` and wait for it to exit.
    async fn invoke(&self, args: &[String]) -> ToolInvocation;
}

/// Runs the real tool binary as a child process.
#[derive(Debug, Clone)]
pub struct ToolInvoker {
    binary: PathBuf,
}

impl ToolInvoker {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for ToolInvoker {
    fn binary(&self) -> &Path {
        &self.binary
    }

    #[instrument(skip(self), fields(binary = %self.binary.display()))]
    async fn invoke(&self, args: &[String]) -> ToolInvocation {
        debug!("Invoking hypervisor tool");

        // Dropping the future (deadline expiry) kills the child.
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) => {
                let exit_code = output.status.code();
                debug!(exit_code = ?exit_code, "Hypervisor tool exited");
                ToolInvocation::completed(exit_code, output.stdout, output.stderr)
            }
            Err(e) => {
                warn!(error = %e, "Failed to launch hypervisor tool");
                ToolInvocation::launch_failed(e)
            }
        }
    }
}
