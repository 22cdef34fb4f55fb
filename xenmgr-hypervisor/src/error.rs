//! Error types for the Xen lifecycle controller.

use thiserror::Error;

/// Errors that can occur while controlling machines through the `xm` tool.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// The machine label could not be decoded for the addressing mode.
    #[error("Malformed machine label '{label}': {reason}")]
    MalformedLabel { label: String, reason: String },

    /// The tool binary could not be launched (missing, not executable).
    #[error("Hypervisor tool unavailable at {path}: {reason}")]
    ToolUnavailable { path: String, reason: String },

    /// The tool answered a status query with a non-zero exit code.
    #[error("Status of machine {machine} unavailable (exit code {exit_code:?}): {stderr}")]
    StatusUnavailable {
        machine: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The tool output could not be decoded.
    #[error("Unparseable tool output: {0}")]
    UnparseableOutput(String),

    /// Start requested for a machine that is already running.
    #[error("Machine {0} is already running")]
    AlreadyRunning(String),

    /// Stop requested for a machine that is already powered off or aborted.
    #[error("Machine {0} is already stopped")]
    AlreadyStopped(String),

    /// The observed state does not allow the requested transition.
    #[error("Invalid transition for machine {machine}: cannot {action} from state {state}")]
    InvalidTransition {
        machine: String,
        action: String,
        state: String,
    },

    /// The tool rejected the start command.
    #[error("Failed to start machine {machine} (exit code {exit_code:?}): {stderr}")]
    StartFailed {
        machine: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The tool rejected the shutdown command.
    #[error("Failed to stop machine {machine} (exit code {exit_code:?}): {stderr}")]
    StopFailed {
        machine: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The machine did not reach `Running` before the poll budget ran out.
    #[error("Timed out waiting for machine {machine} to start (last state: {last_state})")]
    StartTimeout { machine: String, last_state: String },

    /// The machine did not power off before the poll budget ran out.
    #[error("Timed out waiting for machine {machine} to stop (last state: {last_state})")]
    StopTimeout { machine: String, last_state: String },

    /// The operation is not implemented by this backend.
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Configuration is inconsistent with what is on disk.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No machine with this name is configured.
    #[error("Machine not found: {0}")]
    MachineNotFound(String),
}

impl HypervisorError {
    /// Whether the caller may retry the operation (after re-querying state).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StatusUnavailable { .. } | Self::StartTimeout { .. } | Self::StopTimeout { .. }
        )
    }
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
