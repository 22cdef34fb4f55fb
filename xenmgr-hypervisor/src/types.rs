//! Type definitions for machine state and controller configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default location of the `xm` tool.
pub const DEFAULT_XM_PATH: &str = "/usr/sbin/xm";

// =============================================================================
// MACHINE STATE
// =============================================================================

/// Power state of a machine as reported by the hypervisor tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Running,
    PoweredOff,
    Aborted,
    /// No successful poll yet, or a status code outside the table.
    Unknown,
    /// The machine is listed but its state could not be determined.
    Error,
}

impl Default for VmState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl VmState {
    /// Whether the machine is in one of the accepted stop terminal states.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::PoweredOff | Self::Aborted)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Running => write!(f, "running"),
            VmState::PoweredOff => write!(f, "powered_off"),
            VmState::Aborted => write!(f, "aborted"),
            VmState::Unknown => write!(f, "unknown"),
            VmState::Error => write!(f, "error"),
        }
    }
}

/// One row of a "list all machines" query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineStatusEntry {
    /// Hypervisor-visible machine name
    pub name: String,
    /// State resolved through the status code table
    pub state: VmState,
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// How labels address machines. Fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressingMode {
    /// `<config path>, <snapshot path>`; started with `restore`
    Snapshot,
    /// Hypervisor-visible machine name; started with `create`
    Named,
}

impl Default for AddressingMode {
    fn default() -> Self {
        Self::Snapshot
    }
}

/// Mapping from the tool's numeric `status` field to [`VmState`].
///
/// Codes are tool-version specific, so the table is configurable. Codes
/// missing from the table resolve to [`VmState::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusTable(BTreeMap<i64, VmState>);

impl Default for StatusTable {
    /// Xen domain status constants: halted, running, shutdown, crashed.
    fn default() -> Self {
        Self::from_pairs([
            (0, VmState::PoweredOff),
            (2, VmState::Running),
            (4, VmState::PoweredOff),
            (5, VmState::Aborted),
        ])
    }
}

impl StatusTable {
    /// Build a table from explicit code/state pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (i64, VmState)>) -> Self {
        Self(pairs.into_iter().collect())
    }

    /// Resolve a raw status value. Non-numeric values resolve like unknown codes.
    pub fn resolve(&self, raw: &str) -> VmState {
        raw.trim()
            .parse::<i64>()
            .ok()
            .and_then(|code| self.0.get(&code).copied())
            .unwrap_or(VmState::Unknown)
    }
}

/// Bounds of the start/stop poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Delay between two status queries in milliseconds
    pub interval_ms: u64,
    /// Maximum number of status queries after the command was accepted
    pub max_polls: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            max_polls: 60,
        }
    }
}

impl PollPolicy {
    /// Delay between two status queries.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Controller configuration, supplied read-only by the host framework.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Path to the `xm` binary
    pub xm_path: PathBuf,
    /// Label addressing mode
    pub addressing: AddressingMode,
    /// Domain configuration passed to `create` in named mode
    pub create_config: Option<PathBuf>,
    /// Status code table
    pub status_codes: StatusTable,
    /// Poll loop bounds
    pub poll: PollPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            xm_path: PathBuf::from(DEFAULT_XM_PATH),
            addressing: AddressingMode::default(),
            create_config: None,
            status_codes: StatusTable::default(),
            poll: PollPolicy::default(),
        }
    }
}

impl ControllerConfig {
    /// Set the tool path.
    pub fn with_xm_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.xm_path = path.into();
        self
    }

    /// Set the addressing mode.
    pub fn with_addressing(mut self, mode: AddressingMode) -> Self {
        self.addressing = mode;
        self
    }

    /// Set the domain configuration used by `create` in named mode.
    pub fn with_create_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.create_config = Some(path.into());
        self
    }

    /// Replace the status code table.
    pub fn with_status_codes(mut self, table: StatusTable) -> Self {
        self.status_codes = table;
        self
    }

    /// Set the poll loop bounds.
    pub fn with_poll(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll = PollPolicy {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            max_polls,
        };
        self
    }
}
