//! Machine manager abstraction trait.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::label::MachineLabel;
use crate::types::{AddressingMode, MachineStatusEntry, VmState};

/// Capabilities reported by a machine manager backend.
#[derive(Debug, Clone)]
pub struct ManagerCapabilities {
    /// Name of the backend (e.g., "xen-xm")
    pub name: String,
    /// Path of the hypervisor tool driven by the backend
    pub tool_path: PathBuf,
    /// How labels address machines
    pub addressing: AddressingMode,
    /// Supports memory dumps
    pub supports_memory_dump: bool,
}

/// Machine manager capability expected by the sandbox orchestrator.
///
/// Each hypervisor backend implements this trait. Implementations keep no
/// per-machine state between calls: every answer is re-derived from the
/// hypervisor. The caller must not run two lifecycle operations on the
/// same machine at once.
#[async_trait]
pub trait MachineManager: Send + Sync {
    // =========================================================================
    // Capabilities & Health
    // =========================================================================

    /// Get backend capabilities.
    async fn capabilities(&self) -> Result<ManagerCapabilities>;

    /// Check whether the hypervisor tool answers.
    async fn health_check(&self) -> Result<bool>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start a machine and wait until it is running.
    ///
    /// `timeout` bounds the wait; on expiry the machine is left in whatever
    /// state the hypervisor last reported.
    async fn start(&self, label: &MachineLabel, timeout: Duration) -> Result<()>;

    /// Shut a machine down and wait until it is powered off or aborted.
    async fn stop(&self, label: &MachineLabel, timeout: Duration) -> Result<()>;

    // =========================================================================
    // Status
    // =========================================================================

    /// Current state of a machine.
    async fn status(&self, label: &MachineLabel) -> Result<VmState>;

    /// All machines known to the hypervisor.
    async fn list(&self) -> Result<Vec<MachineStatusEntry>>;

    // =========================================================================
    // Forensics
    // =========================================================================

    /// Write a memory dump of the machine to `path`.
    async fn dump_memory(&self, label: &MachineLabel, path: &Path) -> Result<()>;
}
