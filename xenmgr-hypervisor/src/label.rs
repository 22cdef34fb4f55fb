//! Machine label decoding.
//!
//! A label is the opaque per-machine string from the deployment
//! configuration. Depending on the addressing mode it is either
//! `<domain config path>, <snapshot path>` or a plain machine name.

use std::path::{Path, PathBuf};

use crate::error::{HypervisorError, Result};
use crate::types::AddressingMode;

/// Addressing information for one managed machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineLabel {
    /// Restored from a saved snapshot.
    Snapshot {
        config_path: PathBuf,
        snapshot_path: PathBuf,
    },
    /// Addressed by its hypervisor-visible name.
    Named { name: String },
}

impl MachineLabel {
    /// Decode a raw label for the given addressing mode.
    ///
    /// No filesystem checks happen here; see
    /// [`XenManager::initialize_check`](crate::XenManager::initialize_check).
    pub fn parse(raw: &str, mode: AddressingMode) -> Result<Self> {
        let trimmed = raw.trim();

        match mode {
            AddressingMode::Snapshot => {
                let fields: Vec<&str> = trimmed.split(',').map(str::trim).collect();
                if fields.len() != 2 {
                    return Err(HypervisorError::MalformedLabel {
                        label: raw.to_string(),
                        reason: format!(
                            "expected '<config>, <snapshot>', found {} field(s)",
                            fields.len()
                        ),
                    });
                }
                if fields.iter().any(|f| f.is_empty()) {
                    return Err(HypervisorError::MalformedLabel {
                        label: raw.to_string(),
                        reason: "empty configuration or snapshot path".to_string(),
                    });
                }
                Ok(Self::Snapshot {
                    config_path: PathBuf::from(fields[0]),
                    snapshot_path: PathBuf::from(fields[1]),
                })
            }
            AddressingMode::Named => {
                if trimmed.is_empty() {
                    return Err(HypervisorError::MalformedLabel {
                        label: raw.to_string(),
                        reason: "empty machine name".to_string(),
                    });
                }
                Ok(Self::Named {
                    name: trimmed.to_string(),
                })
            }
        }
    }

    /// The name the hypervisor tool knows this machine by.
    ///
    /// In snapshot mode this is the base file name of the domain
    /// configuration.
    pub fn machine_name(&self) -> String {
        match self {
            Self::Snapshot { config_path, .. } => file_name(config_path),
            Self::Named { name } => name.clone(),
        }
    }

    /// Addressing mode this label was decoded for.
    pub fn mode(&self) -> AddressingMode {
        match self {
            Self::Snapshot { .. } => AddressingMode::Snapshot,
            Self::Named { .. } => AddressingMode::Named,
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
