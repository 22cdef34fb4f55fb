//! # xenmgr Hypervisor
//!
//! Lifecycle controller for Xen guests managed through the `xm` tool.
//!
//! The controller starts, stops and queries machines that already exist
//! (as a saved snapshot or a named domain). It never trusts its own memory
//! of a machine's state: every precondition and every poll is a fresh
//! `xm list -l` query.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         MachineManager Trait            │
//! │  (start, stop, status, list, dump)      │
//! └─────────────────────┬───────────────────┘
//!                       │
//!                       ▼
//!              ┌─────────────────┐      ┌──────────────┐
//!              │   XenManager    │─────▶│ MachineLabel │
//!              │  (poll loop)    │      └──────────────┘
//!              └────────┬────────┘
//!                       ▼
//!              ┌─────────────────┐      ┌──────────────┐
//!              │  StateResolver  │─────▶│    sexpr     │
//!              └────────┬────────┘      └──────────────┘
//!                       ▼
//!              ┌─────────────────┐
//!              │  CommandRunner  │  ToolInvoker (xm) / MockXm
//!              └─────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use xenmgr_hypervisor::{ControllerConfig, MachineManager, XenManager};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = XenManager::new(ControllerConfig::default());
//!     let label = manager.parse_label("/etc/xen/win7.cfg, /var/xen/win7.snap").unwrap();
//!
//!     manager.start(&label, Duration::from_secs(60)).await.unwrap();
//!     manager.stop(&label, Duration::from_secs(60)).await.unwrap();
//! }
//! ```

pub mod controller;
pub mod error;
pub mod invoker;
pub mod label;
pub mod mock;
pub mod resolver;
pub mod sexpr;
pub mod traits;
pub mod types;

pub use controller::XenManager;
pub use error::{HypervisorError, Result};
pub use invoker::{CommandRunner, InvocationOutcome, ToolInvocation, ToolInvoker};
pub use label::MachineLabel;
pub use mock::MockXm;
pub use resolver::StateResolver;
pub use sexpr::{Node, ParsedRecord};
pub use traits::{MachineManager, ManagerCapabilities};
pub use types::*;
