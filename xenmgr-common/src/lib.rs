//! # xenmgr Common
//!
//! Shared utilities for the xenmgr binaries.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use xenmgr_common::init_logging;
//!
//! // Initialize with level; RUST_LOG overrides it
//! init_logging("info").unwrap();
//! tracing::info!(machine = "win7", "Starting machine");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, LogFormat};
