//! Command-line argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// xenmgr - Start, stop and inspect Xen analysis machines
#[derive(Parser, Debug)]
#[command(name = "xenmgr")]
#[command(about = "xenmgr - Start, stop and inspect Xen analysis machines")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "XENMGR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Path to the xm binary
    #[arg(long)]
    pub xm_path: Option<PathBuf>,

    /// Enable development mode (simulated xm tool)
    #[arg(long)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Verify the xm binary and every configured machine's files
    Check,

    /// List all machines known to the hypervisor
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the state of a configured machine
    Status {
        /// Machine name from the configuration
        machine: String,
    },

    /// Start a configured machine and wait until it runs
    Start {
        /// Machine name from the configuration
        machine: String,

        /// Overall deadline for the start, in seconds
        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },

    /// Shut down a configured machine and wait until it is off
    Stop {
        /// Machine name from the configuration
        machine: String,

        /// Overall deadline for the shutdown, in seconds
        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },

    /// Dump the memory of a configured machine
    DumpMemory {
        /// Machine name from the configuration
        machine: String,

        /// Destination file
        path: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        let args = Args::try_parse_from([
            "xenmgr", "--dev", "-l", "debug", "start", "win7", "--timeout-secs", "30",
        ])
        .unwrap();
        assert!(args.dev);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(
            args.command,
            Command::Start {
                machine: "win7".to_string(),
                timeout_secs: 30
            }
        );
    }

    #[test]
    fn test_parse_dump_memory() {
        let args = Args::try_parse_from(["xenmgr", "dump-memory", "win7", "/tmp/win7.dmp"]).unwrap();
        assert_eq!(
            args.command,
            Command::DumpMemory {
                machine: "win7".to_string(),
                path: PathBuf::from("/tmp/win7.dmp")
            }
        );
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Args::try_parse_from(["xenmgr"]).is_err());
    }
}
