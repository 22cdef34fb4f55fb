//! Execution of CLI subcommands against a machine manager.

use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use xenmgr_hypervisor::{MachineLabel, MachineManager, MockXm, XenManager};

use crate::cli::Command;
use crate::config::Config;

/// Transition delay of the simulated tool, in polls.
const DEV_TRANSITION_POLLS: u32 = 2;

/// Build the manager for this run.
///
/// In development mode the configured machines are backed by [`MockXm`].
pub fn build_manager(config: &Config, dev: bool) -> Result<XenManager> {
    if !dev {
        return Ok(XenManager::new(config.xen.clone()));
    }

    let mock = Arc::new(MockXm::new());
    mock.set_transition_delay(DEV_TRANSITION_POLLS);
    for (name, raw) in &config.machines {
        let label = MachineLabel::parse(raw, config.xen.addressing)
            .with_context(|| format!("Invalid label for machine {}", name))?;
        if let MachineLabel::Snapshot { snapshot_path, .. } = &label {
            mock.register_snapshot(snapshot_path.to_string_lossy(), label.machine_name());
        }
    }

    info!(machines = config.machines.len(), "Using simulated xm tool");
    Ok(XenManager::with_runner(config.xen.clone(), mock))
}

fn resolve_label(config: &Config, manager: &XenManager, machine: &str) -> Result<MachineLabel> {
    let raw = config.label(machine)?;
    let label = manager
        .parse_label(raw)
        .with_context(|| format!("Invalid label for machine {}", machine))?;
    Ok(label)
}

/// Run one subcommand, writing human output to `out`.
pub async fn run(
    command: &Command,
    config: &Config,
    manager: &XenManager,
    out: &mut impl Write,
) -> Result<()> {
    match command {
        Command::Check => {
            let labels = config
                .machines
                .keys()
                .map(|name| resolve_label(config, manager, name))
                .collect::<Result<Vec<_>>>()?;
            manager.initialize_check(&labels)?;
            writeln!(out, "ok: {} machine(s) checked", labels.len())?;
        }
        Command::List { json } => {
            let machines = manager.list().await?;
            if *json {
                writeln!(out, "{}", serde_json::to_string_pretty(&machines)?)?;
            } else {
                writeln!(out, "{:<32} {}", "NAME", "STATE")?;
                for machine in machines {
                    writeln!(out, "{:<32} {}", machine.name, machine.state)?;
                }
            }
        }
        Command::Status { machine } => {
            let label = resolve_label(config, manager, machine)?;
            let state = manager.status(&label).await?;
            writeln!(out, "{}: {}", machine, state)?;
        }
        Command::Start {
            machine,
            timeout_secs,
        } => {
            let label = resolve_label(config, manager, machine)?;
            manager
                .start(&label, Duration::from_secs(*timeout_secs))
                .await?;
            writeln!(out, "{}: running", machine)?;
        }
        Command::Stop {
            machine,
            timeout_secs,
        } => {
            let label = resolve_label(config, manager, machine)?;
            manager
                .stop(&label, Duration::from_secs(*timeout_secs))
                .await?;
            writeln!(out, "{}: stopped", machine)?;
        }
        Command::DumpMemory { machine, path } => {
            let label = resolve_label(config, manager, machine)?;
            manager.dump_memory(&label, path).await?;
            writeln!(out, "{}: memory written to {}", machine, path.display())?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use xenmgr_hypervisor::HypervisorError;

    fn dev_config() -> Config {
        Config::from_yaml(
            r#"
xen:
  addressing: snapshot
  poll:
    interval_ms: 5
    max_polls: 20
machines:
  win7: /etc/xen/win7.cfg, /var/lib/xen/save/win7.snap
"#,
        )
        .unwrap()
    }

    async fn run_to_string(command: Command, config: &Config, manager: &XenManager) -> Result<String> {
        let mut out = Vec::new();
        run(&command, config, manager, &mut out).await?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn test_dev_start_status_stop() {
        let config = dev_config();
        let manager = build_manager(&config, true).unwrap();

        let status = Command::Status {
            machine: "win7".to_string(),
        };
        // Not started yet, so xm does not know the domain
        let err = run_to_string(status.clone(), &config, &manager).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::StatusUnavailable { .. })
        ));

        let out = run_to_string(
            Command::Start {
                machine: "win7".to_string(),
                timeout_secs: 5,
            },
            &config,
            &manager,
        )
        .await
        .unwrap();
        assert_eq!(out, "win7: running\n");

        let out = run_to_string(status, &config, &manager).await.unwrap();
        assert_eq!(out, "win7: running\n");

        let out = run_to_string(
            Command::Stop {
                machine: "win7".to_string(),
                timeout_secs: 5,
            },
            &config,
            &manager,
        )
        .await
        .unwrap();
        assert_eq!(out, "win7: stopped\n");
    }

    #[tokio::test]
    async fn test_list_json() {
        let config = dev_config();
        let manager = build_manager(&config, true).unwrap();
        run_to_string(
            Command::Start {
                machine: "win7".to_string(),
                timeout_secs: 5,
            },
            &config,
            &manager,
        )
        .await
        .unwrap();

        let out = run_to_string(Command::List { json: true }, &config, &manager)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["name"], "win7.cfg");
        assert_eq!(parsed[0]["state"], "running");
    }

    #[tokio::test]
    async fn test_unknown_machine() {
        let config = dev_config();
        let manager = build_manager(&config, true).unwrap();

        let err = run_to_string(
            Command::Status {
                machine: "win10".to_string(),
            },
            &config,
            &manager,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::MachineNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dump_memory_not_supported() {
        let config = dev_config();
        let manager = build_manager(&config, true).unwrap();

        let err = run_to_string(
            Command::DumpMemory {
                machine: "win7".to_string(),
                path: PathBuf::from("/tmp/win7.dmp"),
            },
            &config,
            &manager,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_check_reports_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("win7.cfg");
        std::fs::write(&cfg, "name = 'win7'\n").unwrap();

        let mut config = dev_config();
        config.machines.insert(
            "win7".to_string(),
            format!("{}, {}", cfg.display(), dir.path().join("missing.snap").display()),
        );
        let manager = build_manager(&config, true).unwrap();

        let err = run_to_string(Command::Check, &config, &manager).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_dev_manager_rejects_bad_label() {
        let mut config = dev_config();
        config.machines.insert("broken".to_string(), "only-one-field".to_string());
        assert!(build_manager(&config, true).is_err());
    }
}
