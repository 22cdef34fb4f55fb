//! Xen machine manager driven through `xm`.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::invoker::{CommandRunner, InvocationOutcome, ToolInvoker};
use crate::label::MachineLabel;
use crate::resolver::StateResolver;
use crate::traits::{MachineManager, ManagerCapabilities};
use crate::types::{ControllerConfig, MachineStatusEntry, VmState};

/// How a poll loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollOutcome {
    /// The machine reached an accepted state.
    Reached(VmState),
    /// Poll budget or deadline exhausted; carries the last observation.
    Exhausted(VmState),
}

/// Lifecycle controller for Xen guests.
///
/// Stateless per call: preconditions and poll results always come from
/// fresh `xm` queries.
pub struct XenManager {
    config: ControllerConfig,
    resolver: StateResolver,
}

impl XenManager {
    /// Create a manager that runs the `xm` binary from `config`.
    pub fn new(config: ControllerConfig) -> Self {
        let runner = Arc::new(ToolInvoker::new(config.xm_path.clone()));
        Self::with_runner(config, runner)
    }

    /// Create a manager on top of an arbitrary tool runner.
    pub fn with_runner(config: ControllerConfig, runner: Arc<dyn CommandRunner>) -> Self {
        info!(
            tool = %runner.binary().display(),
            addressing = ?config.addressing,
            "Creating Xen machine manager"
        );
        let resolver = StateResolver::new(runner, config.status_codes.clone());
        Self { config, resolver }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn resolver(&self) -> &StateResolver {
        &self.resolver
    }

    fn runner(&self) -> &Arc<dyn CommandRunner> {
        self.resolver.runner()
    }

    /// Decode a raw label with the deployment's addressing mode.
    pub fn parse_label(&self, raw: &str) -> Result<MachineLabel> {
        MachineLabel::parse(raw, self.config.addressing)
    }

    /// Check the tool and the files each machine needs before first use.
    pub fn initialize_check<'a>(
        &self,
        labels: impl IntoIterator<Item = &'a MachineLabel>,
    ) -> Result<()> {
        self.runner()
            .check_available()
            .map_err(|e| HypervisorError::ToolUnavailable {
                path: self.runner().binary().display().to_string(),
                reason: e.to_string(),
            })?;

        for label in labels {
            self.check_machine(label)?;
        }

        if let Some(create_config) = &self.config.create_config {
            if !create_config.exists() {
                return Err(HypervisorError::InvalidConfig(format!(
                    "{}: domain configuration for create not found",
                    create_config.display()
                )));
            }
        }

        Ok(())
    }

    fn check_machine(&self, label: &MachineLabel) -> Result<()> {
        if let MachineLabel::Snapshot {
            config_path,
            snapshot_path,
        } = label
        {
            let machine = label.machine_name();
            if !config_path.exists() {
                return Err(HypervisorError::InvalidConfig(format!(
                    "{}: configuration file not found for machine {}",
                    config_path.display(),
                    machine
                )));
            }
            if !snapshot_path.exists() {
                return Err(HypervisorError::InvalidConfig(format!(
                    "{}: snapshot not found for machine {}",
                    snapshot_path.display(),
                    machine
                )));
            }
        }
        Ok(())
    }

    /// State used for preconditions and polling.
    ///
    /// A rejected status query is reconciled against the full listing: a
    /// machine the tool no longer lists is powered off; one it lists but
    /// cannot describe is in [`VmState::Error`].
    async fn observe(&self, label: &MachineLabel) -> Result<VmState> {
        let machine = label.machine_name();
        match self.resolver.status_of(&machine).await {
            Err(HypervisorError::StatusUnavailable { stderr, .. }) => {
                let listed = self.resolver.list_machines().await.map_err(|e| match e {
                    HypervisorError::StatusUnavailable {
                        exit_code, stderr, ..
                    } => HypervisorError::StatusUnavailable {
                        machine: machine.clone(),
                        exit_code,
                        stderr,
                    },
                    other => other,
                })?;
                if listed.iter().any(|m| m.name == machine) {
                    debug!(stderr = %stderr, "Listed machine has no readable status");
                    Ok(VmState::Error)
                } else {
                    debug!("Machine not listed by the tool");
                    Ok(VmState::PoweredOff)
                }
            }
            other => other,
        }
    }

    fn start_args(&self, label: &MachineLabel) -> Result<Vec<String>> {
        match label {
            MachineLabel::Snapshot { snapshot_path, .. } => Ok(vec![
                "restore".to_string(),
                snapshot_path.to_string_lossy().into_owned(),
            ]),
            MachineLabel::Named { name } => {
                let config = self.config.create_config.as_ref().ok_or_else(|| {
                    HypervisorError::InvalidConfig(
                        "create_config is required to start machines in named mode".to_string(),
                    )
                })?;
                Ok(vec![
                    "create".to_string(),
                    config.to_string_lossy().into_owned(),
                    format!("name={}", name),
                ])
            }
        }
    }

    /// Query the machine until `accept` holds, the poll budget runs out or
    /// `deadline` passes.
    ///
    /// The last sleep is cut short at `deadline` and followed by one more
    /// query, so a machine that got there in time is never reported as
    /// timed out. `last` starts as the precondition observation.
    async fn poll_until(
        &self,
        label: &MachineLabel,
        deadline: Instant,
        mut last: VmState,
        accept: fn(&VmState) -> bool,
    ) -> Result<PollOutcome> {
        let poll = self.config.poll;

        for attempt in 1..=poll.max_polls {
            let wake = Instant::now()
                .checked_add(poll.interval())
                .map_or(deadline, |wake| wake.min(deadline));
            sleep_until(wake).await;

            let observed = match timeout_at(deadline, self.observe(label)).await {
                Ok(observed) => observed,
                Err(_) => {
                    debug!(attempt, "Deadline passed during status query");
                    break;
                }
            };

            match observed {
                Ok(state) => {
                    debug!(attempt, state = %state, "Polled machine state");
                    last = state;
                    if accept(&state) {
                        return Ok(PollOutcome::Reached(state));
                    }
                }
                Err(e) if e.is_retryable() => {
                    debug!(attempt, error = %e, "Transient status failure while polling");
                    last = VmState::Error;
                }
                Err(e) => return Err(e),
            }

            if wake >= deadline {
                break;
            }
        }

        Ok(PollOutcome::Exhausted(last))
    }
}

#[async_trait]
impl MachineManager for XenManager {
    async fn capabilities(&self) -> Result<ManagerCapabilities> {
        Ok(ManagerCapabilities {
            name: "xen-xm".to_string(),
            tool_path: self.runner().binary().to_path_buf(),
            addressing: self.config.addressing,
            supports_memory_dump: false,
        })
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<bool> {
        let invocation = self.runner().invoke(&["list".to_string()]).await;
        Ok(invocation.success())
    }

    #[instrument(skip(self, label), fields(machine = %label.machine_name()))]
    async fn start(&self, label: &MachineLabel, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let machine = label.machine_name();

        let current = match timeout_at(deadline, self.observe(label)).await {
            Ok(current) => current?,
            Err(_) => {
                warn!("Deadline passed while querying machine state");
                return Err(HypervisorError::StartTimeout {
                    machine,
                    last_state: VmState::Unknown.to_string(),
                });
            }
        };
        match current {
            VmState::Running => return Err(HypervisorError::AlreadyRunning(machine)),
            VmState::Error => {
                return Err(HypervisorError::InvalidTransition {
                    machine,
                    action: "start".to_string(),
                    state: current.to_string(),
                })
            }
            _ => {}
        }

        let args = self.start_args(label)?;
        info!(state = %current, command = %args[0], "Starting machine");

        let invocation = match timeout_at(deadline, self.runner().invoke(&args)).await {
            Ok(invocation) => invocation,
            Err(_) => {
                warn!(last_state = %current, "Deadline passed while start command ran");
                return Err(HypervisorError::StartTimeout {
                    machine,
                    last_state: current.to_string(),
                });
            }
        };
        match invocation.outcome() {
            InvocationOutcome::Success => {}
            InvocationOutcome::LaunchFailed => {
                let reason = invocation
                    .launch_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                warn!(error = %reason, "Could not launch start command");
                return Err(HypervisorError::StartFailed {
                    machine,
                    exit_code: None,
                    stderr: reason,
                });
            }
            InvocationOutcome::ToolError => {
                warn!(exit_code = ?invocation.exit_code, "Start command rejected");
                return Err(HypervisorError::StartFailed {
                    machine,
                    exit_code: invocation.exit_code,
                    stderr: invocation.stderr_text(),
                });
            }
        }

        match self
            .poll_until(label, deadline, current, |s| *s == VmState::Running)
            .await?
        {
            PollOutcome::Reached(_) => {
                info!("Machine running");
                Ok(())
            }
            PollOutcome::Exhausted(last) => {
                warn!(last_state = %last, "Timed out waiting for machine to start");
                Err(HypervisorError::StartTimeout {
                    machine,
                    last_state: last.to_string(),
                })
            }
        }
    }

    #[instrument(skip(self, label), fields(machine = %label.machine_name()))]
    async fn stop(&self, label: &MachineLabel, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let machine = label.machine_name();

        let current = match timeout_at(deadline, self.observe(label)).await {
            Ok(current) => current?,
            Err(_) => {
                warn!("Deadline passed while querying machine state");
                return Err(HypervisorError::StopTimeout {
                    machine,
                    last_state: VmState::Unknown.to_string(),
                });
            }
        };
        if current.is_stopped() {
            return Err(HypervisorError::AlreadyStopped(machine));
        }
        if current == VmState::Error {
            return Err(HypervisorError::InvalidTransition {
                machine,
                action: "stop".to_string(),
                state: current.to_string(),
            });
        }

        info!(state = %current, "Stopping machine");

        let args = vec!["shutdown".to_string(), machine.clone()];
        let invocation = match timeout_at(deadline, self.runner().invoke(&args)).await {
            Ok(invocation) => invocation,
            Err(_) => {
                warn!(last_state = %current, "Deadline passed while shutdown command ran");
                return Err(HypervisorError::StopTimeout {
                    machine,
                    last_state: current.to_string(),
                });
            }
        };
        match invocation.outcome() {
            InvocationOutcome::Success => {}
            InvocationOutcome::LaunchFailed => {
                let reason = invocation
                    .launch_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                warn!(error = %reason, "Could not launch shutdown command");
                return Err(HypervisorError::StopFailed {
                    machine,
                    exit_code: None,
                    stderr: reason,
                });
            }
            InvocationOutcome::ToolError => {
                warn!(exit_code = ?invocation.exit_code, "Shutdown command rejected");
                return Err(HypervisorError::StopFailed {
                    machine,
                    exit_code: invocation.exit_code,
                    stderr: invocation.stderr_text(),
                });
            }
        }

        match self
            .poll_until(label, deadline, current, VmState::is_stopped)
            .await? {
            PollOutcome::Reached(state) => {
                info!(state = %state, "Machine stopped");
                Ok(())
            }
            PollOutcome::Exhausted(last) => {
                warn!(last_state = %last, "Timed out waiting for machine to stop");
                Err(HypervisorError::StopTimeout {
                    machine,
                    last_state: last.to_string(),
                })
            }
        }
    }

    async fn status(&self, label: &MachineLabel) -> Result<VmState> {
        self.resolver.get_status(label).await
    }

    async fn list(&self) -> Result<Vec<MachineStatusEntry>> {
        self.resolver.list_machines().await
    }

    #[instrument(skip(self, label), fields(machine = %label.machine_name()))]
    async fn dump_memory(&self, label: &MachineLabel, path: &Path) -> Result<()> {
        debug!(path = %path.display(), "Memory dump requested");
        Err(HypervisorError::NotSupported(format!(
            "memory dumps of {} are not implemented for xm",
            label.machine_name()
        )))
    }
}
