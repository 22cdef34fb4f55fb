//! Mapping of tool output to [`VmState`].

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::invoker::{CommandRunner, InvocationOutcome, ToolInvocation};
use crate::label::MachineLabel;
use crate::sexpr::{self, ParsedRecord};
use crate::types::{MachineStatusEntry, StatusTable, VmState};

/// Tag of the top-level records describing a machine.
const DOMAIN_TAG: &str = "domain";
const NAME_TAG: &str = "name";
const STATUS_TAG: &str = "status";

/// Answers "what state is machine X in" and "which machines exist".
///
/// Every answer comes from a fresh tool invocation; nothing is cached.
#[derive(Clone)]
pub struct StateResolver {
    runner: Arc<dyn CommandRunner>,
    status_codes: StatusTable,
}

impl StateResolver {
    pub fn new(runner: Arc<dyn CommandRunner>, status_codes: StatusTable) -> Self {
        Self {
            runner,
            status_codes,
        }
    }

    /// The runner used for tool invocations.
    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// Current state of the machine addressed by `label`.
    pub async fn get_status(&self, label: &MachineLabel) -> Result<VmState> {
        self.status_of(&label.machine_name()).await
    }

    /// Current state of the machine the tool knows as `name`.
    ///
    /// A non-zero exit is reported as [`HypervisorError::StatusUnavailable`],
    /// never as [`VmState::Unknown`].
    #[instrument(skip(self), fields(machine = %name))]
    pub async fn status_of(&self, name: &str) -> Result<VmState> {
        let args = vec!["list".to_string(), "-l".to_string(), name.to_string()];
        let invocation = self.runner.invoke(&args).await;

        match invocation.outcome() {
            InvocationOutcome::LaunchFailed => return Err(self.tool_unavailable(&invocation)),
            InvocationOutcome::ToolError => {
                debug!(exit_code = ?invocation.exit_code, "Status query rejected by tool");
                return Err(HypervisorError::StatusUnavailable {
                    machine: name.to_string(),
                    exit_code: invocation.exit_code,
                    stderr: invocation.stderr_text(),
                });
            }
            InvocationOutcome::Success => {}
        }

        let records = sexpr::parse(&invocation.stdout)?;
        // A single-machine query answers with one expression.
        let state = records
            .first()
            .map(|record| self.resolve_record(record))
            .unwrap_or_default();

        debug!(state = %state, "Resolved machine state");
        Ok(state)
    }

    /// Every machine the tool reports, with its resolved state.
    ///
    /// An empty tool answer yields an empty list.
    #[instrument(skip(self))]
    pub async fn list_machines(&self) -> Result<Vec<MachineStatusEntry>> {
        let args = vec!["list".to_string(), "-l".to_string()];
        let invocation = self.runner.invoke(&args).await;

        match invocation.outcome() {
            InvocationOutcome::LaunchFailed => return Err(self.tool_unavailable(&invocation)),
            InvocationOutcome::ToolError => {
                return Err(HypervisorError::StatusUnavailable {
                    machine: "*".to_string(),
                    exit_code: invocation.exit_code,
                    stderr: invocation.stderr_text(),
                });
            }
            InvocationOutcome::Success => {}
        }

        if invocation.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let records = sexpr::parse(&invocation.stdout)?;
        let mut machines = Vec::new();
        for record in records.iter().filter(|r| r.tag == DOMAIN_TAG) {
            match record.field(NAME_TAG) {
                Some(name) => machines.push(MachineStatusEntry {
                    name: name.to_string(),
                    state: self.resolve_record(record),
                }),
                None => warn!(record = %record, "Skipping domain without a name"),
            }
        }

        debug!(count = machines.len(), "Listed machines");
        Ok(machines)
    }

    /// State carried by the immediate `status` child of a domain record.
    pub fn resolve_record(&self, record: &ParsedRecord) -> VmState {
        match record.field(STATUS_TAG) {
            Some(code) => self.status_codes.resolve(code),
            None => VmState::Unknown,
        }
    }

    pub(crate) fn tool_unavailable(&self, invocation: &ToolInvocation) -> HypervisorError {
        HypervisorError::ToolUnavailable {
            path: self.runner.binary().display().to_string(),
            reason: invocation
                .launch_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "launch failed".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::ToolInvoker;
    use crate::mock::MockXm;
    use crate::types::AddressingMode;
    use std::collections::HashSet;

    fn resolver(mock: &Arc<MockXm>) -> StateResolver {
        StateResolver::new(mock.clone(), StatusTable::default())
    }

    #[tokio::test]
    async fn test_running_status() {
        let mock = Arc::new(MockXm::new());
        mock.set_raw_output("win7", "(domain (name win7) (status 2))");

        let label = MachineLabel::parse("win7", AddressingMode::Named).unwrap();
        let state = resolver(&mock).get_status(&label).await.unwrap();
        assert_eq!(state, VmState::Running);
    }

    #[tokio::test]
    async fn test_absent_status_is_unknown() {
        let mock = Arc::new(MockXm::new());
        mock.set_raw_output("win7", "(domain (name win7) (domid 4))");

        let state = resolver(&mock).status_of("win7").await.unwrap();
        assert_eq!(state, VmState::Unknown);
    }

    #[tokio::test]
    async fn test_unmapped_code_is_unknown() {
        let mock = Arc::new(MockXm::new());
        mock.set_raw_output("win7", "(domain (name win7) (status 42))");

        let state = resolver(&mock).status_of("win7").await.unwrap();
        assert_eq!(state, VmState::Unknown);
    }

    #[tokio::test]
    async fn test_nested_status_is_ignored() {
        let mock = Arc::new(MockXm::new());
        mock.set_raw_output("win7", "(domain (name win7) (device (vbd (status 2))))");

        let state = resolver(&mock).status_of("win7").await.unwrap();
        assert_eq!(state, VmState::Unknown);
    }

    #[tokio::test]
    async fn test_configured_table() {
        let mock = Arc::new(MockXm::new());
        mock.set_raw_output("win7", "(domain (name win7) (status 1))");

        let table = StatusTable::from_pairs([(1, VmState::Running)]);
        let resolver = StateResolver::new(mock.clone(), table);
        assert_eq!(resolver.status_of("win7").await.unwrap(), VmState::Running);
    }

    #[tokio::test]
    async fn test_unknown_machine_is_status_unavailable() {
        let mock = Arc::new(MockXm::new());

        let err = resolver(&mock).status_of("ghost").await.unwrap_err();
        match err {
            HypervisorError::StatusUnavailable {
                machine,
                exit_code,
                stderr,
            } => {
                assert_eq!(machine, "ghost");
                assert_eq!(exit_code, Some(1));
                assert!(stderr.contains("does not exist"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbled_output_is_unparseable() {
        let mock = Arc::new(MockXm::new());
        mock.set_raw_output("win7", "(domain (name win7) (status 2)");

        let err = resolver(&mock).status_of("win7").await.unwrap_err();
        assert!(matches!(err, HypervisorError::UnparseableOutput(_)));
    }

    #[tokio::test]
    async fn test_missing_tool_is_unavailable() {
        let resolver = StateResolver::new(
            Arc::new(ToolInvoker::new("/nonexistent/xm")),
            StatusTable::default(),
        );

        let err = resolver.status_of("win7").await.unwrap_err();
        assert!(matches!(err, HypervisorError::ToolUnavailable { .. }));

        let err = resolver.list_machines().await.unwrap_err();
        assert!(matches!(err, HypervisorError::ToolUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_list_machines() {
        let mock = Arc::new(MockXm::new());
        mock.add_machine("win7", 2);
        mock.add_machine("winxp", 0);
        mock.add_machine("crashed", 5);

        let machines = resolver(&mock).list_machines().await.unwrap();
        let found: HashSet<_> = machines.into_iter().collect();
        let expected: HashSet<_> = [
            ("win7", VmState::Running),
            ("winxp", VmState::PoweredOff),
            ("crashed", VmState::Aborted),
        ]
        .into_iter()
        .map(|(name, state)| MachineStatusEntry {
            name: name.to_string(),
            state,
        })
        .collect();
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn test_list_filters_non_domain_records() {
        let mock = Arc::new(MockXm::new());
        mock.set_list_output("(node (host dom0))\n(domain (name a) (status 2))\n(domain (status 0))");

        let machines = resolver(&mock).list_machines().await.unwrap();
        assert_eq!(
            machines,
            vec![MachineStatusEntry {
                name: "a".to_string(),
                state: VmState::Running
            }]
        );
    }

    #[tokio::test]
    async fn test_list_empty() {
        let mock = Arc::new(MockXm::new());
        let machines = resolver(&mock).list_machines().await.unwrap();
        assert!(machines.is_empty());
    }

    #[tokio::test]
    async fn test_list_is_repeatable() {
        let mock = Arc::new(MockXm::new());
        mock.add_machine("a", 2);
        mock.add_machine("b", 4);

        let resolver = resolver(&mock);
        let first: HashSet<_> = resolver.list_machines().await.unwrap().into_iter().collect();
        let second: HashSet<_> = resolver.list_machines().await.unwrap().into_iter().collect();
        assert_eq!(first, second);
    }
}
