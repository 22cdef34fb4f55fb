//! Simulated `xm` tool for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::invoker::{CommandRunner, ToolInvocation};
use crate::sexpr::ParsedRecord;

/// Xen domain status codes used by the simulation.
pub const STATUS_HALTED: i64 = 0;
pub const STATUS_RUNNING: i64 = 2;
pub const STATUS_SHUTDOWN: i64 = 4;
pub const STATUS_CRASHED: i64 = 5;

/// Simulated hypervisor tool.
///
/// Understands the `xm` subcommands the controller issues and keeps the
/// domains in memory. Useful for:
/// - Unit and integration testing (every invocation is recorded)
/// - Development without a Xen host (`xenmgr --dev`)
pub struct MockXm {
    binary: PathBuf,
    inner: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    domains: BTreeMap<String, MockDomain>,
    /// snapshot path -> domain name it restores
    snapshots: HashMap<String, String>,
    /// domain name -> verbatim `list -l <name>` output
    raw_outputs: HashMap<String, String>,
    list_output: Option<String>,
    /// subcommand -> stderr returned with exit code 1
    rejections: HashMap<String, String>,
    invocations: Vec<Vec<String>>,
    launch_failure: bool,
    transition_delay: u32,
    remove_on_shutdown: bool,
    next_domid: u32,
}

struct MockDomain {
    domid: u32,
    status: i64,
    pending: Option<Pending>,
}

struct Pending {
    /// `None` removes the domain once the transition completes
    target: Option<i64>,
    remaining: u32,
}

impl MockXm {
    /// Create an empty simulation.
    pub fn new() -> Self {
        info!("Creating simulated xm tool");
        Self {
            binary: PathBuf::from("mock://xm"),
            inner: Mutex::new(MockState {
                next_domid: 1,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a domain with a fixed status code.
    pub fn add_machine(&self, name: impl Into<String>, status: i64) {
        let mut state = self.state();
        let domid = state.allocate_domid();
        state.domains.insert(
            name.into(),
            MockDomain {
                domid,
                status,
                pending: None,
            },
        );
    }

    /// Change the status code of an existing domain, or add it.
    pub fn set_status(&self, name: &str, status: i64) {
        let mut state = self.state();
        if let Some(domain) = state.domains.get_mut(name) {
            domain.status = status;
            domain.pending = None;
            return;
        }
        let domid = state.allocate_domid();
        state.domains.insert(
            name.to_string(),
            MockDomain {
                domid,
                status,
                pending: None,
            },
        );
    }

    /// Current status code of a domain, if it exists.
    pub fn status_code(&self, name: &str) -> Option<i64> {
        self.state().domains.get(name).map(|d| d.status)
    }

    /// Make `restore <snapshot>` bring up the domain `name`.
    pub fn register_snapshot(&self, snapshot: impl Into<String>, name: impl Into<String>) {
        self.state().snapshots.insert(snapshot.into(), name.into());
    }

    /// Answer `list -l <name>` with `output` verbatim.
    pub fn set_raw_output(&self, name: impl Into<String>, output: impl Into<String>) {
        self.state().raw_outputs.insert(name.into(), output.into());
    }

    /// Answer `list -l` (all domains) with `output` verbatim.
    pub fn set_list_output(&self, output: impl Into<String>) {
        self.state().list_output = Some(output.into());
    }

    /// Reject `subcommand` with exit code 1 and the given stderr.
    pub fn reject(&self, subcommand: impl Into<String>, stderr: impl Into<String>) {
        self.state().rejections.insert(subcommand.into(), stderr.into());
    }

    /// Make every invocation fail to launch.
    pub fn fail_launch(&self) {
        self.state().launch_failure = true;
    }

    /// Number of `list` queries a transition takes to complete.
    pub fn set_transition_delay(&self, polls: u32) {
        self.state().transition_delay = polls;
    }

    /// Remove domains from the listing once shut down, as Xen does for
    /// domains started from a snapshot.
    pub fn set_remove_on_shutdown(&self, remove: bool) {
        self.state().remove_on_shutdown = remove;
    }

    /// All recorded invocations, in order.
    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.state().invocations.clone()
    }

    /// Number of recorded invocations of `subcommand`.
    pub fn invocation_count(&self, subcommand: &str) -> usize {
        self.state()
            .invocations
            .iter()
            .filter(|args| args.first().map(String::as_str) == Some(subcommand))
            .count()
    }
}

impl Default for MockXm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn allocate_domid(&mut self) -> u32 {
        let domid = self.next_domid;
        self.next_domid += 1;
        domid
    }

    fn advance_transitions(&mut self) {
        let mut removed = Vec::new();
        for (name, domain) in self.domains.iter_mut() {
            if let Some(pending) = domain.pending.as_mut() {
                if pending.remaining > 0 {
                    pending.remaining -= 1;
                    continue;
                }
                match pending.target {
                    Some(status) => domain.status = status,
                    None => removed.push(name.clone()),
                }
                domain.pending = None;
            }
        }
        for name in removed {
            self.domains.remove(&name);
        }
    }

    fn begin_transition(&mut self, name: &str, target: Option<i64>) {
        let delay = self.transition_delay;
        if delay == 0 {
            match target {
                Some(status) => {
                    if let Some(domain) = self.domains.get_mut(name) {
                        domain.status = status;
                    }
                }
                None => {
                    self.domains.remove(name);
                }
            }
            return;
        }
        if let Some(domain) = self.domains.get_mut(name) {
            domain.pending = Some(Pending {
                target,
                remaining: delay - 1,
            });
        }
    }

    fn render(&self, name: &str, domain: &MockDomain) -> String {
        ParsedRecord::new("domain")
            .with_field("domid", domain.domid.to_string())
            .with_field("name", name)
            .with_field("status", domain.status.to_string())
            .to_string()
    }

    fn list(&mut self, args: &[String]) -> ToolInvocation {
        self.advance_transitions();

        let name = args.iter().skip(1).find(|a| !a.starts_with('-'));
        match name {
            Some(name) => {
                if let Some(raw) = self.raw_outputs.get(name) {
                    return ToolInvocation::completed(Some(0), raw.clone(), "");
                }
                match self.domains.get(name) {
                    Some(domain) => ToolInvocation::completed(Some(0), self.render(name, domain), ""),
                    None => not_found(name),
                }
            }
            None => {
                if let Some(raw) = &self.list_output {
                    return ToolInvocation::completed(Some(0), raw.clone(), "");
                }
                let output: Vec<String> = self
                    .domains
                    .iter()
                    .map(|(name, domain)| self.render(name, domain))
                    .collect();
                ToolInvocation::completed(Some(0), output.join("\n"), "")
            }
        }
    }

    fn bring_up(&mut self, name: String) -> ToolInvocation {
        match self.domains.get(&name).map(|d| d.status) {
            Some(STATUS_RUNNING) => {
                return failure(format!("Error: Domain '{}' already exists", name));
            }
            Some(_) => {}
            None => {
                let domid = self.allocate_domid();
                self.domains.insert(
                    name.clone(),
                    MockDomain {
                        domid,
                        status: STATUS_HALTED,
                        pending: None,
                    },
                );
            }
        }
        self.begin_transition(&name, Some(STATUS_RUNNING));
        ToolInvocation::completed(Some(0), "", "")
    }

    fn restore(&mut self, args: &[String]) -> ToolInvocation {
        let Some(snapshot) = args.get(1) else {
            return failure("Error: 'xm restore' requires 1 argument.".to_string());
        };
        match self.snapshots.get(snapshot).cloned() {
            Some(name) => self.bring_up(name),
            None => failure(format!("Error: Restore failed: cannot open {}", snapshot)),
        }
    }

    fn create(&mut self, args: &[String]) -> ToolInvocation {
        let name = args
            .iter()
            .skip(1)
            .find_map(|a| a.strip_prefix("name="))
            .map(str::to_string);
        match name {
            Some(name) => self.bring_up(name),
            None => failure("Error: domain name not given".to_string()),
        }
    }

    fn shutdown(&mut self, args: &[String]) -> ToolInvocation {
        let Some(name) = args.get(1) else {
            return failure("Error: 'xm shutdown' requires 1 argument.".to_string());
        };
        match self.domains.get(name).map(|d| d.status) {
            None => not_found(name),
            Some(STATUS_RUNNING) => {
                let target = if self.remove_on_shutdown {
                    None
                } else {
                    Some(STATUS_SHUTDOWN)
                };
                self.begin_transition(name, target);
                ToolInvocation::completed(Some(0), "", "")
            }
            Some(_) => failure(format!("Error: Domain '{}' is not running", name)),
        }
    }
}

fn failure(stderr: String) -> ToolInvocation {
    ToolInvocation::completed(Some(1), "", stderr)
}

fn not_found(name: &str) -> ToolInvocation {
    failure(format!("Error: Domain '{}' does not exist.", name))
}

#[async_trait]
impl CommandRunner for MockXm {
    fn binary(&self) -> &Path {
        &self.binary
    }

    fn check_available(&self) -> io::Result<()> {
        if self.state().launch_failure {
            Err(io::Error::new(io::ErrorKind::NotFound, "file not found"))
        } else {
            Ok(())
        }
    }

    async fn invoke(&self, args: &[String]) -> ToolInvocation {
        let mut state = self.state();
        state.invocations.push(args.to_vec());
        debug!(args = ?args, "Simulated xm invocation");

        if state.launch_failure {
            return ToolInvocation::launch_failed(io::Error::new(
                io::ErrorKind::NotFound,
                "No such file or directory (os error 2)",
            ));
        }

        let subcommand = args.first().map(String::as_str).unwrap_or_default();
        if let Some(stderr) = state.rejections.get(subcommand) {
            return failure(stderr.clone());
        }

        match subcommand {
            "list" => state.list(args),
            "restore" => state.restore(args),
            "create" => state.create(args),
            "shutdown" => state.shutdown(args),
            other => failure(format!("Error: Subcommand {} not found!", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::InvocationOutcome;
    use crate::sexpr;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_restore_and_shutdown() {
        let xm = MockXm::new();
        xm.register_snapshot("/snap/win7", "win7");

        assert!(xm.invoke(&args(&["restore", "/snap/win7"])).await.success());
        assert_eq!(xm.status_code("win7"), Some(STATUS_RUNNING));

        // Second restore of a running domain is rejected
        let again = xm.invoke(&args(&["restore", "/snap/win7"])).await;
        assert_eq!(again.outcome(), InvocationOutcome::ToolError);

        assert!(xm.invoke(&args(&["shutdown", "win7"])).await.success());
        assert_eq!(xm.status_code("win7"), Some(STATUS_SHUTDOWN));
        assert_eq!(xm.invocation_count("restore"), 2);
    }

    #[tokio::test]
    async fn test_delayed_transition() {
        let xm = MockXm::new();
        xm.set_transition_delay(2);

        assert!(xm.invoke(&args(&["create", "/etc/xen/base.cfg", "name=w"])).await.success());
        assert_eq!(xm.status_code("w"), Some(STATUS_HALTED));

        xm.invoke(&args(&["list", "-l", "w"])).await;
        assert_eq!(xm.status_code("w"), Some(STATUS_HALTED));
        xm.invoke(&args(&["list", "-l", "w"])).await;
        assert_eq!(xm.status_code("w"), Some(STATUS_RUNNING));
    }

    #[tokio::test]
    async fn test_shutdown_removes_domain() {
        let xm = MockXm::new();
        xm.set_remove_on_shutdown(true);
        xm.add_machine("w", STATUS_RUNNING);

        assert!(xm.invoke(&args(&["shutdown", "w"])).await.success());
        assert_eq!(xm.status_code("w"), None);

        let query = xm.invoke(&args(&["list", "-l", "w"])).await;
        assert_eq!(query.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_list_output_is_parseable() {
        let xm = MockXm::new();
        xm.add_machine("a", STATUS_RUNNING);
        xm.add_machine("b", STATUS_CRASHED);

        let list = xm.invoke(&args(&["list", "-l"])).await;
        let records = sexpr::parse(&list.stdout).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].field("name"), Some("b"));
        assert_eq!(records[1].field("status"), Some("5"));
    }

    #[tokio::test]
    async fn test_launch_failure_and_rejection() {
        let xm = MockXm::new();
        xm.reject("shutdown", "Error: permission denied");
        xm.add_machine("a", STATUS_RUNNING);

        let rejected = xm.invoke(&args(&["shutdown", "a"])).await;
        assert_eq!(rejected.stderr_text(), "Error: permission denied");

        xm.fail_launch();
        let failed = xm.invoke(&args(&["list"])).await;
        assert_eq!(failed.outcome(), InvocationOutcome::LaunchFailed);
        assert_eq!(xm.invocations().len(), 2);
    }
}
