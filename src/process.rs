use std::ffi::OsStr;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Live state of the workload. Derived from the process table on every
/// query; a failed query and an empty result are the same `NotRunning`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadState {
    Running,
    NotRunning,
}

impl std::fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            WorkloadState::Running => "running",
            WorkloadState::NotRunning => "not running",
        };
        write!(f, "{value}")
    }
}

/// OS process table, addressed by name pattern rather than pid.
pub trait ProcessTable: Send + Sync {
    /// Pids whose name or command line contains `pattern`.
    fn find(&self, pattern: &str) -> Result<Vec<u32>>;

    /// Asks every match to terminate. Errors when nothing matched.
    fn terminate(&self, pattern: &str) -> Result<usize>;
}

/// [`ProcessTable`] backed by a `sysinfo` scan and `nix` signals.
#[derive(Debug, Default)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    fn scan(pattern: &str) -> Vec<u32> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );
        let own_pid = std::process::id();

        let mut pids: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own_pid)
            .filter(|(_, process)| !matches!(process.status(), ProcessStatus::Zombie))
            .filter(|(_, process)| {
                os_contains(process.name(), pattern)
                    || process.cmd().iter().any(|arg| os_contains(arg, pattern))
            })
            .map(|(pid, _)| pid.as_u32())
            .collect();
        pids.sort_unstable();
        pids
    }
}

impl ProcessTable for SystemProcessTable {
    fn find(&self, pattern: &str) -> Result<Vec<u32>> {
        if pattern.trim().is_empty() {
            anyhow::bail!("process pattern cannot be empty");
        }
        Ok(Self::scan(pattern))
    }

    fn terminate(&self, pattern: &str) -> Result<usize> {
        let pids = self.find(pattern)?;
        if pids.is_empty() {
            anyhow::bail!("no process matched {pattern:?}");
        }

        let mut signalled = 0;
        for pid in &pids {
            match terminate_pid(*pid) {
                Ok(()) => signalled += 1,
                Err(err) => warn!("failed to terminate pid {pid} ({pattern}): {err}"),
            }
        }
        if signalled == 0 {
            anyhow::bail!("could not signal any of {} matching processes", pids.len());
        }
        Ok(signalled)
    }
}

fn os_contains(value: &OsStr, pattern: &str) -> bool {
    value.to_string_lossy().contains(pattern)
}

#[cfg(unix)]
fn terminate_pid(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // Launched workloads lead their own process group; take the whole tree
    // down when that is the case.
    match kill(Pid::from_raw(-(pid as i32)), Signal::SIGTERM) {
        Ok(()) => return Ok(()),
        Err(Errno::ESRCH) | Err(Errno::EPERM) => {}
        Err(err) => debug!("process group signal for {pid} failed: {err}"),
    }

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(anyhow::anyhow!("failed to send SIGTERM to {pid}: {err}")),
    }
}

#[cfg(not(unix))]
fn terminate_pid(pid: u32) -> Result<()> {
    use sysinfo::Pid as SysPid;

    let system = System::new_all();
    match system.process(SysPid::from_u32(pid)) {
        Some(process) => {
            if process.kill() {
                Ok(())
            } else {
                Err(anyhow::anyhow!("failed to kill {pid}"))
            }
        }
        None => Ok(()),
    }
}

/// Answers "is the workload running?" and issues name-matched stops.
#[derive(Clone)]
pub struct ProcessProbe {
    table: Arc<dyn ProcessTable>,
    pattern: String,
}

impl ProcessProbe {
    pub fn new(table: Arc<dyn ProcessTable>, pattern: impl Into<String>) -> Self {
        Self {
            table,
            pattern: pattern.into(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn status(&self) -> WorkloadState {
        match self.table.find(&self.pattern) {
            Ok(pids) if !pids.is_empty() => {
                debug!("{} running as {:?}", self.pattern, pids);
                WorkloadState::Running
            }
            Ok(_) => WorkloadState::NotRunning,
            Err(err) => {
                debug!("process probe for {} failed: {err:#}", self.pattern);
                WorkloadState::NotRunning
            }
        }
    }

    /// Best-effort stop. "Nothing to terminate" is the goal state, so every
    /// outcome is reported as stopped; the count is informational.
    pub fn stop(&self) -> usize {
        match self.table.terminate(&self.pattern) {
            Ok(count) => count,
            Err(err) => {
                debug!("terminate for {} found nothing to stop: {err:#}", self.pattern);
                0
            }
        }
    }
}
