use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::errors::ControlError;
use crate::process::{ProcessProbe, WorkloadState};
use crate::settings::{ConfigStore, WorkloadSettings};
use crate::supervisor::Supervisor;

const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Sequences operations whose last step may restart the very service that
/// is answering the request.
///
/// Phase one happens inside the request: commit the change and hand back a
/// [`PendingRestart`]. Phase two runs only after the response has been
/// written: [`PendingRestart::spawn`] waits the grace delay and drives the
/// supervisor with retries. Restarts are coalesced, so triggering twice
/// while one is in flight restarts once.
#[derive(Clone)]
pub struct RestartOrchestrator {
    supervisor: Arc<dyn Supervisor>,
    grace: Duration,
    attempts: u32,
    in_flight: Arc<AtomicBool>,
}

/// Outcome of a settings save.
#[derive(Debug)]
pub enum ConfigOutcome {
    /// The workload was running; the restart fires once the caller responds.
    Restarting(PendingRestart),
    /// Nothing was running; the settings apply on the next launch.
    AppliesNextLaunch,
}

#[must_use = "a pending restart does nothing until executed"]
pub struct PendingRestart {
    supervisor: Arc<dyn Supervisor>,
    grace: Duration,
    attempts: u32,
    in_flight: Arc<AtomicBool>,
}

impl std::fmt::Debug for PendingRestart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRestart")
            .field("grace", &self.grace)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl RestartOrchestrator {
    pub fn new(supervisor: Arc<dyn Supervisor>, grace: Duration, attempts: u32) -> Self {
        Self {
            supervisor,
            grace,
            attempts: attempts.max(1),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_restart(&self) -> PendingRestart {
        PendingRestart {
            supervisor: Arc::clone(&self.supervisor),
            grace: self.grace,
            attempts: self.attempts,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Saves `candidate` and decides whether the change needs a restart. The
    /// settings writer stays held across the save and the status probe, so
    /// no other save can slip in between them.
    pub async fn save_config(
        &self,
        store: &ConfigStore,
        probe: &ProcessProbe,
        candidate: WorkloadSettings,
    ) -> Result<ConfigOutcome> {
        let mut writer = store.lock().await;
        writer.save(candidate).await?;

        let scan = probe.clone();
        let state = tokio::task::spawn_blocking(move || scan.status())
            .await
            .context("status task panicked")?;
        let outcome = match state {
            WorkloadState::Running => {
                info!("settings changed while {} is running; restart queued", probe.pattern());
                ConfigOutcome::Restarting(self.request_restart())
            }
            WorkloadState::NotRunning => ConfigOutcome::AppliesNextLaunch,
        };
        drop(writer);
        Ok(outcome)
    }
}

impl PendingRestart {
    pub async fn execute(self) -> Result<()> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            info!("service restart already in flight; coalescing");
            return Ok(());
        }

        sleep(self.grace).await;
        let result = self.run_attempts().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    /// Runs the restart detached. Failures at this point can no longer reach
    /// the original caller and are only logged.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(err) = self.execute().await {
                error!("service restart failed after response was sent: {err:#}");
            }
        })
    }

    async fn run_attempts(&self) -> Result<()> {
        let mut last_error = String::new();
        for attempt in 1..=self.attempts {
            let supervisor = Arc::clone(&self.supervisor);
            let outcome = tokio::task::spawn_blocking(move || supervisor.restart())
                .await
                .context("supervisor restart task panicked")?;
            match outcome {
                Ok(()) => {
                    info!("service restart issued (attempt {attempt})");
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        "service restart attempt {attempt}/{} failed: {err:#}",
                        self.attempts
                    );
                    last_error = format!("{err:#}");
                    if attempt < self.attempts {
                        sleep(RETRY_BACKOFF * attempt).await;
                    }
                }
            }
        }
        Err(ControlError::SupervisorRestartFailure(last_error).into())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    use super::{ConfigOutcome, RestartOrchestrator};
    use crate::config::tests::temp_dir;
    use crate::errors::ControlError;
    use crate::process::tests::FakeProcessTable;
    use crate::process::ProcessProbe;
    use crate::settings::{ConfigStore, WorkloadSettings};
    use crate::supervisor::tests::FakeSupervisor;

    fn orchestrator(supervisor: Arc<FakeSupervisor>, attempts: u32) -> RestartOrchestrator {
        RestartOrchestrator::new(supervisor, Duration::ZERO, attempts)
    }

    fn settings(credential: &str) -> WorkloadSettings {
        WorkloadSettings {
            credential: credential.to_string(),
            port: "8080".to_string(),
        }
    }

    #[tokio::test]
    async fn pending_restart_runs_supervisor_once() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let pending = orchestrator(supervisor.clone(), 3).request_restart();
        assert_eq!(supervisor.calls(), 0, "nothing happens before execute");

        pending.execute().await.expect("restart should succeed");
        assert_eq!(supervisor.calls(), 1);
    }

    #[tokio::test]
    async fn restart_retries_until_supervisor_succeeds() {
        let supervisor = Arc::new(FakeSupervisor::failing(1));
        orchestrator(supervisor.clone(), 3)
            .request_restart()
            .execute()
            .await
            .expect("second attempt should succeed");
        assert_eq!(supervisor.calls(), 2);
    }

    #[tokio::test]
    async fn restart_gives_up_after_attempts() {
        let supervisor = Arc::new(FakeSupervisor::failing(10));
        let err = orchestrator(supervisor.clone(), 2)
            .request_restart()
            .execute()
            .await
            .expect_err("restart should fail");
        assert!(matches!(
            err.downcast_ref::<ControlError>(),
            Some(ControlError::SupervisorRestartFailure(_))
        ));
        assert_eq!(supervisor.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_restarts_are_coalesced() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let orchestrator =
            RestartOrchestrator::new(supervisor.clone(), Duration::from_millis(100), 1);

        let first = orchestrator.request_restart().spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        orchestrator
            .request_restart()
            .execute()
            .await
            .expect("coalesced restart is a no-op");
        first.await.expect("restart task panicked");

        assert_eq!(supervisor.calls(), 1);

        orchestrator
            .request_restart()
            .execute()
            .await
            .expect("a later restart runs again");
        assert_eq!(supervisor.calls(), 2);
    }

    #[tokio::test]
    async fn save_while_running_requests_restart() {
        let base = temp_dir("orchestrator-running");
        fs::create_dir_all(&base).expect("failed to create base");
        let store = ConfigStore::load(&base.join("settings.json"));
        let table = Arc::new(FakeProcessTable::default());
        table.spawn("wine /srv/RAY_DELTA_RADAR.exe");
        let probe = ProcessProbe::new(table, "RAY_DELTA_RADAR.exe");
        let supervisor = Arc::new(FakeSupervisor::default());

        let outcome = orchestrator(supervisor.clone(), 1)
            .save_config(&store, &probe, settings("newpass1"))
            .await
            .expect("save should succeed");

        match outcome {
            ConfigOutcome::Restarting(pending) => {
                pending.execute().await.expect("restart should succeed")
            }
            other => panic!("expected a restart, got {other:?}"),
        }
        assert_eq!(supervisor.calls(), 1);
        assert_eq!(store.get().await, settings("newpass1"));

        let _ = fs::remove_dir_all(base);
    }

    #[tokio::test]
    async fn save_scans_processes_off_the_runtime_thread() {
        let base = temp_dir("orchestrator-blocking-scan");
        fs::create_dir_all(&base).expect("failed to create base");
        let store = ConfigStore::load(&base.join("settings.json"));
        let table = Arc::new(FakeProcessTable::default());
        let probe = ProcessProbe::new(table.clone(), "RAY_DELTA_RADAR.exe");

        orchestrator(Arc::new(FakeSupervisor::default()), 1)
            .save_config(&store, &probe, settings("newpass1"))
            .await
            .expect("save should succeed");

        let runtime_thread = std::thread::current().id();
        let threads = table.find_threads.lock().expect("fake table poisoned").clone();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], runtime_thread, "scan ran on the async worker");

        let _ = fs::remove_dir_all(base);
    }

    #[tokio::test]
    async fn save_while_stopped_applies_next_launch() {
        let base = temp_dir("orchestrator-stopped");
        fs::create_dir_all(&base).expect("failed to create base");
        let store = ConfigStore::load(&base.join("settings.json"));
        let probe = ProcessProbe::new(
            Arc::new(FakeProcessTable::default()),
            "RAY_DELTA_RADAR.exe",
        );
        let supervisor = Arc::new(FakeSupervisor::default());

        let outcome = orchestrator(supervisor.clone(), 1)
            .save_config(&store, &probe, settings("newpass1"))
            .await
            .expect("save should succeed");

        assert!(matches!(outcome, ConfigOutcome::AppliesNextLaunch));
        assert_eq!(supervisor.calls(), 0);
        assert_eq!(store.get().await, settings("newpass1"));

        let _ = fs::remove_dir_all(base);
    }

    #[tokio::test]
    async fn invalid_save_never_probes_or_restarts() {
        let base = temp_dir("orchestrator-invalid");
        fs::create_dir_all(&base).expect("failed to create base");
        let store = ConfigStore::load(&base.join("settings.json"));
        let table = Arc::new(FakeProcessTable::default());
        table.spawn("wine /srv/RAY_DELTA_RADAR.exe");
        let probe = ProcessProbe::new(table.clone(), "RAY_DELTA_RADAR.exe");
        let supervisor = Arc::new(FakeSupervisor::default());

        let err = orchestrator(supervisor.clone(), 1)
            .save_config(&store, &probe, settings("short"))
            .await
            .expect_err("invalid settings must fail");
        assert!(matches!(
            err.downcast_ref::<ControlError>(),
            Some(ControlError::ConfigValidation(_))
        ));
        assert_eq!(
            table
                .find_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        assert_eq!(supervisor.calls(), 0);
        assert_eq!(store.get().await, WorkloadSettings::default());

        let _ = fs::remove_dir_all(base);
    }
}
