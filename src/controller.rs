use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::artifact::{ArtifactInfo, ArtifactManager};
use crate::config::AppConfig;
use crate::errors::ControlError;
use crate::launcher::{CommandFirewall, CompatLauncher, Firewall, LaunchRequest, Launcher};
use crate::logging::LogBuffer;
use crate::orchestrator::{ConfigOutcome, PendingRestart, RestartOrchestrator};
use crate::process::{ProcessProbe, ProcessTable, SystemProcessTable, WorkloadState};
use crate::settings::{ConfigStore, WorkloadSettings};
use crate::supervisor::{CommandSupervisor, Supervisor};
use crate::transcode::{LogTranscoder, ScriptVariant};

/// The OS-facing collaborators the controller drives.
#[derive(Clone)]
pub struct Capabilities {
    pub table: Arc<dyn ProcessTable>,
    pub launcher: Arc<dyn Launcher>,
    pub firewall: Arc<dyn Firewall>,
    pub supervisor: Arc<dyn Supervisor>,
}

impl Capabilities {
    pub fn system(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            table: Arc::new(SystemProcessTable),
            launcher: Arc::new(CompatLauncher::from_command_line(&config.launcher)?),
            firewall: Arc::new(CommandFirewall::new(config.firewall_command.clone())),
            supervisor: Arc::new(CommandSupervisor::new(config.supervisor_command.clone())),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Launched,
    AlreadyRunning,
}

/// Lifecycle of the single managed workload.
///
/// Artifact mutations (upload, delete) and launches share one exclusive
/// section so a launch never races a replacement of the binary. Status, log
/// and settings reads take no lock.
pub struct WorkloadController {
    artifact: ArtifactManager,
    probe: ProcessProbe,
    launcher: Arc<dyn Launcher>,
    firewall: Arc<dyn Firewall>,
    log: LogBuffer,
    transcoder: LogTranscoder,
    settings: ConfigStore,
    orchestrator: RestartOrchestrator,
    artifact_section: Mutex<()>,
}

impl WorkloadController {
    pub fn new(config: &AppConfig, capabilities: Capabilities) -> Self {
        let log = LogBuffer::new(&config.log_path);
        Self {
            artifact: ArtifactManager::new(&config.artifact_path, config.max_upload_bytes)
                .with_idle_timeout(config.upload_idle_timeout),
            probe: ProcessProbe::new(capabilities.table, config.process_pattern()),
            launcher: capabilities.launcher,
            firewall: capabilities.firewall,
            transcoder: LogTranscoder::new(log.clone()),
            log,
            settings: ConfigStore::load(&config.settings_path),
            orchestrator: RestartOrchestrator::new(
                capabilities.supervisor,
                config.restart_grace,
                config.restart_attempts,
            ),
            artifact_section: Mutex::new(()),
        }
    }

    pub fn artifact_info(&self) -> ArtifactInfo {
        self.artifact.info()
    }

    pub async fn start(&self) -> Result<StartOutcome> {
        let _section = self.artifact_section.lock().await;
        self.require_artifact()?;

        if self.probe_status().await? == WorkloadState::Running {
            info!("{} is already running; not launching again", self.probe.pattern());
            return Ok(StartOutcome::AlreadyRunning);
        }

        let settings = self.settings.get().await;
        let firewall = Arc::clone(&self.firewall);
        let port = settings.port.clone();
        tokio::task::spawn_blocking(move || firewall.open_port(&port))
            .await
            .context("firewall task panicked")??;

        self.launcher.launch(&LaunchRequest {
            artifact: self.artifact.path().to_path_buf(),
            credential: settings.credential,
            port: settings.port,
            log: self.log.clone(),
        })?;
        Ok(StartOutcome::Launched)
    }

    /// Stops every matching process and empties the log. Finding nothing to
    /// stop is success; the returned count is informational.
    pub async fn stop(&self) -> Result<usize> {
        let probe = self.probe.clone();
        let terminated = tokio::task::spawn_blocking(move || probe.stop())
            .await
            .context("stop task panicked")?;
        self.log.truncate()?;
        info!(
            "stop issued for {} ({terminated} process(es) signalled); log cleared",
            self.probe.pattern()
        );
        Ok(terminated)
    }

    pub async fn status(&self) -> Result<WorkloadState> {
        self.require_artifact()?;
        self.probe_status().await
    }

    /// The body is received before the section is taken; only the final
    /// rename excludes launches and deletes.
    pub async fn upload<R>(&self, reader: &mut R, expected_len: Option<u64>) -> Result<ArtifactInfo>
    where
        R: AsyncRead + Unpin,
    {
        let staged = self.artifact.stage(reader, expected_len).await?;
        let _section = self.artifact_section.lock().await;
        self.artifact.install(staged).await
    }

    /// Removes the artifact after stopping the workload. Once the unlink has
    /// happened the delete has succeeded; clearing the log is best-effort.
    pub async fn delete(&self) -> Result<()> {
        let _section = self.artifact_section.lock().await;
        self.require_artifact()?;

        let probe = self.probe.clone();
        tokio::task::spawn_blocking(move || probe.stop())
            .await
            .context("stop task panicked")?;
        self.artifact.remove()?;

        if let Err(err) = self.log.truncate() {
            warn!("artifact deleted but log could not be cleared: {err:#}");
        }
        Ok(())
    }

    pub fn read_log(&self, variant: ScriptVariant, tail: Option<usize>) -> Result<String> {
        self.transcoder.read(variant, tail)
    }

    pub async fn config(&self) -> WorkloadSettings {
        self.settings.get().await
    }

    pub async fn save_config(&self, candidate: WorkloadSettings) -> Result<ConfigOutcome> {
        self.orchestrator
            .save_config(&self.settings, &self.probe, candidate)
            .await
    }

    pub fn request_restart(&self) -> PendingRestart {
        self.orchestrator.request_restart()
    }

    fn require_artifact(&self) -> Result<()> {
        if self.artifact.exists() {
            Ok(())
        } else {
            Err(ControlError::ArtifactNotFound(self.artifact.path().to_path_buf()).into())
        }
    }

    async fn probe_status(&self) -> Result<WorkloadState> {
        let probe = self.probe.clone();
        tokio::task::spawn_blocking(move || probe.status())
            .await
            .context("status task panicked")
    }
}
