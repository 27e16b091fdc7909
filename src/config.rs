use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_ARTIFACT_NAME: &str = "RAY_DELTA_RADAR.exe";
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_LAUNCHER: &str = "wine";
const DEFAULT_SUPERVISOR_CMD: &str = "systemctl restart radarctl";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_dir: PathBuf,
    pub listen_addr: String,
    pub artifact_path: PathBuf,
    pub log_path: PathBuf,
    pub settings_path: PathBuf,
    pub launcher: String,
    pub firewall_command: Option<String>,
    pub supervisor_command: String,
    pub restart_grace: Duration,
    pub restart_attempts: u32,
    pub max_upload_bytes: u64,
    /// Longest pause allowed between two reads of an upload body.
    pub upload_idle_timeout: Duration,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let base_dir = env::var("RADARCTL_HOME")
            .map(PathBuf::from)
            .ok()
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(env::temp_dir)
                    .join("radarctl")
            });
        let listen_addr =
            env_string("RADARCTL_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let artifact_path = env_string("RADARCTL_ARTIFACT")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join(DEFAULT_ARTIFACT_NAME));
        let log_path = env_string("RADARCTL_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("radar.log"));
        let settings_path = base_dir.join("settings.json");
        // An explicitly empty launcher means "run the artifact directly".
        let launcher = env::var("RADARCTL_LAUNCHER")
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|_| DEFAULT_LAUNCHER.to_string());
        let firewall_command = env_string("RADARCTL_FIREWALL_CMD");
        let supervisor_command = env_string("RADARCTL_SUPERVISOR_CMD")
            .unwrap_or_else(|| DEFAULT_SUPERVISOR_CMD.to_string());

        let config = Self {
            base_dir,
            listen_addr,
            artifact_path,
            log_path,
            settings_path,
            launcher,
            firewall_command,
            supervisor_command,
            restart_grace: Duration::from_millis(env_u64("RADARCTL_RESTART_GRACE_MS", 500)),
            restart_attempts: env_u64("RADARCTL_RESTART_ATTEMPTS", 3).max(1) as u32,
            max_upload_bytes: env_u64("RADARCTL_MAX_UPLOAD_MB", 256)
                .max(1)
                .saturating_mul(1024 * 1024),
            upload_idle_timeout: Duration::from_secs(
                env_u64("RADARCTL_UPLOAD_IDLE_SECS", 30).max(1),
            ),
        };
        config.ensure_layout()?;
        Ok(config)
    }

    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("failed to create {}", self.base_dir.display()))?;
        for path in [&self.artifact_path, &self.log_path, &self.settings_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        Ok(())
    }

    /// Name the workload is recognised by in the process table.
    pub fn process_pattern(&self) -> String {
        self.artifact_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_ARTIFACT_NAME.to_string())
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
