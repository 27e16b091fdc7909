use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{info, warn};

use crate::errors::ControlError;
use crate::storage::{load_record, save_record};

pub const CREDENTIAL_LEN: usize = 8;
const DEFAULT_CREDENTIAL: &str = "admin666";
const DEFAULT_PORT: &str = "8080";

/// Values fed to the workload's interactive prompts at launch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadSettings {
    #[serde(default)]
    pub credential: String,
    #[serde(default, deserialize_with = "deserialize_port")]
    pub port: String,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            credential: DEFAULT_CREDENTIAL.to_string(),
            port: DEFAULT_PORT.to_string(),
        }
    }
}

impl WorkloadSettings {
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.credential.is_empty() || self.port.trim().is_empty() {
            return Err(ControlError::ConfigValidation(
                "credential and port are both required".to_string(),
            ));
        }
        let length = self.credential.chars().count();
        if length != CREDENTIAL_LEN {
            return Err(ControlError::ConfigValidation(format!(
                "credential must be exactly {CREDENTIAL_LEN} characters, got {length}"
            )));
        }
        match self.port.trim().parse::<u16>() {
            Ok(port) if port > 0 => Ok(()),
            _ => Err(ControlError::ConfigValidation(format!(
                "port must be a number between 1 and 65535, got {:?}",
                self.port
            ))),
        }
    }

    pub fn redacted_for_transport(&self) -> Self {
        Self {
            credential: "*".repeat(self.credential.chars().count()),
            port: self.port.clone(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortToken {
    Text(String),
    Number(u64),
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match PortToken::deserialize(deserializer)? {
        PortToken::Text(value) => value.trim().to_string(),
        PortToken::Number(value) => value.to_string(),
    })
}

/// Authoritative in-memory copy of the settings, backed by a JSON record.
///
/// Readers never touch disk. Writers go through [`ConfigStore::lock`], which
/// serialises saves and lets a caller hold the section across follow-up reads
/// (the restart decision in the orchestrator).
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<WorkloadSettings>,
    writer: Mutex<()>,
}

pub struct ConfigWriter<'a> {
    store: &'a ConfigStore,
    _guard: MutexGuard<'a, ()>,
}

impl ConfigStore {
    /// Never fails: unreadable or invalid records fall back to the defaults.
    pub fn load(path: &Path) -> Self {
        let current = match load_record::<WorkloadSettings>(path) {
            Ok(Some(settings)) => match settings.validate() {
                Ok(()) => {
                    info!("loaded workload settings from {}", path.display());
                    settings
                }
                Err(err) => {
                    warn!(
                        "settings in {} are invalid ({err}); using defaults",
                        path.display()
                    );
                    WorkloadSettings::default()
                }
            },
            Ok(None) => {
                info!(
                    "no settings record at {}; using defaults",
                    path.display()
                );
                WorkloadSettings::default()
            }
            Err(err) => {
                warn!("failed to load settings ({err:#}); using defaults");
                WorkloadSettings::default()
            }
        };

        Self {
            path: path.to_path_buf(),
            current: RwLock::new(current),
            writer: Mutex::new(()),
        }
    }

    pub async fn get(&self) -> WorkloadSettings {
        self.current.read().await.clone()
    }

    pub async fn lock(&self) -> ConfigWriter<'_> {
        ConfigWriter {
            store: self,
            _guard: self.writer.lock().await,
        }
    }
}

impl ConfigWriter<'_> {
    /// Validates, persists, and only then swaps the in-memory copy.
    pub async fn save(&mut self, candidate: WorkloadSettings) -> Result<()> {
        candidate.validate()?;
        let candidate = WorkloadSettings {
            credential: candidate.credential,
            port: candidate.port.trim().to_string(),
        };

        save_record(&self.store.path, &candidate)
            .map_err(|err| ControlError::Persistence(format!("{err:#}")))?;

        *self.store.current.write().await = candidate;
        info!("saved workload settings to {}", self.store.path.display());
        Ok(())
    }
}
