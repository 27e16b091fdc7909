use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),
    #[error("failed to move uploaded artifact into place at {}: {source}", .path.display())]
    RenameFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch workload: {0}")]
    LaunchFailure(String),
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),
    #[error("failed to persist configuration: {0}")]
    Persistence(String),
    #[error("supervisor restart failed: {0}")]
    SupervisorRestartFailure(String),
    #[error("log not yet created: {}", .0.display())]
    LogUnavailable(PathBuf),
    #[error("upload exceeds the {limit} byte limit")]
    UploadTooLarge { limit: u64 },
    #[error("upload stalled: no data received for {idle:?}")]
    UploadStalled { idle: Duration },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

