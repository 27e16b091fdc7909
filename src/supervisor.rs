use std::process::{Command, Stdio};

use anyhow::Result;
use tracing::info;

use crate::errors::ControlError;

/// Restarts the service hosting this controller.
pub trait Supervisor: Send + Sync {
    fn restart(&self) -> Result<()>;
}

/// Runs a fixed command such as `systemctl restart radarctl`.
#[derive(Debug, Clone)]
pub struct CommandSupervisor {
    command_line: String,
}

impl CommandSupervisor {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
        }
    }
}

impl Supervisor for CommandSupervisor {
    fn restart(&self) -> Result<()> {
        let tokens = shell_words::split(&self.command_line).map_err(|err| {
            ControlError::SupervisorRestartFailure(format!("invalid supervisor command: {err}"))
        })?;
        let Some((program, args)) = tokens.split_first() else {
            return Err(ControlError::SupervisorRestartFailure(
                "supervisor command is empty".to_string(),
            )
            .into());
        };

        info!("requesting service restart via `{}`", self.command_line);
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                ControlError::SupervisorRestartFailure(format!("failed to run {program}: {err}"))
            })?;
        if !output.status.success() {
            return Err(ControlError::SupervisorRestartFailure(format!(
                "`{}` failed with {}: {}",
                self.command_line,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;

    use super::{CommandSupervisor, Supervisor};
    use crate::errors::ControlError;

    /// Counts restarts; fails the first `failures` calls.
    #[derive(Default)]
    pub(crate) struct FakeSupervisor {
        pub(crate) calls: AtomicUsize,
        pub(crate) failures: usize,
    }

    impl FakeSupervisor {
        pub(crate) fn failing(failures: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Supervisor for FakeSupervisor {
        fn restart(&self) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(ControlError::SupervisorRestartFailure(
                    "pm2: process not found".to_string(),
                )
                .into());
            }
            Ok(())
        }
    }

    #[cfg(unix)]
    #[test]
    fn command_supervisor_maps_exit_status() {
        CommandSupervisor::new("true")
            .restart()
            .expect("true should succeed");

        let err = CommandSupervisor::new("false")
            .restart()
            .expect_err("false should fail");
        assert!(matches!(
            err.downcast_ref::<ControlError>(),
            Some(ControlError::SupervisorRestartFailure(_))
        ));
    }

    #[test]
    fn command_supervisor_rejects_empty_command() {
        let err = CommandSupervisor::new("   ")
            .restart()
            .expect_err("empty command should fail");
        assert!(matches!(
            err.downcast_ref::<ControlError>(),
            Some(ControlError::SupervisorRestartFailure(_))
        ));
    }
}
