use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::ControlError;
use crate::logging::LogBuffer;

/// Everything needed to bring the workload up once.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub artifact: PathBuf,
    pub credential: String,
    pub port: String,
    pub log: LogBuffer,
}

impl LaunchRequest {
    /// Lines answered to the workload's interactive prompts, in order.
    pub fn prompt_answers(&self) -> String {
        format!("{}\n{}\n", self.credential, self.port)
    }
}

/// Starts the workload detached. No handle is returned: liveness is only ever
/// observed through the process table.
pub trait Launcher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> Result<()>;
}

/// Runs `<compat layer...> <artifact>`, e.g. `wine RAY_DELTA_RADAR.exe`.
#[derive(Debug, Clone)]
pub struct CompatLauncher {
    prefix: Vec<String>,
}

impl CompatLauncher {
    /// An empty command line runs the artifact directly.
    pub fn from_command_line(command_line: &str) -> Result<Self> {
        let prefix = shell_words::split(command_line).map_err(|err| {
            ControlError::LaunchFailure(format!("invalid launcher command: {err}"))
        })?;
        Ok(Self { prefix })
    }

    fn program_for(&self, artifact: &Path) -> (PathBuf, Vec<PathBuf>) {
        match self.prefix.split_first() {
            Some((program, rest)) => {
                let mut args: Vec<PathBuf> = rest.iter().map(PathBuf::from).collect();
                args.push(artifact.to_path_buf());
                (PathBuf::from(program), args)
            }
            None => (artifact.to_path_buf(), Vec::new()),
        }
    }
}

impl Launcher for CompatLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<()> {
        let stdout = request
            .log
            .open_writer()
            .map_err(|err| ControlError::LaunchFailure(format!("{err:#}")))?;
        let stderr = stdout.try_clone().map_err(|err| {
            ControlError::LaunchFailure(format!("failed to duplicate log handle: {err}"))
        })?;

        let (program, args) = self.program_for(&request.artifact);
        let mut command = Command::new(&program);
        #[cfg(unix)]
        {
            // Own process group, so a stop can take down the layer and the
            // binary it hosts together.
            unsafe {
                command.pre_exec(|| {
                    if nix::libc::setpgid(0, 0) == 0 {
                        Ok(())
                    } else {
                        Err(std::io::Error::last_os_error())
                    }
                });
            }
        }
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = request
            .artifact
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
        {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|err| {
            ControlError::LaunchFailure(format!("failed to spawn {}: {err}", program.display()))
        })?;
        let pid = child.id();
        info!(
            "launched {} via {} (pid {}), output to {}",
            request.artifact.display(),
            program.display(),
            pid.map_or_else(|| "-".to_string(), |pid| pid.to_string()),
            request.log.path().display()
        );

        let stdin = child.stdin.take();
        let answers = request.prompt_answers();
        tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(err) = stdin.write_all(answers.as_bytes()).await {
                    warn!("failed to answer workload prompts: {err}");
                }
                // Closing stdin is the end-of-input the prompts expect.
                drop(stdin);
            }
            // Reap, so the exited workload never lingers in the process table.
            match child.wait().await {
                Ok(status) => info!("workload exited: {status}"),
                Err(err) => warn!("failed waiting for workload: {err}"),
            }
        });

        Ok(())
    }
}

/// Opens the workload's port on the host firewall before launch.
pub trait Firewall: Send + Sync {
    fn open_port(&self, port: &str) -> Result<()>;
}

/// Runs a command template such as `ufw allow {port}/tcp`. Without a template
/// nothing is run.
#[derive(Debug, Clone, Default)]
pub struct CommandFirewall {
    template: Option<String>,
}

impl CommandFirewall {
    pub fn new(template: Option<String>) -> Self {
        Self { template }
    }
}

impl Firewall for CommandFirewall {
    fn open_port(&self, port: &str) -> Result<()> {
        let Some(template) = self.template.as_deref() else {
            debug!("no firewall command configured; skipping port {port}");
            return Ok(());
        };

        let command_line = template.replace("{port}", port);
        let tokens = shell_words::split(&command_line).map_err(|err| {
            ControlError::LaunchFailure(format!("invalid firewall command: {err}"))
        })?;
        let Some((program, args)) = tokens.split_first() else {
            return Err(
                ControlError::LaunchFailure("firewall command is empty".to_string()).into(),
            );
        };

        let output = std::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                ControlError::LaunchFailure(format!("failed to run {program}: {err}"))
            })?;
        if !output.status.success() {
            return Err(ControlError::LaunchFailure(format!(
                "`{command_line}` failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }

        info!("opened firewall port {port}");
        Ok(())
    }
}
