use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::errors::ControlError;

/// The workload's captured output. Only the launched process appends to it;
/// the controller creates, truncates and reads it.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    path: PathBuf,
}

impl LogBuffer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Empties the log, creating it if needed.
    pub fn truncate(&self) -> Result<()> {
        self.open_truncated()
            .map(drop)
            .with_context(|| format!("failed to truncate {}", self.path.display()))
    }

    /// Opens the log as a fresh redirect target for a launch, the way a shell
    /// `> file` would.
    pub fn open_writer(&self) -> Result<File> {
        self.open_truncated()
            .with_context(|| format!("failed opening {}", self.path.display()))
    }

    pub fn read_raw(&self) -> Result<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ControlError::LogUnavailable(self.path.clone()).into())
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed reading {}", self.path.display()))
            }
        }
    }

    fn open_truncated(&self) -> std::io::Result<File> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(&self.path)
    }
}

/// Keeps the last `max_lines` lines of `text`.
pub fn last_lines(text: &str, max_lines: usize) -> String {
    if max_lines == 0 {
        return String::new();
    }

    let mut ring = VecDeque::with_capacity(max_lines.saturating_add(1));
    for line in text.lines() {
        ring.push_back(line);
        if ring.len() > max_lines {
            ring.pop_front();
        }
    }

    ring.into_iter().collect::<Vec<_>>().join("\n")
}
