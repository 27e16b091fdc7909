use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::errors::ControlError;

const UPLOAD_CHUNK: usize = 64 * 1024;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub exists: bool,
    #[serde(default)]
    pub size: u64,
    /// Last modification, seconds since the Unix epoch.
    #[serde(default)]
    pub modified: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Owns the single managed executable at a fixed path.
#[derive(Debug, Clone)]
pub struct ArtifactManager {
    path: PathBuf,
    max_upload_bytes: u64,
    idle_timeout: Duration,
}

/// A fully received upload sitting in a temp file beside the artifact.
/// Dropping it without [`ArtifactManager::install`] removes the temp file.
#[derive(Debug)]
pub struct StagedUpload {
    tmp_path: Option<PathBuf>,
    digest: String,
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        if let Some(tmp_path) = self.tmp_path.take() {
            discard_tmp(&tmp_path);
        }
    }
}

impl ArtifactManager {
    pub fn new(path: impl Into<PathBuf>, max_upload_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_upload_bytes,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    pub fn info(&self) -> ArtifactInfo {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.is_file() => ArtifactInfo {
                path: self.path.clone(),
                exists: true,
                size: meta.len(),
                modified: meta.modified().ok().and_then(epoch_secs),
                sha256: None,
            },
            _ => ArtifactInfo {
                path: self.path.clone(),
                exists: false,
                size: 0,
                modified: None,
                sha256: None,
            },
        }
    }

    /// Streams `reader` into a temp file beside the artifact and renames it
    /// into place. The canonical path only ever holds a complete artifact.
    #[cfg(test)]
    pub async fn upload<R>(&self, reader: &mut R, expected_len: Option<u64>) -> Result<ArtifactInfo>
    where
        R: AsyncRead + Unpin,
    {
        let staged = self.stage(reader, expected_len).await?;
        self.install(staged).await
    }

    /// Receives the whole body into a temp file without touching the
    /// artifact. When `expected_len` is given, a short or long body is
    /// rejected. A reader idle for longer than the idle timeout fails with
    /// `UploadStalled`.
    pub async fn stage<R>(&self, reader: &mut R, expected_len: Option<u64>) -> Result<StagedUpload>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(len) = expected_len {
            if len > self.max_upload_bytes {
                return Err(ControlError::UploadTooLarge {
                    limit: self.max_upload_bytes,
                }
                .into());
            }
        }

        let tmp_path = self.upload_tmp_path();
        match self.write_tmp(&tmp_path, reader, expected_len).await {
            Ok(digest) => Ok(StagedUpload {
                tmp_path: Some(tmp_path),
                digest,
            }),
            Err(err) => {
                discard_tmp(&tmp_path);
                Err(err)
            }
        }
    }

    /// Renames a staged upload over the artifact.
    pub async fn install(&self, mut staged: StagedUpload) -> Result<ArtifactInfo> {
        let Some(tmp_path) = staged.tmp_path.take() else {
            anyhow::bail!("staged upload was already installed");
        };
        let digest = std::mem::take(&mut staged.digest);
        self.commit(&tmp_path, digest).await
    }

    /// Unlinks the artifact. Absence is `ArtifactNotFound`.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("removed artifact {}", self.path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ControlError::ArtifactNotFound(self.path.clone()).into())
            }
            Err(err) => Err(ControlError::Io(err))
                .with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }

    async fn write_tmp<R>(
        &self,
        tmp_path: &Path,
        reader: &mut R,
        expected_len: Option<u64>,
    ) -> Result<String>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(parent) = tmp_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(tmp_path)
            .await
            .with_context(|| format!("failed to create upload file {}", tmp_path.display()))?;

        let mut hasher = Sha256::new();
        let mut total = 0_u64;
        let mut chunk = vec![0_u8; UPLOAD_CHUNK];
        loop {
            let read = match timeout(self.idle_timeout, reader.read(&mut chunk)).await {
                Ok(read) => read.context("failed to read upload body")?,
                Err(_) => {
                    return Err(ControlError::UploadStalled {
                        idle: self.idle_timeout,
                    }
                    .into())
                }
            };
            if read == 0 {
                break;
            }
            total += read as u64;
            if total > self.max_upload_bytes {
                return Err(ControlError::UploadTooLarge {
                    limit: self.max_upload_bytes,
                }
                .into());
            }
            hasher.update(&chunk[..read]);
            file.write_all(&chunk[..read])
                .await
                .with_context(|| format!("failed writing {}", tmp_path.display()))?;
        }

        if let Some(expected) = expected_len {
            if total != expected {
                anyhow::bail!("upload body ended after {total} of {expected} bytes");
            }
        }

        file.flush()
            .await
            .with_context(|| format!("failed flushing {}", tmp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("failed syncing {}", tmp_path.display()))?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(tmp_path, fs::Permissions::from_mode(0o755))
                .await
                .with_context(|| format!("failed to set permissions on {}", tmp_path.display()))?;
        }

        Ok(format!("{:x}", hasher.finalize()))
    }

    async fn commit(&self, tmp_path: &Path, digest: String) -> Result<ArtifactInfo> {
        if let Err(source) = tokio::fs::rename(tmp_path, &self.path).await {
            discard_tmp(tmp_path);
            return Err(ControlError::RenameFailure {
                path: self.path.clone(),
                source,
            }
            .into());
        }

        let mut info = self.info();
        info.sha256 = Some(digest);
        info!(
            "installed artifact {} ({} bytes, sha256 {})",
            self.path.display(),
            info.size,
            info.sha256.as_deref().unwrap_or_default()
        );
        Ok(info)
    }

    fn upload_tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|value| value.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        self.path
            .with_file_name(format!(".{name}.upload-{}-{nonce}", std::process::id()))
    }
}

fn discard_tmp(tmp_path: &Path) {
    if let Err(err) = fs::remove_file(tmp_path) {
        if err.kind() != ErrorKind::NotFound {
            warn!(
                "failed to remove orphaned upload {}: {err}",
                tmp_path.display()
            );
        }
    }
}

fn epoch_secs(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::ArtifactManager;
    use crate::config::tests::temp_dir;
    use crate::errors::ControlError;

    fn manager(prefix: &str) -> (ArtifactManager, std::path::PathBuf) {
        let base = temp_dir(prefix);
        fs::create_dir_all(&base).expect("failed to create base");
        (
            ArtifactManager::new(base.join("RAY_DELTA_RADAR.exe"), 1024),
            base,
        )
    }

    fn leftover_uploads(dir: &Path) -> usize {
        fs::read_dir(dir)
            .expect("failed to read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".upload-"))
            .count()
    }

    #[tokio::test]
    async fn upload_installs_artifact_and_reports_metadata() {
        let (manager, base) = manager("artifact-upload");
        assert!(!manager.exists());

        let mut body: &[u8] = b"MZ\x90\x00payload";
        let info = manager
            .upload(&mut body, Some(11))
            .await
            .expect("upload should succeed");

        assert!(manager.exists());
        assert!(info.exists);
        assert_eq!(info.size, 11);
        assert!(info.modified.is_some());
        assert_eq!(
            info.sha256.as_deref().map(str::len),
            Some(64),
            "sha256 should be hex encoded"
        );
        assert_eq!(
            fs::read(manager.path()).expect("artifact should exist"),
            b"MZ\x90\x00payload"
        );
        assert_eq!(leftover_uploads(&base), 0);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(manager.path())
                .expect("failed to stat artifact")
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111, "artifact should be executable");
        }

        let _ = fs::remove_dir_all(base);
    }

    #[tokio::test]
    async fn upload_over_existing_updates_mtime() {
        let (manager, base) = manager("artifact-replace");
        let mut first: &[u8] = b"old build";
        let before = manager
            .upload(&mut first, None)
            .await
            .expect("first upload should succeed");

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let mut second: &[u8] = b"new build!";
        let after = manager
            .upload(&mut second, None)
            .await
            .expect("second upload should succeed");

        assert!(after.modified > before.modified, "mtime should advance");
        assert_ne!(after.sha256, before.sha256);
        assert_eq!(
            fs::read(manager.path()).expect("artifact should exist"),
            b"new build!"
        );

        let _ = fs::remove_dir_all(base);
    }

    #[tokio::test]
    async fn in_flight_upload_never_exposes_partial_content() {
        let (manager, base) = manager("artifact-atomic");
        let mut old: &[u8] = b"complete old artifact";
        manager
            .upload(&mut old, None)
            .await
            .expect("seed upload should succeed");

        let (mut writer, mut reader) = tokio::io::duplex(16);
        let uploader = manager.clone();
        let upload =
            tokio::spawn(async move { uploader.upload(&mut reader, Some(12)).await });

        writer.write_all(b"new-").await.expect("write failed");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            fs::read(manager.path()).expect("artifact should exist"),
            b"complete old artifact"
        );

        writer.write_all(b"artifact").await.expect("write failed");
        drop(writer);
        upload
            .await
            .expect("upload task panicked")
            .expect("upload should succeed");
        assert_eq!(
            fs::read(manager.path()).expect("artifact should exist"),
            b"new-artifact"
        );

        let _ = fs::remove_dir_all(base);
    }

    #[tokio::test]
    async fn short_body_keeps_old_artifact() {
        let (manager, base) = manager("artifact-short");
        let mut old: &[u8] = b"old";
        manager
            .upload(&mut old, None)
            .await
            .expect("seed upload should succeed");

        let mut truncated: &[u8] = b"half";
        manager
            .upload(&mut truncated, Some(100))
            .await
            .expect_err("short body must not be installed");

        assert_eq!(fs::read(manager.path()).expect("artifact should exist"), b"old");
        assert_eq!(leftover_uploads(&base), 0);

        let _ = fs::remove_dir_all(base);
    }

    #[tokio::test]
    async fn idle_body_fails_as_stalled() {
        let (manager, base) = manager("artifact-stalled");
        let manager = manager.with_idle_timeout(Duration::from_millis(50));

        let (mut sender, mut body) = tokio::io::duplex(64);
        sender.write_all(b"MZ").await.expect("failed to send partial body");
        let err = manager
            .stage(&mut body, Some(1000))
            .await
            .expect_err("an idle body must not wait forever");
        assert!(matches!(
            err.downcast_ref::<ControlError>(),
            Some(ControlError::UploadStalled { .. })
        ));

        assert!(!manager.exists());
        assert_eq!(leftover_uploads(&base), 0);
        drop(sender);

        let _ = fs::remove_dir_all(base);
    }

    #[tokio::test]
    async fn dropped_staged_upload_leaves_no_temp_file() {
        let (manager, base) = manager("artifact-staged-drop");
        let mut body: &[u8] = b"never installed";

        let staged = manager
            .stage(&mut body, None)
            .await
            .expect("staging should succeed");
        assert_eq!(leftover_uploads(&base), 1);
        drop(staged);

        assert_eq!(leftover_uploads(&base), 0);
        assert!(!manager.exists());

        let _ = fs::remove_dir_all(base);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let (manager, base) = manager("artifact-large");
        let big = vec![7_u8; 2048];

        let mut declared: &[u8] = &big;
        let err = manager
            .upload(&mut declared, Some(2048))
            .await
            .expect_err("declared oversize must fail");
        assert!(matches!(
            err.downcast_ref::<ControlError>(),
            Some(ControlError::UploadTooLarge { limit: 1024 })
        ));

        let mut streamed: &[u8] = &big;
        let err = manager
            .upload(&mut streamed, None)
            .await
            .expect_err("streamed oversize must fail");
        assert!(matches!(
            err.downcast_ref::<ControlError>(),
            Some(ControlError::UploadTooLarge { .. })
        ));
        assert!(!manager.exists());
        assert_eq!(leftover_uploads(&base), 0);

        let _ = fs::remove_dir_all(base);
    }

    #[tokio::test]
    async fn rename_failure_leaves_existing_target_untouched() {
        let (_, base) = manager("artifact-rename");
        // A non-empty directory at the canonical path cannot be replaced.
        let target = base.join("RAY_DELTA_RADAR.exe");
        fs::create_dir_all(target.join("keep")).expect("failed to create blocker");
        let manager = ArtifactManager::new(&target, 1024);

        let mut body: &[u8] = b"payload";
        let err = manager
            .upload(&mut body, None)
            .await
            .expect_err("rename over a directory must fail");
        assert!(matches!(
            err.downcast_ref::<ControlError>(),
            Some(ControlError::RenameFailure { .. })
        ));
        assert!(target.join("keep").exists());
        assert_eq!(leftover_uploads(&base), 0);

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn remove_missing_artifact_is_not_found() {
        let (manager, base) = manager("artifact-remove");
        let err = manager.remove().expect_err("nothing to remove");
        assert!(matches!(
            err.downcast_ref::<ControlError>(),
            Some(ControlError::ArtifactNotFound(_))
        ));

        fs::write(manager.path(), b"x").expect("failed to seed artifact");
        manager.remove().expect("remove should succeed");
        assert!(!manager.exists());
        assert!(!manager.info().exists);

        let _ = fs::remove_dir_all(base);
    }
}
