use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Reads a JSON record. `Ok(None)` means there is nothing usable on disk: the
/// file is missing, blank, or was corrupted and has been quarantined.
pub fn load_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read record {}", path.display()))
        }
    };
    if content.trim().is_empty() {
        return Ok(None);
    }

    match serde_json::from_str::<T>(&content) {
        Ok(record) => Ok(Some(record)),
        Err(parse_err) => {
            quarantine(path, &parse_err.to_string());
            Ok(None)
        }
    }
}

/// Replaces the record atomically: readers see either the old or the new
/// content, never a partial write.
pub fn save_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let payload = serde_json::to_vec_pretty(record).context("failed to encode record")?;
    let staged = staging_path(path);
    fs::write(&staged, payload)
        .with_context(|| format!("failed to stage record {}", staged.display()))?;

    fs::rename(&staged, path).map_err(|err| {
        let _ = fs::remove_file(&staged);
        anyhow::Error::new(err).context(format!("failed to replace record {}", path.display()))
    })
}

/// Moves an unparseable record aside as `<stem>.corrupt-<secs>.json`.
fn quarantine(path: &Path, reason: &str) {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let aside = path.with_extension(format!("corrupt-{stamp}.json"));

    match fs::rename(path, &aside) {
        Ok(()) => warn!(
            "record {} is corrupted ({reason}); moved to {}",
            path.display(),
            aside.display()
        ),
        Err(err) => warn!(
            "record {} is corrupted ({reason}) and could not be moved aside: {err}",
            path.display()
        ),
    }
}

fn staging_path(path: &Path) -> PathBuf {
    path.with_extension(format!("tmp-{}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use serde::{Deserialize, Serialize};

    use super::{load_record, save_record, staging_path};
    use crate::config::tests::temp_dir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        value: u32,
    }

    fn record_in(prefix: &str) -> (PathBuf, PathBuf) {
        let base = temp_dir(prefix);
        fs::create_dir_all(&base).expect("failed to create base");
        (base.join("record.json"), base)
    }

    #[test]
    fn save_record_overwrites_existing_file() {
        let (path, base) = record_in("storage-overwrite");

        save_record(&path, &Sample { value: 7 }).expect("failed to save first record");
        save_record(&path, &Sample { value: 9 }).expect("failed to overwrite record");
        let loaded: Option<Sample> = load_record(&path).expect("failed to load record");

        assert_eq!(loaded, Some(Sample { value: 9 }));
        assert!(!staging_path(&path).exists(), "staged file should be renamed away");

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn load_missing_or_empty_record_is_none() {
        let (path, base) = record_in("storage-missing");
        let missing: Option<Sample> = load_record(&path).expect("missing record should load");
        assert!(missing.is_none());

        fs::write(&path, "   \n").expect("failed to write empty record");
        let empty: Option<Sample> = load_record(&path).expect("empty record should load");
        assert!(empty.is_none());

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn load_record_moves_corruption_aside() {
        let (path, base) = record_in("storage-corrupt");
        fs::write(&path, "{ not valid json ]").expect("failed to write corrupted record");

        let loaded: Option<Sample> =
            load_record(&path).expect("load_record should recover from corruption");
        assert!(loaded.is_none());
        assert!(!path.exists(), "corrupted file should have been moved");

        let quarantined = fs::read_dir(&base)
            .expect("failed to list base")
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("record.corrupt-")
            })
            .count();
        assert_eq!(quarantined, 1);

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn failed_replace_cleans_up_staged_file() {
        let (path, base) = record_in("storage-replace-fail");
        fs::create_dir_all(path.join("occupied")).expect("failed to create blocker");

        save_record(&path, &Sample { value: 1 }).expect_err("cannot rename over a directory");
        assert!(!staging_path(&path).exists());

        let _ = fs::remove_dir_all(base);
    }
}
