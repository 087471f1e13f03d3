use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::CheckpointError;

const BACKUP_SUFFIX: &str = ".backup";

/// Writes run state to disk. A reader of the destination sees either the
/// previous file or the complete new one, never a partial write.
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckpointStore;

impl CheckpointStore {
    pub fn new() -> Self {
        CheckpointStore
    }

    /// Serialize `items` to `dest` via a sibling temp file and rename.
    pub fn flush<T: Serialize>(&self, items: &[T], dest: &Path) -> Result<(), CheckpointError> {
        let json = serde_json::to_string_pretty(items)?;
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = sibling(dest, &format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        if let Err(source) = fs::write(&tmp, json) {
            let _ = fs::remove_file(&tmp);
            return Err(CheckpointError::Io { path: tmp, source });
        }
        if let Err(source) = fs::rename(&tmp, dest) {
            let _ = fs::remove_file(&tmp);
            return Err(CheckpointError::Io {
                path: dest.to_path_buf(),
                source,
            });
        }
        debug!("Flushed {} items to {}", items.len(), dest.display());
        Ok(())
    }

    /// Like [`flush`](Self::flush), but an existing file at `dest` is first
    /// copied to `<dest>.backup`.
    pub fn finalize<T: Serialize>(&self, items: &[T], dest: &Path) -> Result<(), CheckpointError> {
        if dest.exists() {
            let backup = backup_path(dest);
            fs::copy(dest, &backup).map_err(|source| CheckpointError::Io {
                path: backup.clone(),
                source,
            })?;
            info!("Previous {} kept as {}", dest.display(), backup.display());
        }
        self.flush(items, dest)
    }
}

pub fn backup_path(dest: &Path) -> PathBuf {
    sibling(dest, BACKUP_SUFFIX)
}

fn sibling(dest: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = dest.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch_dir;

    fn read_ids(path: &Path) -> Vec<String> {
        let v: Vec<serde_json::Value> =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        v.iter().map(|x| x["id"].as_str().unwrap().to_string()).collect()
    }

    #[test]
    fn flush_overwrites_and_leaves_no_temp_file() {
        let dir = scratch_dir("ckpt-flush");
        let dest = dir.join("nested").join("progress.json");
        let store = CheckpointStore::new();

        store.flush(&[serde_json::json!({"id": "a"})], &dest).unwrap();
        store
            .flush(&[serde_json::json!({"id": "a"}), serde_json::json!({"id": "b"})], &dest)
            .unwrap();

        assert_eq!(read_ids(&dest), vec!["a", "b"]);
        let names: Vec<_> = fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["progress.json"]);
    }

    #[test]
    fn flush_is_pretty_and_keeps_non_ascii() {
        let dir = scratch_dir("ckpt-pretty");
        let dest = dir.join("out.json");
        CheckpointStore::new()
            .flush(&[serde_json::json!({"id": "a", "title": "旅行笔记"})], &dest)
            .unwrap();
        let raw = fs::read_to_string(&dest).unwrap();
        assert!(raw.contains("旅行笔记"));
        assert!(raw.contains("\n  {"));
    }

    #[test]
    fn finalize_backs_up_previous_snapshot() {
        let dir = scratch_dir("ckpt-final");
        let dest = dir.join("notes.json");
        fs::write(&dest, r#"[{"id":"old"}]"#).unwrap();

        CheckpointStore::new()
            .finalize(&[serde_json::json!({"id": "new"})], &dest)
            .unwrap();

        assert_eq!(read_ids(&dest), vec!["new"]);
        let backup = backup_path(&dest);
        assert_eq!(backup, dir.join("notes.json.backup"));
        assert_eq!(fs::read_to_string(backup).unwrap(), r#"[{"id":"old"}]"#);
    }

    #[test]
    fn finalize_without_previous_file_writes_no_backup() {
        let dir = scratch_dir("ckpt-fresh");
        let dest = dir.join("notes.json");
        CheckpointStore::new()
            .finalize(&[serde_json::json!({"id": "a"})], &dest)
            .unwrap();
        assert!(dest.exists());
        assert!(!backup_path(&dest).exists());
    }
}
