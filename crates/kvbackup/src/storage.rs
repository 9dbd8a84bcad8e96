//! Backup destination access and the "storage in use" checks.
//!
//! The coordinator only needs a handful of whole-object operations on the
//! destination: the lock marker, the manifest presence check, checkpoint
//! metadata and a listing to detect leftover data files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::checkpoint::{load_metadata, CheckpointMetadata};

/// Marker written once a job claims the destination.
pub const LOCK_FILE: &str = "backup.lock";
/// Final manifest written by the metadata writer when a job succeeds.
pub const META_FILE: &str = "backupmeta";
/// Directory holding checkpoint state.
pub const CHECKPOINT_DIR: &str = "checkpoints/backup";
/// Checkpoint metadata object.
pub const CHECKPOINT_META_FILE: &str = "checkpoints/backup/checkpoint.meta";
/// Directory holding the checkpoint data log.
pub const CHECKPOINT_DATA_DIR: &str = "checkpoints/backup/data";

const LOCK_FILE_CONTENT: &str =
    "DO NOT DELETE\nThis file exists to remind other backup jobs won't use this path";

/// Whole-object access to the backup destination.
pub trait BackupStorage: Send + Sync + 'static {
    /// Human readable location, used in logs and errors.
    fn uri(&self) -> String;

    fn file_exists(&self, name: &str) -> anyhow::Result<bool>;

    fn read_file(&self, name: &str) -> anyhow::Result<Vec<u8>>;

    /// Replace `name` atomically with `data`.
    fn write_file(&self, name: &str, data: &[u8]) -> anyhow::Result<()>;

    /// Relative names of every object under the destination.
    fn list_files(&self) -> anyhow::Result<Vec<String>>;

    /// Local filesystem path for `name` when the destination is a local
    /// directory; file-backed components use it to open their files.
    fn local_path(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}

/// Destination rooted at a local directory.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BackupStorage for LocalStorage {
    fn uri(&self) -> String {
        format!("local://{}", self.root.display())
    }

    fn file_exists(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.root.join(name).is_file())
    }

    fn read_file(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(name);
        fs::read(&path).with_context(|| format!("read {}", path.display()))
    }

    fn write_file(&self, name: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.root.join(name);
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("invalid storage path: {}", path.display()))?;
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, data).with_context(|| format!("write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path).with_context(|| {
            format!("replace {} -> {}", tmp_path.display(), path.display())
        })?;
        Ok(())
    }

    fn list_files(&self) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn local_path(&self, name: &str) -> Option<PathBuf> {
        Some(self.root.join(name))
    }
}

/// Make sure the destination can be used by a new or resumed job.
///
/// Returns the checkpoint metadata of a previous run when the destination
/// holds one (resume mode). Fails when a finished backup already lives there,
/// or when another job's lock marker sits next to exported data files.
pub fn check_storage_not_in_use(
    storage: &dyn BackupStorage,
) -> anyhow::Result<Option<CheckpointMetadata>> {
    if storage.file_exists(META_FILE)? {
        anyhow::bail!(
            "backup meta file exists in {}, there may be some backup files in the path already, \
             please specify a correct backup directory",
            storage.uri()
        );
    }
    if let Some(meta) = load_metadata(storage)? {
        tracing::info!(
            storage = %storage.uri(),
            backup_ts = meta.backup_ts,
            "found checkpoint metadata, resuming backup"
        );
        return Ok(Some(meta));
    }
    check_storage_is_locked(storage)?;
    Ok(None)
}

/// Fail when the lock marker exists alongside `.sst` files.
pub fn check_storage_is_locked(storage: &dyn BackupStorage) -> anyhow::Result<()> {
    if !storage.file_exists(LOCK_FILE)? {
        return Ok(());
    }
    let files = storage.list_files()?;
    if let Some(sst) = files.iter().find(|name| name.ends_with(".sst")) {
        anyhow::bail!(
            "backup lock file and sst file ({sst}) exist in {}, there are some backup files in \
             the path already, but no checkpoint metadata; please specify a correct backup \
             directory",
            storage.uri()
        );
    }
    Ok(())
}

/// Claim the destination.
pub fn write_lock_file(storage: &dyn BackupStorage) -> anyhow::Result<()> {
    storage.write_file(LOCK_FILE, LOCK_FILE_CONTENT.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::save_metadata;

    #[test]
    fn fresh_directory_is_usable() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(check_storage_not_in_use(&storage).unwrap().is_none());
        write_lock_file(&storage).unwrap();
        // The lock alone does not block a new job.
        assert!(check_storage_not_in_use(&storage).unwrap().is_none());
    }

    #[test]
    fn lock_with_sst_files_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        write_lock_file(&storage).unwrap();
        storage.write_file("1/region_7.sst", b"data").unwrap();
        let err = check_storage_not_in_use(&storage).unwrap_err();
        assert!(err.to_string().contains("1/region_7.sst"), "{err:#}");
    }

    #[test]
    fn existing_manifest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.write_file(META_FILE, b"{}").unwrap();
        assert!(check_storage_not_in_use(&storage).is_err());
    }

    #[test]
    fn checkpoint_metadata_enables_resume() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        write_lock_file(&storage).unwrap();
        storage.write_file("1/region_7.sst", b"data").unwrap();
        let meta = CheckpointMetadata {
            gc_service_id: "svc".to_string(),
            config_hash: vec![9],
            backup_ts: 42,
        };
        save_metadata(&storage, &meta).unwrap();
        assert_eq!(check_storage_not_in_use(&storage).unwrap(), Some(meta));
    }

    #[test]
    fn list_files_is_recursive_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.write_file("b/two", b"2").unwrap();
        storage.write_file("a", b"1").unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["a", "b/two"]);
    }
}
