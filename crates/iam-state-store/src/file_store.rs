//! JSON file backend
//!
//! The whole record set lives in one JSON document, together with the lock
//! leases of every engine sharing the file. Every mutation happens under a
//! `<path>.lock` guard file created with `create_new`, so engines in separate
//! processes see each other's leases and never interleave a
//! read-modify-write. The document is rewritten through a temporary file and
//! an atomic rename; on unix it is created with mode 0600 since state may
//! hold sensitive attributes.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use iam_core::{LockToken, StateRecord};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StateStoreError};
use crate::state_store::{conflict, SharedLease, StateBackend};

const FORMAT_VERSION: u32 = 1;
const GUARD_ATTEMPTS: u32 = 50;
const GUARD_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    format_version: u32,
    records: BTreeMap<String, StateRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    leases: BTreeMap<String, SharedLease>,
}

/// Removes the guard file when dropped
struct GuardFile {
    path: PathBuf,
}

impl Drop for GuardFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

pub struct FileBackend {
    path: PathBuf,
    lock_path: PathBuf,
    // Serializes read-modify-write cycles within this process
    io_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        info!("Using state file {}", path.display());
        Self {
            path,
            lock_path,
            io_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    /// Take the cross-process guard, retrying while another process holds it
    async fn guard(&self) -> Result<GuardFile> {
        self.ensure_parent().await?;
        for _ in 0..GUARD_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
                .await
            {
                Ok(_) => {
                    return Ok(GuardFile {
                        path: self.lock_path.clone(),
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tokio::time::sleep(GUARD_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateStoreError::Io(std::io::Error::new(
            ErrorKind::TimedOut,
            format!("timed out waiting for {}", self.lock_path.display()),
        )))
    }

    async fn load(&self) -> Result<StateFile> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StateFile::default()),
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(StateFile::default());
        }

        let file: StateFile = serde_json::from_str(&content)?;
        if file.format_version > FORMAT_VERSION {
            return Err(StateStoreError::Invalid(format!(
                "state file format {} is newer than supported {}",
                file.format_version, FORMAT_VERSION
            )));
        }
        Ok(file)
    }

    async fn save(&self, mut file: StateFile) -> Result<()> {
        file.format_version = FORMAT_VERSION;
        self.ensure_parent().await?;

        let content = serde_json::to_vec_pretty(&file)?;
        let tmp_path = self.path.with_extension("tmp");
        // mode only applies on creation
        let _ = fs::remove_file(&tmp_path).await;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        {
            use tokio::io::AsyncWriteExt;
            let mut tmp = options.open(&tmp_path).await?;
            tmp.write_all(&content).await?;
            tmp.flush().await?;
            tmp.sync_all().await?;
        }

        fs::rename(&tmp_path, &self.path).await?;
        debug!("Saved {} record(s) to {}", file.records.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl StateBackend for FileBackend {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<StateRecord>> {
        let _io = self.io_lock.lock().await;
        Ok(self.load().await?.records.remove(key))
    }

    async fn list(&self) -> Result<Vec<StateRecord>> {
        let _io = self.io_lock.lock().await;
        Ok(self.load().await?.records.into_values().collect())
    }

    async fn compare_and_put(&self, record: &StateRecord, expected: u64) -> Result<()> {
        let _io = self.io_lock.lock().await;
        let _guard = self.guard().await?;
        let mut file = self.load().await?;
        let actual = file
            .records
            .get(&record.instance_key)
            .map(|r| r.version)
            .unwrap_or(0);
        if actual != expected {
            return Err(conflict(&record.instance_key, expected, actual));
        }
        file.records
            .insert(record.instance_key.clone(), record.clone());
        self.save(file).await
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<()> {
        let _io = self.io_lock.lock().await;
        let _guard = self.guard().await?;
        let mut file = self.load().await?;
        let actual = file.records.get(key).map(|r| r.version).unwrap_or(0);
        if actual != expected {
            return Err(conflict(key, expected, actual));
        }
        file.records.remove(key);
        self.save(file).await
    }

    async fn claim_lease(&self, key: &str, lease: &SharedLease) -> Result<Option<SharedLease>> {
        let _io = self.io_lock.lock().await;
        let _guard = self.guard().await?;
        let mut file = self.load().await?;
        if let Some(existing) = file.leases.get(key) {
            if existing.token != lease.token && existing.is_live(Utc::now()) {
                return Ok(Some(existing.clone()));
            }
        }
        file.leases.insert(key.to_string(), lease.clone());
        self.save(file).await?;
        Ok(None)
    }

    async fn release_lease(&self, key: &str, token: &LockToken) -> Result<()> {
        let _io = self.io_lock.lock().await;
        let _guard = self.guard().await?;
        let mut file = self.load().await?;
        if file.leases.get(key).map(|l| &l.token == token).unwrap_or(false) {
            file.leases.remove(key);
            self.save(file).await?;
        }
        Ok(())
    }

    async fn current_lease(&self, key: &str) -> Result<Option<SharedLease>> {
        let _io = self.io_lock.lock().await;
        Ok(self.load().await?.leases.remove(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iam_core::{AttributeValue, Attributes, ResourceTypeId};

    fn record(key: &str, version: u64) -> StateRecord {
        let mut attrs = Attributes::new();
        attrs.insert("name".to_string(), AttributeValue::string(key));
        StateRecord {
            version,
            ..StateRecord::new(key, ResourceTypeId::new("iam", "user"), attrs)
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("state.json"));
        assert!(backend.list().await.unwrap().is_empty());
        assert!(backend.get("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let backend = FileBackend::new(&path);
        backend.compare_and_put(&record("alice", 1), 0).await.unwrap();
        backend.compare_and_put(&record("bob", 1), 0).await.unwrap();
        backend.compare_and_delete("bob", 1).await.unwrap();

        let reopened = FileBackend::new(&path);
        let records = reopened.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].instance_key, "alice");
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_stale_expected_version_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("state.json"));
        backend.compare_and_put(&record("alice", 1), 0).await.unwrap();
        let err = backend
            .compare_and_put(&record("alice", 1), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::VersionConflict { actual: 1, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_state_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let backend = FileBackend::new(&path);
        backend.compare_and_put(&record("alice", 1), 0).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    fn lease(holder: &str, seconds: i64) -> SharedLease {
        SharedLease {
            holder: holder.to_string(),
            token: LockToken::generate(),
            expires_at: Utc::now() + chrono::Duration::seconds(seconds),
        }
    }

    #[tokio::test]
    async fn test_leases_are_shared_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let first = FileBackend::new(&path);
        let second = FileBackend::new(&path);

        let held = lease("engine-1", 30);
        assert!(first.claim_lease("admin", &held).await.unwrap().is_none());
        first.compare_and_put(&record("alice", 1), 0).await.unwrap();

        let other = lease("engine-2", 30);
        let current = second.claim_lease("admin", &other).await.unwrap().unwrap();
        assert_eq!(current.holder, "engine-1");
        assert_eq!(second.current_lease("admin").await.unwrap(), Some(held.clone()));

        // same token renews, a stale release is ignored
        assert!(first.claim_lease("admin", &held).await.unwrap().is_none());
        second.release_lease("admin", &other.token).await.unwrap();
        assert!(second.current_lease("admin").await.unwrap().is_some());

        first.release_lease("admin", &held.token).await.unwrap();
        assert!(second.claim_lease("admin", &other).await.unwrap().is_none());
        assert_eq!(second.list().await.unwrap().len(), 1);
        assert!(!path.with_extension("lock").exists());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("state.json"));
        backend.claim_lease("admin", &lease("engine-1", -1)).await.unwrap();
        assert!(backend
            .claim_lease("admin", &lease("engine-2", 30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_held_guard_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(path.with_extension("lock"), b"").unwrap();
        let backend = FileBackend::new(&path);
        let err = backend
            .compare_and_put(&record("alice", 1), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::Io(ref e) if e.kind() == ErrorKind::TimedOut));
    }
}
