//! Local file-based state storage backend.
//!
//! State is a pretty-printed JSON file. Writes go to a temporary file that
//! is synced and renamed over the old one, so a crash mid-write leaves the
//! previous state intact.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{HalyardError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, renew};
use super::store::StateStore;
use super::types::{DeploymentState, STATE_VERSION};

/// Default state directory name.
pub const STATE_DIR: &str = ".halyard";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a local state store in the given directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Returns the state file path.
    #[must_use]
    pub const fn state_path(&self) -> &PathBuf {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                HalyardError::State(StateError::local(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            HalyardError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            HalyardError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file, failing if another process created it first.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            HalyardError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
            .map_err(|e| {
                HalyardError::State(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                })
            })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            HalyardError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;

        file.sync_all().await.map_err(|e| {
            HalyardError::State(StateError::LockFailed {
                message: format!("Failed to sync lock file: {e}"),
            })
        })?;

        Ok(())
    }

    /// Replaces the lock file contents in one rename.
    async fn rewrite_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            HalyardError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let temp_path = self.lock_path.with_extension("lock.tmp");
        fs::write(&temp_path, content).await.map_err(|e| {
            HalyardError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;
        fs::rename(&temp_path, &self.lock_path).await.map_err(|e| {
            HalyardError::State(StateError::LockFailed {
                message: format!("Failed to replace lock file: {e}"),
            })
        })?;

        Ok(())
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                HalyardError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<DeploymentState>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            HalyardError::State(StateError::local(format!("Failed to read state file: {e}")))
        })?;

        let state: DeploymentState = serde_json::from_str(&content).map_err(|e| {
            HalyardError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        if state.version != STATE_VERSION {
            return Err(HalyardError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }));
        }

        Ok(Some(state))
    }

    async fn save(&self, state: &DeploymentState) -> Result<()> {
        self.ensure_dir().await?;

        debug!(
            "Saving state serial {} to: {}",
            state.serial,
            self.state_path.display()
        );

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            HalyardError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        let temp_path = self.state_path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            HalyardError::State(StateError::local(format!(
                "Failed to create temp state file: {e}"
            )))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            HalyardError::State(StateError::local(format!("Failed to write state file: {e}")))
        })?;

        file.sync_all().await.map_err(|e| {
            HalyardError::State(StateError::local(format!("Failed to sync state file: {e}")))
        })?;

        fs::rename(&temp_path, &self.state_path).await.map_err(|e| {
            HalyardError::State(StateError::local(format!(
                "Failed to rename state file: {e}"
            )))
        })?;

        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                HalyardError::State(StateError::local(format!(
                    "Failed to delete state file: {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(HalyardError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            warn!(
                "Taking over expired lock held by {} since {}",
                existing.holder, existing.acquired_at
            );
            self.delete_lock_file().await?;
        }

        let lock_info = LockInfo::new(holder, operation);
        self.create_lock_file(&lock_info).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let lock_info = renew(self.read_lock_file().await?, lock_id)?;
        self.rewrite_lock_file(&lock_info).await?;
        debug!("Renewed state lock {lock_id} until {}", lock_info.expires_at);
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                debug!("Released state lock: {lock_id}");
            } else {
                warn!(
                    "Not releasing lock {}: now held by {}",
                    lock_id, existing.holder
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn location(&self) -> String {
        self.state_path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceId;
    use crate::state::ResourceState;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut state = DeploymentState::new("devbox", "dev");
        state.set_resource(ResourceState::new(
            &ResourceId::new("network", "main"),
            "net-1",
            BTreeMap::new(),
            "hash",
            BTreeMap::new(),
            Vec::new(),
        ));
        state.bump_serial();
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded, state);
        assert_eq!(loaded.serial, 1);
        assert!(!store.state_path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        assert!(store.load().await.expect("Load should not fail").is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (store, _temp) = create_test_store();
        let mut state = DeploymentState::new("devbox", "dev");
        state.version = String::from("0.1");
        store.save(&state).await.expect("save");

        let err = store.load().await.expect_err("old version");
        assert!(matches!(err, HalyardError::State(StateError::VersionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire lock");

        let info = store.get_lock_info().await.expect("lock info").expect("locked");
        assert_eq!(info.operation, "apply");

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(store.get_lock_info().await.expect("lock info").is_none());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2", "destroy").await;
        assert!(matches!(
            result,
            Err(HalyardError::State(StateError::LockedByOther { ref holder, .. })) if holder == "holder-1"
        ));

        store.force_unlock().await.expect("force unlock");
        assert!(store.acquire_lock("holder-2", "destroy").await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_keeps_lock_from_expiring() {
        let (store, _temp) = create_test_store();
        let mut lock = store.acquire_lock("holder-1", "apply").await.expect("lock");

        lock.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        store.rewrite_lock_file(&lock).await.expect("backdate");

        let renewed = store.refresh_lock(&lock.lock_id).await.expect("refresh");
        assert_eq!(renewed.lock_id, lock.lock_id);
        assert!(!renewed.is_expired());
        assert!(matches!(
            store.acquire_lock("holder-2", "apply").await,
            Err(HalyardError::State(StateError::LockedByOther { .. }))
        ));

        store.force_unlock().await.expect("force unlock");
        store.acquire_lock("holder-2", "apply").await.expect("second holder");
        assert!(matches!(
            store.refresh_lock(&lock.lock_id).await,
            Err(HalyardError::State(StateError::LockedByOther { ref holder, .. })) if holder == "holder-2"
        ));
    }
}
