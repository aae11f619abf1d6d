//! State store trait definition.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::DeploymentState;
use crate::error::Result;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<DeploymentState>>;

    /// Saves the state, replacing what was there.
    async fn save(&self, state: &DeploymentState) -> Result<()>;

    /// Deletes the state.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the cross-process lock.
    ///
    /// Fails with `StateError::LockedByOther` while another holder's lock
    /// has not expired.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Extends the expiry of the lock `lock_id` owns.
    ///
    /// Fails with `StateError::LockedByOther` if the lock has passed to
    /// another holder, or `StateError::LockFailed` if it is gone.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock regardless of who holds it.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Describes where state is kept, for display.
    fn location(&self) -> String;
}
