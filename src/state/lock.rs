//! Cross-process state locking.
//!
//! Apply and destroy hold the lock for their whole run and renew it while
//! they work. A lock that is not released (crash, kill -9) expires on its
//! own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StateError;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// How often a held lock is renewed, in seconds.
pub const LOCK_RENEW_SECS: u64 = 60;

/// Information about a state lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// What the holder is doing (`apply`, `destroy`, `manual`).
    #[serde(default)]
    pub operation: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Pushes the expiry out by a full period from now.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Returns `current` with a renewed expiry if `lock_id` still owns it.
pub(crate) fn renew(current: Option<LockInfo>, lock_id: &str) -> Result<LockInfo, StateError> {
    match current {
        Some(mut lock) if lock.lock_id == lock_id => {
            lock.refresh();
            Ok(lock)
        }
        Some(other) => Err(StateError::LockedByOther {
            holder: other.holder,
            since: other.acquired_at.to_rfc3339(),
        }),
        None => Err(StateError::LockFailed {
            message: format!("Lock {lock_id} no longer exists"),
        }),
    }
}

/// Generates a unique holder identifier: `hostname-pid-xxxxxxxx`.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
    let pid = std::process::id();
    let suffix = &Uuid::new_v4().simple().to_string()[..8];

    format!("{hostname}-{pid}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_live() {
        let lock = LockInfo::new("ci-runner", "apply");
        assert_eq!(lock.holder, "ci-runner");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_expired_lock() {
        let mut lock = LockInfo::new("ci-runner", "apply");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);

        lock.refresh();
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
    }

    #[test]
    fn test_renew_requires_ownership() {
        let mut lock = LockInfo::new("ci-runner", "apply");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);

        let renewed = renew(Some(lock.clone()), &lock.lock_id).expect("owned");
        assert!(!renewed.is_expired());
        assert_eq!(renewed.acquired_at, lock.acquired_at);

        assert!(matches!(
            renew(Some(lock), "someone-elses-id"),
            Err(StateError::LockedByOther { .. })
        ));
        assert!(matches!(renew(None, "gone"), Err(StateError::LockFailed { .. })));
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }
}
