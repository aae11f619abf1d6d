//! Persistent state.
//!
//! State records every resource the engine created, with the identifiers
//! and attributes the provider assigned, so later runs can diff against it.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LOCK_RENEW_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    ArtifactState, DeploymentHistoryEntry, DeploymentOperation, DeploymentState, OutputValue,
    ResourceState, ResourceStatus, STATE_VERSION,
};

use std::path::Path;
use std::sync::Arc;

use crate::config::{StateBackend, WorkspaceConfig};
use crate::error::{ConfigError, HalyardError, Result};

/// Builds the state store selected by the workspace configuration.
///
/// Relative local paths are resolved against `workspace_dir`.
///
/// # Errors
///
/// Returns an error if the S3 backend has no bucket or cannot be set up.
pub async fn from_config(
    config: &WorkspaceConfig,
    workspace_dir: &Path,
) -> Result<Arc<dyn StateStore>> {
    match config.state.backend {
        StateBackend::Local => {
            let dir = config
                .state
                .path
                .as_deref()
                .map_or_else(|| workspace_dir.join(STATE_DIR), |p| workspace_dir.join(p));
            Ok(Arc::new(LocalStateStore::with_base_dir(dir)))
        }
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                HalyardError::Config(ConfigError::validation(
                    "S3 bucket name is required when using S3 backend",
                    "state.bucket",
                ))
            })?;
            let store = S3StateStore::new(
                bucket,
                config.state.prefix.as_deref(),
                config.state.region.as_deref(),
                &config.qualified_name(),
            )
            .await?;
            Ok(Arc::new(store))
        }
    }
}
