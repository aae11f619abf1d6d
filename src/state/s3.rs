//! S3-based state storage backend.
//!
//! State and lock live under `s3://{bucket}/{prefix}{project}-{environment}/`.
//! Plain S3 puts have no compare-and-swap, so the lock object is advisory.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info, warn};

use crate::error::{HalyardError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, renew};
use super::store::StateStore;
use super::types::{DeploymentState, STATE_VERSION};

/// State object name.
const STATE_KEY: &str = "state.json";

/// Lock object name.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

impl S3StateStore {
    /// Creates a new S3 state store using the default AWS credential chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(
        bucket: &str,
        prefix: Option<&str>,
        region: Option<&str>,
        workspace: &str,
    ) -> Result<Self> {
        let config = match region {
            Some(region) => {
                aws_config::from_env()
                    .region(aws_config::Region::new(region.to_string()))
                    .load()
                    .await
            }
            None => aws_config::load_from_env().await,
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix, workspace))
    }

    /// Creates a store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>, workspace: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: build_prefix(prefix, workspace),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    HalyardError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    HalyardError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(HalyardError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn put_object(&self, key: &str, content: String) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(content.into_bytes()))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| HalyardError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| HalyardError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };

        let lock_info = serde_json::from_str(&content).map_err(|e| {
            HalyardError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })?;
        Ok(Some(lock_info))
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<DeploymentState>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let state: DeploymentState = serde_json::from_str(&json).map_err(|e| {
            HalyardError::State(StateError::Corrupted {
                message: format!("Failed to parse state: {e}"),
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
        let key = self.key(STATE_KEY);
        debug!("Saving state serial {} to s3://{}/{key}", state.serial, self.bucket);

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            HalyardError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        self.put_object(&key, content).await
    }

    async fn delete(&self) -> Result<()> {
        let key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
    }

    async fn exists(&self) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(STATE_KEY))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(HalyardError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock().await? {
            if !existing.is_expired() {
                return Err(HalyardError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            warn!("Taking over expired lock held by {}", existing.holder);
        }

        let lock_info = LockInfo::new(holder, operation);
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            HalyardError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        self.put_object(&self.key(LOCK_KEY), content).await?;

        // Read back to detect a concurrent writer that won the race.
        match self.read_lock().await? {
            Some(current) if current.lock_id == lock_info.lock_id => {}
            Some(current) => {
                return Err(HalyardError::State(StateError::LockedByOther {
                    holder: current.holder,
                    since: current.acquired_at.to_rfc3339(),
                }));
            }
            None => {
                return Err(HalyardError::State(StateError::LockFailed {
                    message: String::from("Lock object disappeared after write"),
                }));
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock_info)
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let lock_info = renew(self.read_lock().await?, lock_id)?;
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            HalyardError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;
        self.put_object(&self.key(LOCK_KEY), content).await?;
        debug!("Renewed state lock {lock_id} until {}", lock_info.expires_at);
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
                debug!("Released state lock: {lock_id}");
            } else {
                warn!("Not releasing lock {}: now held by {}", lock_id, existing.holder);
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key(STATE_KEY))
    }
}

/// Joins the configured prefix and the workspace name into a key prefix.
fn build_prefix(prefix: Option<&str>, workspace: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(p) = prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        parts.push(p);
    }
    parts.push(workspace);
    format!("{}/", parts.join("/"))
}
