//! Provider capability interface and implementations.
//!
//! The engine only ever talks to a cloud through [`Provider`]: create, read,
//! update and delete, per resource kind. [`HttpProvider`] speaks a JSON REST
//! API; [`InMemoryProvider`] simulates one for tests and dry runs.

mod http;
mod memory;
mod schema;
mod types;

pub use http::HttpProvider;
pub use memory::{InMemoryProvider, ProviderCall};
pub use schema::{KindSchema, SchemaRegistry};
pub use types::{ProviderResource, ResourceRequest};

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{ProviderKind, WorkspaceConfig};
use crate::error::{ConfigError, HalyardError, ProviderError, Result};

/// Operations a provider supports.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Returns the attribute schemas the provider knows.
    ///
    /// # Errors
    ///
    /// Returns an error if the schemas cannot be fetched.
    async fn schemas(&self) -> std::result::Result<SchemaRegistry, ProviderError> {
        Ok(SchemaRegistry::builtin())
    }

    /// Creates a resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects or fails the call.
    async fn create(
        &self,
        request: &ResourceRequest,
    ) -> std::result::Result<ProviderResource, ProviderError>;

    /// Reads a resource by provider id.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::NotFound` if the resource no longer exists.
    async fn read(&self, kind: &str, id: &str)
    -> std::result::Result<ProviderResource, ProviderError>;

    /// Updates mutable attributes of a resource in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects or fails the call.
    async fn update(
        &self,
        id: &str,
        request: &ResourceRequest,
    ) -> std::result::Result<ProviderResource, ProviderError>;

    /// Deletes a resource.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::NotFound` if the resource does not exist.
    async fn delete(&self, kind: &str, id: &str) -> std::result::Result<(), ProviderError>;
}

/// Builds the provider selected by the workspace configuration.
///
/// # Errors
///
/// Returns a configuration error if the http provider has no endpoint or
/// its client cannot be built.
pub fn from_config(config: &WorkspaceConfig) -> Result<Arc<dyn Provider>> {
    match config.provider.kind {
        ProviderKind::Memory => Ok(Arc::new(InMemoryProvider::new())),
        ProviderKind::Http => {
            let endpoint = config.provider.endpoint.as_deref().ok_or_else(|| {
                HalyardError::Config(ConfigError::validation(
                    "An endpoint is required for the http provider",
                    "provider.endpoint",
                ))
            })?;
            let token = std::env::var(&config.provider.token_env).ok();
            let provider = HttpProvider::new(endpoint, token, config.provider.timeout_secs)?;
            Ok(Arc::new(provider))
        }
    }
}
