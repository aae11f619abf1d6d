//! Simulated in-process provider.
//!
//! Assigns ids and public addresses the way a cloud would and keeps
//! resources in memory. Faults can be injected per logical name to exercise
//! retry and fail-fast behavior.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::Provider;
use super::types::{ProviderResource, ResourceRequest};
use crate::error::ProviderError;

/// A provider call, as recorded by [`InMemoryProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// `create`, `read`, `update` or `delete`.
    pub operation: &'static str,
    /// Resource kind.
    pub kind: String,
    /// Logical name for create and update, provider id otherwise.
    pub target: String,
}

#[derive(Debug, Clone)]
struct StoredResource {
    kind: String,
    name: String,
    attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
enum Fault {
    Transient(u32),
    Fatal(String),
}

#[derive(Debug, Default)]
struct Inner {
    sequence: u64,
    addresses: u32,
    resources: BTreeMap<String, StoredResource>,
    faults: HashMap<String, Fault>,
    calls: Vec<ProviderCall>,
}

/// Provider that simulates a cloud in memory.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    inner: Mutex<Inner>,
}

impl InMemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `times` create/update/delete calls for `name` fail
    /// with a retryable error.
    pub fn inject_transient(&self, name: &str, times: u32) {
        self.lock().faults.insert(name.to_string(), Fault::Transient(times));
    }

    /// Makes every create/update/delete call for `name` fail permanently.
    pub fn inject_fatal(&self, name: &str, message: &str) {
        self.lock()
            .faults
            .insert(name.to_string(), Fault::Fatal(message.to_string()));
    }

    /// Removes any injected fault for `name`.
    pub fn clear_fault(&self, name: &str) {
        self.lock().faults.remove(name);
    }

    /// Removes a resource behind the engine's back, as if deleted out of band.
    pub fn forget(&self, id: &str) {
        self.lock().resources.remove(id);
    }

    /// Changes an attribute behind the engine's back.
    pub fn tamper(&self, id: &str, attribute: &str, value: Value) {
        if let Some(resource) = self.lock().resources.get_mut(id) {
            resource.attributes.insert(attribute.to_string(), value);
        }
    }

    /// Returns the recorded calls in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Returns the number of resources that currently exist.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Returns the id of the live resource with the given kind and name.
    #[must_use]
    pub fn find(&self, kind: &str, name: &str) -> Option<String> {
        self.lock()
            .resources
            .iter()
            .find(|(_, r)| r.kind == kind && r.name == name)
            .map(|(id, _)| id.clone())
    }
}

impl Inner {
    fn record(&mut self, operation: &'static str, kind: &str, target: &str) {
        self.calls.push(ProviderCall {
            operation,
            kind: kind.to_string(),
            target: target.to_string(),
        });
    }

    fn check_fault(&mut self, name: &str, operation: &str) -> Result<(), ProviderError> {
        let Some(fault) = self.faults.get_mut(name) else {
            return Ok(());
        };

        match fault {
            Fault::Transient(remaining) if *remaining > 0 => {
                *remaining -= 1;
                debug!("Injected transient failure for {} ({})", name, operation);
                Err(ProviderError::Unavailable {
                    status: 503,
                    message: format!("simulated outage during {operation}"),
                })
            }
            Fault::Transient(_) => Ok(()),
            Fault::Fatal(message) => Err(ProviderError::api_error(400, message.clone())),
        }
    }

    fn computed(&mut self, kind: &str, id: &str) -> BTreeMap<String, Value> {
        let mut computed = BTreeMap::new();
        match kind {
            "instance" => {
                self.addresses += 1;
                let n = self.addresses;
                computed.insert(
                    String::from("public_ip"),
                    Value::String(format!("203.0.113.{}", n % 254 + 1)),
                );
                computed.insert(
                    String::from("private_ip"),
                    Value::String(format!("10.0.1.{}", n % 250 + 4)),
                );
            }
            "key_pair" => {
                let fingerprint = format!("{:0>32}", id.replace('-', ""));
                computed.insert(String::from("fingerprint"), Value::String(fingerprint));
            }
            _ => {}
        }
        computed
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, request: &ResourceRequest) -> Result<ProviderResource, ProviderError> {
        let mut inner = self.lock();
        inner.record("create", &request.kind, &request.name);
        inner.check_fault(&request.name, "create")?;

        inner.sequence += 1;
        let id = format!("{}-{:08x}", request.kind.replace('_', "-"), inner.sequence);

        let mut attributes = request.attributes.clone();
        attributes.extend(inner.computed(&request.kind, &id));

        inner.resources.insert(
            id.clone(),
            StoredResource {
                kind: request.kind.clone(),
                name: request.name.clone(),
                attributes: attributes.clone(),
            },
        );
        debug!("Simulated create of {}.{} as {}", request.kind, request.name, id);

        Ok(ProviderResource { id, attributes })
    }

    async fn read(&self, kind: &str, id: &str) -> Result<ProviderResource, ProviderError> {
        let mut inner = self.lock();
        inner.record("read", kind, id);

        match inner.resources.get(id) {
            Some(resource) if resource.kind == kind => Ok(ProviderResource {
                id: id.to_string(),
                attributes: resource.attributes.clone(),
            }),
            _ => Err(ProviderError::NotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn update(
        &self,
        id: &str,
        request: &ResourceRequest,
    ) -> Result<ProviderResource, ProviderError> {
        let mut inner = self.lock();
        inner.record("update", &request.kind, &request.name);
        inner.check_fault(&request.name, "update")?;

        let Some(resource) = inner.resources.get_mut(id) else {
            return Err(ProviderError::NotFound {
                kind: request.kind.clone(),
                id: id.to_string(),
            });
        };

        for (key, value) in &request.attributes {
            resource.attributes.insert(key.clone(), value.clone());
        }

        Ok(ProviderResource {
            id: id.to_string(),
            attributes: resource.attributes.clone(),
        })
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        inner.record("delete", kind, id);

        let name = inner.resources.get(id).map(|r| r.name.clone());
        if let Some(name) = name {
            inner.check_fault(&name, "delete")?;
        }

        match inner.resources.remove(id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(kind: &str, name: &str) -> ResourceRequest {
        ResourceRequest {
            kind: kind.to_string(),
            name: name.to_string(),
            attributes: BTreeMap::from([(String::from("image"), json!("ubuntu-24.04"))]),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_addresses() {
        let provider = InMemoryProvider::new();
        let created = provider.create(&request("instance", "dev")).await.expect("created");

        assert!(created.id.starts_with("instance-"));
        assert_eq!(created.attributes["public_ip"], json!("203.0.113.2"));
        assert_eq!(created.attributes["image"], json!("ubuntu-24.04"));

        let read = provider.read("instance", &created.id).await.expect("exists");
        assert_eq!(read, created);
    }

    #[tokio::test]
    async fn test_transient_fault_clears_after_count() {
        let provider = InMemoryProvider::new();
        provider.inject_transient("dev", 2);

        for _ in 0..2 {
            let err = provider.create(&request("instance", "dev")).await.expect_err("injected");
            assert!(err.is_transient());
        }
        assert!(provider.create(&request("instance", "dev")).await.is_ok());
        assert_eq!(provider.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_fatal_fault_and_missing_delete() {
        let provider = InMemoryProvider::new();
        provider.inject_fatal("bad", "quota exceeded");

        let err = provider.create(&request("instance", "bad")).await.expect_err("fatal");
        assert!(!err.is_transient());
        provider.clear_fault("bad");
        assert!(provider.create(&request("instance", "bad")).await.is_ok());

        let missing = provider.delete("instance", "instance-ffffffff").await.expect_err("missing");
        assert!(matches!(missing, ProviderError::NotFound { .. }));
    }
}
