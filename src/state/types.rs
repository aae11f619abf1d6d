//! Persisted state types.
//!
//! State maps each resource identity to what the provider last reported
//! about it. It is written after every single action during apply, so the
//! file always describes resources that really exist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::graph::ResourceId;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete persisted state of a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentState {
    /// State format version.
    pub version: String,
    /// Identifier fixed when the state is first created.
    pub lineage: String,
    /// Incremented on every write.
    pub serial: u64,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied declarations.
    pub config_hash: String,
    /// Recorded resources.
    #[serde(default)]
    pub resources: BTreeMap<ResourceId, ResourceState>,
    /// Output values resolved after the last apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputValue>,
    /// Local files written by the renderer.
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactState>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Recent operations, oldest first.
    #[serde(default)]
    pub history: Vec<DeploymentHistoryEntry>,
}

/// State of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    /// Resource kind.
    pub kind: String,
    /// Logical name.
    pub name: String,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Current status.
    pub status: ResourceStatus,
    /// Attributes as declared, references unresolved.
    pub declared: BTreeMap<String, Value>,
    /// Hash of the declaration when last applied.
    pub declared_hash: String,
    /// Attributes as reported by the provider, `id` included.
    pub attributes: BTreeMap<String, Value>,
    /// Resources this one depended on when last applied.
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last changed.
    pub updated_at: DateTime<Utc>,
}

/// Status of a recorded resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// The resource exists and matches its recorded declaration.
    Created,
    /// An in-place update failed; the next plan replaces the resource.
    Tainted,
}

/// A resolved output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputValue {
    /// Resolved value.
    pub value: Value,
    /// Hide the value in CLI output.
    #[serde(default)]
    pub sensitive: bool,
}

/// A rendered local file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactState {
    /// Where the file was written.
    pub path: PathBuf,
    /// sha256 of the written content.
    pub content_hash: String,
    /// When the file was written.
    pub rendered_at: DateTime<Utc>,
}

/// A single entry in the operation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentHistoryEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: DeploymentOperation,
    /// Declaration hash at the time.
    pub config_hash: String,
    /// Completed actions, e.g. `create network.main`.
    pub actions: Vec<String>,
    /// Whether every action succeeded.
    pub success: bool,
    /// Error message of the failure, if any.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOperation {
    /// Apply of a create/update plan.
    Apply,
    /// Teardown.
    Destroy,
}

impl DeploymentState {
    /// Creates a new empty state with a fresh lineage.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            lineage: Uuid::new_v4().to_string(),
            serial: 0,
            project: project.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource by identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceState> {
        self.resources.get(id)
    }

    /// Adds or replaces a resource.
    pub fn set_resource(&mut self, resource: ResourceState) {
        let id = ResourceId::new(&resource.kind, &resource.name);
        self.resources.insert(id, resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource.
    pub fn remove_resource(&mut self, id: &ResourceId) -> Option<ResourceState> {
        let removed = self.resources.remove(id);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Marks the state as about to be written.
    pub fn bump_serial(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Adds a history entry, dropping the oldest beyond the limit.
    pub fn add_history(&mut self, entry: DeploymentHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }

    /// Returns all recorded identities.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&ResourceId> {
        self.resources.keys().collect()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.artifacts.is_empty()
    }
}

impl ResourceState {
    /// Creates a resource state from a successful provider call.
    #[must_use]
    pub fn new(
        id: &ResourceId,
        provider_id: &str,
        declared: BTreeMap<String, Value>,
        declared_hash: &str,
        attributes: BTreeMap<String, Value>,
        dependencies: Vec<ResourceId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            kind: id.kind.clone(),
            name: id.name.clone(),
            provider_id: provider_id.to_string(),
            status: ResourceStatus::Created,
            declared,
            declared_hash: declared_hash.to_string(),
            attributes,
            dependencies,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the identity.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.kind, &self.name)
    }

    /// Looks up an attribute; `id` is always available.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<Value> {
        if name == "id" {
            return Some(Value::String(self.provider_id.clone()));
        }
        self.attributes.get(name).cloned()
    }

    /// Updates the status.
    pub fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

impl DeploymentHistoryEntry {
    /// Creates a history entry.
    #[must_use]
    pub fn new(
        operation: DeploymentOperation,
        config_hash: &str,
        actions: Vec<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            actions,
            success: error.is_none(),
            error,
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Created => "created",
            Self::Tainted => "tainted",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for DeploymentOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn network() -> ResourceState {
        ResourceState::new(
            &ResourceId::new("network", "main"),
            "net-0001",
            BTreeMap::from([(String::from("cidr_block"), json!("10.0.0.0/16"))]),
            "abc",
            BTreeMap::from([(String::from("cidr_block"), json!("10.0.0.0/16"))]),
            Vec::new(),
        )
    }

    #[test]
    fn test_state_roundtrip_keys_are_addresses() {
        let mut state = DeploymentState::new("devbox", "dev");
        state.set_resource(network());

        let json = serde_json::to_value(&state).expect("serialize");
        assert!(json["resources"].get("network.main").is_some());

        let back: DeploymentState = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, state);
        assert_eq!(back.resource_ids(), vec![&ResourceId::new("network", "main")]);
    }

    #[test]
    fn test_id_attribute_is_provider_id() {
        let resource = network();
        assert_eq!(resource.attribute("id"), Some(json!("net-0001")));
        assert_eq!(resource.attribute("missing"), None);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = DeploymentState::new("devbox", "dev");
        for i in 0..105 {
            state.add_history(DeploymentHistoryEntry::new(
                DeploymentOperation::Apply,
                &format!("hash-{i}"),
                Vec::new(),
                None,
            ));
        }

        assert_eq!(state.history.len(), 100);
        assert_eq!(state.history[0].config_hash, "hash-5");
        assert!(state.history[99].success);
    }
}
