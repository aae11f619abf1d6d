//! Diff engine for comparing declarations against recorded state.
//!
//! Declared attributes are compared in their unresolved form against the
//! declared form recorded at the last apply, so provider-computed values
//! never show up as changes.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::ConfigHasher;
use crate::error::PlanError;
use crate::graph::{Resource, ResourceGraph, ResourceId};
use crate::provider::SchemaRegistry;
use crate::state::{DeploymentState, ResourceState, ResourceStatus};

/// Engine for computing diffs between declarations and state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Declaration hasher.
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDiff {
    /// Resource identity.
    pub id: ResourceId,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Attribute-level changes.
    pub changes: Vec<AttributeChange>,
    /// Short explanation.
    pub reason: String,
    /// Recorded declaration hash, if any.
    pub old_hash: Option<String>,
    /// Current declaration hash, if declared.
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    /// Not in state: create.
    Create,
    /// Mutable attributes changed: update in place.
    Update,
    /// An immutable attribute changed: destroy then create.
    Replace,
    /// In state but no longer declared: destroy.
    Delete,
    /// Nothing to do.
    NoChange,
}

/// One changed attribute.
#[derive(Debug, Clone, Serialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub attribute: String,
    /// Recorded declared value.
    pub old_value: Option<Value>,
    /// Current declared value.
    pub new_value: Option<Value>,
    /// True if this change alone forces replacement.
    pub forces_replacement: bool,
    /// Set when the change comes from a referenced resource.
    pub cause: Option<String>,
}

/// Complete diff result.
#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    /// Declared resources in dependency order, then orphans.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update in place.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff between the graph and recorded state.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::Cycle` if the graph cannot be ordered.
    pub fn compute_diff(
        &self,
        graph: &ResourceGraph,
        state: &DeploymentState,
        schemas: &SchemaRegistry,
    ) -> Result<DiffResult, PlanError> {
        let order = graph.topological_order()?;
        let mut diffs = Vec::with_capacity(order.len());
        let mut decided: HashMap<ResourceId, (DiffType, Vec<String>)> = HashMap::new();

        for resource in order {
            let new_hash = self.hasher.hash_resource(resource);
            let diff = match state.get(&resource.id) {
                None => ResourceDiff {
                    id: resource.id.clone(),
                    diff_type: DiffType::Create,
                    changes: Vec::new(),
                    reason: String::from("not yet created"),
                    old_hash: None,
                    new_hash: Some(new_hash),
                },
                Some(recorded) => Self::diff_existing(resource, recorded, &decided, schemas, new_hash),
            };

            debug!("{}: {} ({})", diff.id, diff.diff_type, diff.reason);
            let changed = diff.changes.iter().map(|c| c.attribute.clone()).collect();
            decided.insert(diff.id.clone(), (diff.diff_type, changed));
            diffs.push(diff);
        }

        for (id, recorded) in &state.resources {
            if !graph.contains(id) {
                debug!("Found orphaned resource: {id}");
                diffs.push(ResourceDiff {
                    id: id.clone(),
                    diff_type: DiffType::Delete,
                    changes: Vec::new(),
                    reason: String::from("no longer declared"),
                    old_hash: Some(recorded.declared_hash.clone()),
                    new_hash: None,
                });
            }
        }

        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        Ok(DiffResult {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            replaces: count(DiffType::Replace),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        })
    }

    fn diff_existing(
        resource: &Resource,
        recorded: &ResourceState,
        decided: &HashMap<ResourceId, (DiffType, Vec<String>)>,
        schemas: &SchemaRegistry,
        new_hash: String,
    ) -> ResourceDiff {
        let is_immutable = |attribute: &str| {
            schemas.is_immutable(&resource.id.kind, attribute)
                || resource.replace_on_change.iter().any(|a| a == attribute)
        };

        let mut changes: Vec<AttributeChange> = Vec::new();
        let keys: BTreeSet<&String> = resource
            .attributes
            .keys()
            .chain(recorded.declared.keys())
            .collect();

        for key in keys {
            let new_value = resource.attributes.get(key);
            let old_value = recorded.declared.get(key);
            if new_value != old_value {
                changes.push(AttributeChange {
                    attribute: key.clone(),
                    old_value: old_value.cloned(),
                    new_value: new_value.cloned(),
                    forces_replacement: is_immutable(key),
                    cause: None,
                });
            }
        }

        // A replaced dependency gets a new id; an updated one may change the
        // referenced attribute.
        for dependency in resource.dependencies() {
            let Some((dep_type, dep_changed)) = decided.get(&dependency) else {
                continue;
            };
            for (attribute, reference) in &resource.references {
                if reference.target != dependency || changes.iter().any(|c| &c.attribute == attribute) {
                    continue;
                }
                let affected = match dep_type {
                    DiffType::Replace | DiffType::Create => true,
                    DiffType::Update => dep_changed.contains(&reference.attribute),
                    DiffType::Delete | DiffType::NoChange => false,
                };
                if affected {
                    changes.push(AttributeChange {
                        attribute: attribute.clone(),
                        old_value: recorded.declared.get(attribute).cloned(),
                        new_value: resource.attributes.get(attribute).cloned(),
                        forces_replacement: is_immutable(attribute),
                        cause: Some(format!("{dependency} {}", dep_type.past_tense())),
                    });
                }
            }
        }

        let tainted = recorded.status == ResourceStatus::Tainted;
        let forced: Vec<&str> = changes
            .iter()
            .filter(|c| c.forces_replacement)
            .map(|c| c.attribute.as_str())
            .collect();

        let (diff_type, reason) = if tainted {
            (DiffType::Replace, String::from("tainted by a failed update"))
        } else if !forced.is_empty() {
            (DiffType::Replace, format!("forces replacement: {}", forced.join(", ")))
        } else if !changes.is_empty() {
            let names: Vec<&str> = changes.iter().map(|c| c.attribute.as_str()).collect();
            (DiffType::Update, format!("changed: {}", names.join(", ")))
        } else {
            (DiffType::NoChange, String::from("up to date"))
        };

        ResourceDiff {
            id: resource.id.clone(),
            diff_type,
            changes,
            reason,
            old_hash: Some(recorded.declared_hash.clone()),
            new_hash: Some(new_hash),
        }
    }
}

impl DiffType {
    const fn past_tense(self) -> &'static str {
        match self {
            Self::Create => "created",
            Self::Update => "updated",
            Self::Replace => "replaced",
            Self::Delete => "deleted",
            Self::NoChange => "unchanged",
        }
    }
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.replaces > 0 || self.deletes > 0
    }

    /// Looks up the diff for a resource.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| &d.id == id)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.id, self.diff_type)?;
        if !self.changes.is_empty() {
            let fields: Vec<&str> = self.changes.iter().map(|c| c.attribute.as_str()).collect();
            write!(f, " ({})", fields.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::graph::{AttributeRef, SourceLocation};
    use serde_json::json;
    use std::collections::BTreeMap;

    pub(crate) fn resource(
        kind: &str,
        name: &str,
        attributes: &[(&str, Value)],
    ) -> Resource {
        let attributes: BTreeMap<String, Value> = attributes
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();

        let mut references = Vec::new();
        for (key, value) in &attributes {
            let mut found: Vec<AttributeRef> = Vec::new();
            crate::graph::expr::collect_references(value, &mut found).expect("valid refs");
            references.extend(found.into_iter().map(|r| (key.clone(), r)));
        }

        Resource {
            id: ResourceId::new(kind, name),
            attributes,
            depends_on: Vec::new(),
            references,
            replace_on_change: Vec::new(),
            location: SourceLocation {
                file: String::from("main.yaml"),
                index: 0,
                section: "resources",
            },
        }
    }

    pub(crate) fn sample_graph(cidr: &str, subnet_tags: &str) -> ResourceGraph {
        ResourceGraph::new(
            vec![
                resource("network", "main", &[("cidr_block", json!(cidr))]),
                resource(
                    "subnet",
                    "public",
                    &[
                        ("network_id", json!("${network.main.id}")),
                        ("cidr_block", json!("10.0.1.0/24")),
                        ("tags", json!(subnet_tags)),
                    ],
                ),
                resource(
                    "instance",
                    "dev",
                    &[
                        ("subnet_id", json!("${subnet.public.id}")),
                        ("instance_type", json!("t3.micro")),
                    ],
                ),
            ],
            Vec::new(),
            Vec::new(),
        )
    }

    /// Records every resource of `graph` as created with its current declaration.
    pub(crate) fn applied_state(graph: &ResourceGraph) -> DeploymentState {
        let hasher = ConfigHasher::new();
        let mut state = DeploymentState::new("devbox", "dev");
        for (i, r) in graph.resources().enumerate() {
            state.set_resource(ResourceState::new(
                &r.id,
                &format!("{}-{i}", r.id.kind),
                r.attributes.clone(),
                &hasher.hash_resource(r),
                r.attributes.clone(),
                r.dependencies(),
            ));
        }
        state
    }

    fn types(result: &DiffResult) -> Vec<(String, DiffType)> {
        result
            .diffs
            .iter()
            .map(|d| (d.id.to_string(), d.diff_type))
            .collect()
    }

    #[test]
    fn test_empty_state_creates_in_order() {
        let graph = sample_graph("10.0.0.0/16", "a");
        let result = DiffEngine::new()
            .compute_diff(&graph, &DeploymentState::new("devbox", "dev"), &SchemaRegistry::builtin())
            .expect("diff");

        assert_eq!(
            types(&result),
            vec![
                (String::from("network.main"), DiffType::Create),
                (String::from("subnet.public"), DiffType::Create),
                (String::from("instance.dev"), DiffType::Create),
            ]
        );
        assert_eq!(result.creates, 3);
    }

    #[test]
    fn test_unchanged_declarations_yield_no_changes() {
        let graph = sample_graph("10.0.0.0/16", "a");
        let state = applied_state(&graph);
        let result = DiffEngine::new()
            .compute_diff(&graph, &state, &SchemaRegistry::builtin())
            .expect("diff");

        assert!(!result.has_changes());
        assert_eq!(result.unchanged, 3);
    }

    #[test]
    fn test_mutable_change_is_update() {
        let state = applied_state(&sample_graph("10.0.0.0/16", "a"));
        let result = DiffEngine::new()
            .compute_diff(&sample_graph("10.0.0.0/16", "b"), &state, &SchemaRegistry::builtin())
            .expect("diff");

        let subnet = result.get(&ResourceId::new("subnet", "public")).expect("subnet diff");
        assert_eq!(subnet.diff_type, DiffType::Update);
        assert_eq!(subnet.reason, "changed: tags");
        // subnet.public.id does not change on update
        let instance = result.get(&ResourceId::new("instance", "dev")).expect("instance diff");
        assert_eq!(instance.diff_type, DiffType::NoChange);
    }

    #[test]
    fn test_immutable_change_replaces_dependents() {
        let state = applied_state(&sample_graph("10.0.0.0/16", "a"));
        let result = DiffEngine::new()
            .compute_diff(&sample_graph("10.1.0.0/16", "a"), &state, &SchemaRegistry::builtin())
            .expect("diff");

        assert_eq!(
            types(&result),
            vec![
                (String::from("network.main"), DiffType::Replace),
                (String::from("subnet.public"), DiffType::Replace),
                (String::from("instance.dev"), DiffType::Replace),
            ]
        );
        let subnet = result.get(&ResourceId::new("subnet", "public")).expect("subnet diff");
        assert_eq!(subnet.changes[0].cause.as_deref(), Some("network.main replaced"));
    }

    #[test]
    fn test_orphans_are_deleted() {
        let graph = sample_graph("10.0.0.0/16", "a");
        let mut state = applied_state(&graph);
        state.set_resource(ResourceState::new(
            &ResourceId::new("key_pair", "old"),
            "kp-9",
            BTreeMap::new(),
            "h",
            BTreeMap::new(),
            Vec::new(),
        ));

        let result = DiffEngine::new()
            .compute_diff(&graph, &state, &SchemaRegistry::builtin())
            .expect("diff");
        assert_eq!(result.deletes, 1);
        assert_eq!(
            result.diffs.last().map(|d| (d.id.to_string(), d.diff_type)),
            Some((String::from("key_pair.old"), DiffType::Delete))
        );
    }

    #[test]
    fn test_tainted_resource_is_replaced() {
        let graph = sample_graph("10.0.0.0/16", "a");
        let mut state = applied_state(&graph);
        if let Some(r) = state.resources.get_mut(&ResourceId::new("instance", "dev")) {
            r.set_status(ResourceStatus::Tainted);
        }

        let result = DiffEngine::new()
            .compute_diff(&graph, &state, &SchemaRegistry::builtin())
            .expect("diff");
        assert_eq!(result.replaces, 1);
    }

    #[test]
    fn test_replace_on_change_marks_immutable() {
        let mut old = sample_graph("10.0.0.0/16", "a");
        let state = applied_state(&old);

        let mut resources: Vec<Resource> = old.resources().cloned().collect();
        resources[2].attributes.insert(String::from("instance_type"), json!("t3.large"));
        resources[2].replace_on_change = vec![String::from("instance_type")];
        old = ResourceGraph::new(resources, Vec::new(), Vec::new());

        let result = DiffEngine::new()
            .compute_diff(&old, &state, &SchemaRegistry::builtin())
            .expect("diff");
        let instance = result.get(&ResourceId::new("instance", "dev")).expect("instance diff");
        assert_eq!(instance.diff_type, DiffType::Replace);
    }
}
