//! Deployment plan types and construction.
//!
//! A plan lists destroy actions first, dependents before their
//! dependencies, followed by create and update actions in topological
//! order. Each action names the plan indices it waits on, which is all the
//! executor needs to schedule it. Those indices may point forward: the
//! destroy of an undeclared resource waits for the updates that detach its
//! dependents.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::PlanError;
use crate::graph::{ResourceGraph, ResourceId};
use crate::state::{DeploymentOperation, DeploymentState};

use super::diff::{DiffResult, DiffType};

/// A complete deployment plan.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Declaration hash this plan is based on.
    pub config_hash: String,
    /// Whether this plan applies declarations or tears everything down.
    pub operation: DeploymentOperation,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    /// Action type.
    pub action_type: ActionType,
    /// Target resource.
    pub resource: ResourceId,
    /// Provider id for updates and destroys.
    pub provider_id: Option<String>,
    /// Declared attributes, references unresolved. Empty for destroys.
    pub attributes: BTreeMap<String, Value>,
    /// Resources the target depends on, recorded into state.
    pub resource_dependencies: Vec<ResourceId>,
    /// Reason for this action.
    pub reason: String,
    /// Declaration hash after the action.
    pub new_hash: Option<String>,
    /// Part of a destroy-then-create replacement.
    pub replacement: bool,
    /// Plan indices that must complete first.
    pub dependencies: Vec<usize>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Destroy a resource.
    Destroy,
}

impl DeploymentPlan {
    /// Builds a plan from a diff.
    ///
    /// # Errors
    ///
    /// Returns an error if recorded dependencies in state form a cycle or a
    /// diffed resource is missing from the graph.
    pub fn from_diff(
        diff: &DiffResult,
        graph: &ResourceGraph,
        state: &DeploymentState,
        config_hash: &str,
    ) -> Result<Self, PlanError> {
        let doomed: BTreeSet<ResourceId> = diff
            .diffs
            .iter()
            .filter(|d| matches!(d.diff_type, DiffType::Delete | DiffType::Replace))
            .map(|d| d.id.clone())
            .collect();

        let mut actions = Vec::new();
        let destroy_index = push_destroys(&mut actions, state, &doomed, |id| {
            diff.get(id).map_or_else(String::new, |d| d.reason.clone())
        })?;

        let mut apply_index: HashMap<ResourceId, usize> = HashMap::new();
        for resource_diff in &diff.diffs {
            let action_type = match resource_diff.diff_type {
                DiffType::Create | DiffType::Replace => ActionType::Create,
                DiffType::Update => ActionType::Update,
                DiffType::Delete | DiffType::NoChange => continue,
            };

            let resource = graph.get(&resource_diff.id).ok_or_else(|| {
                PlanError::DependencyResolutionFailed {
                    message: format!("{} is in the diff but not declared", resource_diff.id),
                }
            })?;

            let resource_dependencies = resource.dependencies();
            let mut dependencies: Vec<usize> = resource_dependencies
                .iter()
                .filter_map(|dep| apply_index.get(dep).copied())
                .collect();
            let replacement = resource_diff.diff_type == DiffType::Replace;
            if replacement && let Some(&index) = destroy_index.get(&resource.id) {
                dependencies.push(index);
            }
            dependencies.sort_unstable();

            let provider_id = match action_type {
                ActionType::Update => state.get(&resource.id).map(|r| r.provider_id.clone()),
                ActionType::Create | ActionType::Destroy => None,
            };

            apply_index.insert(resource.id.clone(), actions.len());
            actions.push(PlannedAction {
                action_type,
                resource: resource.id.clone(),
                provider_id,
                attributes: resource.attributes.clone(),
                resource_dependencies,
                reason: resource_diff.reason.clone(),
                new_hash: resource_diff.new_hash.clone(),
                replacement,
                dependencies,
            });
        }

        // A resource dropped from the declarations is destroyed only after
        // its recorded dependents have been updated to stop referencing it.
        for (doomed_id, &index) in &destroy_index {
            if diff.get(doomed_id).map(|d| d.diff_type) != Some(DiffType::Delete) {
                continue;
            }
            let detaching = apply_index
                .iter()
                .filter(|(id, _)| state.get(id).is_some_and(|r| r.dependencies.contains(doomed_id)))
                .map(|(_, &apply_at)| apply_at);
            let dependencies = &mut actions[index].dependencies;
            dependencies.extend(detaching);
            dependencies.sort_unstable();
            dependencies.dedup();
        }

        Ok(Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            operation: DeploymentOperation::Apply,
            actions,
        })
    }

    /// Builds a plan destroying everything recorded in state.
    ///
    /// # Errors
    ///
    /// Returns an error if recorded dependencies form a cycle.
    pub fn destroy(state: &DeploymentState) -> Result<Self, PlanError> {
        let doomed: BTreeSet<ResourceId> = state.resources.keys().cloned().collect();
        let mut actions = Vec::new();
        push_destroys(&mut actions, state, &doomed, |_| String::from("destroy requested"))?;

        Ok(Self {
            created_at: Utc::now(),
            config_hash: state.config_hash.clone(),
            operation: DeploymentOperation::Destroy,
            actions,
        })
    }

    /// Returns true if the plan has no actions.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Returns the number of actions of one type.
    #[must_use]
    pub fn count(&self, action_type: ActionType) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .count()
    }

    /// Returns true if both plans run the same actions against the same
    /// declarations. Creation times are ignored.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        let key = |a: &PlannedAction| {
            (
                a.action_type,
                a.resource.clone(),
                a.provider_id.clone(),
                a.dependencies.clone(),
            )
        };
        self.config_hash == other.config_hash
            && self.operation == other.operation
            && self.actions.iter().map(key).eq(other.actions.iter().map(key))
    }

    /// One-line summary, e.g. `3 to create, 0 to update, 1 to destroy`.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} to create, {} to update, {} to destroy",
            self.count(ActionType::Create),
            self.count(ActionType::Update),
            self.count(ActionType::Destroy)
        )
    }
}

/// Appends destroy actions for `doomed` and returns their plan indices.
fn push_destroys(
    actions: &mut Vec<PlannedAction>,
    state: &DeploymentState,
    doomed: &BTreeSet<ResourceId>,
    reason: impl Fn(&ResourceId) -> String,
) -> Result<HashMap<ResourceId, usize>, PlanError> {
    let mut destroy_index: HashMap<ResourceId, usize> = HashMap::new();

    for id in teardown_order(state)? {
        if !doomed.contains(&id) {
            continue;
        }
        let Some(recorded) = state.get(&id) else {
            continue;
        };

        // Dependents come earlier in teardown order, so they are indexed.
        let mut dependencies: Vec<usize> = state
            .resources
            .iter()
            .filter(|(_, r)| r.dependencies.contains(&id))
            .filter_map(|(dependent, _)| destroy_index.get(dependent).copied())
            .collect();
        dependencies.sort_unstable();

        destroy_index.insert(id.clone(), actions.len());
        actions.push(PlannedAction {
            action_type: ActionType::Destroy,
            resource: id.clone(),
            provider_id: Some(recorded.provider_id.clone()),
            attributes: BTreeMap::new(),
            resource_dependencies: recorded.dependencies.clone(),
            reason: reason(&id),
            new_hash: None,
            replacement: false,
            dependencies,
        });
    }

    Ok(destroy_index)
}

/// Orders every recorded resource so dependents precede their dependencies.
///
/// This is the reverse of a Kahn ordering over recorded dependencies, with
/// ties broken by address.
fn teardown_order(state: &DeploymentState) -> Result<Vec<ResourceId>, PlanError> {
    let mut in_degree: BTreeMap<&ResourceId, usize> = BTreeMap::new();
    let mut dependents: HashMap<&ResourceId, Vec<&ResourceId>> = HashMap::new();

    for (id, recorded) in &state.resources {
        let known: BTreeSet<&ResourceId> = recorded
            .dependencies
            .iter()
            .filter(|dep| state.resources.contains_key(*dep) && *dep != id)
            .collect();
        in_degree.insert(id, known.len());
        for dep in known {
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut ready: BTreeSet<&ResourceId> = in_degree
        .iter()
        .filter(|&(_, &degree)| degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.clone());
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() != in_degree.len() {
        let stuck: Vec<String> = in_degree
            .iter()
            .filter(|&(id, _)| !order.contains(id))
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(PlanError::DependencyResolutionFailed {
            message: format!("recorded dependencies form a cycle among {}", stuck.join(", ")),
        });
    }

    order.reverse();
    Ok(order)
}

impl PlannedAction {
    /// Short description, e.g. `create network.main`.
    #[must_use]
    pub fn description(&self) -> String {
        format!("{} {}", self.action_type, self.resource)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Plan ({} actions): {}", self.actions.len(), self.summary())?;
        for (i, action) in self.actions.iter().enumerate() {
            writeln!(f, "  {}. {}", i + 1, action)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::diff::DiffEngine;
    use crate::planner::diff::tests::{applied_state, resource, sample_graph};
    use crate::provider::SchemaRegistry;
    use serde_json::json;

    fn plan_for(graph: &ResourceGraph, state: &DeploymentState) -> DeploymentPlan {
        let diff = DiffEngine::new()
            .compute_diff(graph, state, &SchemaRegistry::builtin())
            .expect("diff");
        DeploymentPlan::from_diff(&diff, graph, state, "hash").expect("plan")
    }

    fn descriptions(plan: &DeploymentPlan) -> Vec<String> {
        plan.actions.iter().map(PlannedAction::description).collect()
    }

    #[test]
    fn test_first_apply_creates_in_dependency_order() {
        let graph = sample_graph("10.0.0.0/16", "a");
        let plan = plan_for(&graph, &DeploymentState::new("devbox", "dev"));

        assert_eq!(
            descriptions(&plan),
            vec!["create network.main", "create subnet.public", "create instance.dev"]
        );
        assert_eq!(plan.actions[0].dependencies, Vec::<usize>::new());
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert_eq!(plan.actions[2].dependencies, vec![1]);
    }

    #[test]
    fn test_second_plan_is_empty() {
        let graph = sample_graph("10.0.0.0/16", "a");
        let plan = plan_for(&graph, &applied_state(&graph));
        assert!(plan.is_empty());
        assert_eq!(plan.summary(), "0 to create, 0 to update, 0 to destroy");
    }

    #[test]
    fn test_destroy_is_reverse_dependency_order() {
        let state = applied_state(&sample_graph("10.0.0.0/16", "a"));
        let plan = DeploymentPlan::destroy(&state).expect("destroy plan");

        assert_eq!(
            descriptions(&plan),
            vec!["destroy instance.dev", "destroy subnet.public", "destroy network.main"]
        );
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert_eq!(plan.actions[2].dependencies, vec![1]);
        assert_eq!(plan.actions[0].provider_id.as_deref(), Some("instance-2"));
    }

    #[test]
    fn test_replacement_destroys_before_create() {
        let state = applied_state(&sample_graph("10.0.0.0/16", "a"));
        let plan = plan_for(&sample_graph("10.1.0.0/16", "a"), &state);

        assert_eq!(
            descriptions(&plan),
            vec![
                "destroy instance.dev",
                "destroy subnet.public",
                "destroy network.main",
                "create network.main",
                "create subnet.public",
                "create instance.dev",
            ]
        );
        assert_eq!(plan.actions[3].dependencies, vec![2]);
        assert_eq!(plan.actions[4].dependencies, vec![1, 3]);
        assert!(plan.actions[3].replacement);
    }

    #[test]
    fn test_update_keeps_provider_id() {
        let state = applied_state(&sample_graph("10.0.0.0/16", "a"));
        let plan = plan_for(&sample_graph("10.0.0.0/16", "b"), &state);

        assert_eq!(descriptions(&plan), vec!["update subnet.public"]);
        assert_eq!(plan.actions[0].provider_id.as_deref(), Some("subnet-1"));
    }

    #[test]
    fn test_orphan_destroy_waits_for_detaching_update() {
        let security_group = |name: &str| resource("security_group", name, &[("ingress", json!("22"))]);
        let instance = |group: &str| {
            resource(
                "instance",
                "dev",
                &[("security_group_ids", json!([format!("${{security_group.{group}.id}}")]))],
            )
        };
        let before = ResourceGraph::new(vec![security_group("ssh"), instance("ssh")], Vec::new(), Vec::new());
        let after = ResourceGraph::new(vec![security_group("ssh2"), instance("ssh2")], Vec::new(), Vec::new());

        let plan = plan_for(&after, &applied_state(&before));

        assert_eq!(
            descriptions(&plan),
            vec!["destroy security_group.ssh", "create security_group.ssh2", "update instance.dev"]
        );
        assert_eq!(plan.actions[0].dependencies, vec![2]);
        assert_eq!(plan.actions[2].dependencies, vec![1]);
    }

    #[test]
    fn test_matching_ignores_creation_time() {
        let graph = sample_graph("10.0.0.0/16", "a");
        let empty = DeploymentState::new("devbox", "dev");
        let first = plan_for(&graph, &empty);
        let again = plan_for(&graph, &empty);
        assert!(first.matches(&again));

        let applied = plan_for(&graph, &applied_state(&graph));
        assert!(!first.matches(&applied));
        let retagged = plan_for(&sample_graph("10.0.0.0/16", "b"), &applied_state(&graph));
        assert!(!applied.matches(&retagged));
    }

    #[test]
    fn test_recorded_cycle_is_reported() {
        let graph = sample_graph("10.0.0.0/16", "a");
        let mut state = applied_state(&graph);
        if let Some(network) = state.resources.get_mut(&ResourceId::new("network", "main")) {
            network.dependencies.push(ResourceId::new("instance", "dev"));
        }

        assert!(matches!(
            DeploymentPlan::destroy(&state),
            Err(PlanError::DependencyResolutionFailed { .. })
        ));
    }
}
