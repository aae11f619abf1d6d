//! The resource graph.
//!
//! Resources live in an arena (a petgraph `DiGraph`) indexed by logical
//! name. Node indices follow declaration order and edges run from a
//! dependency to its dependents, so a topological walk yields a valid
//! creation order.

pub mod expr;
mod loader;
mod resource;

pub use expr::{AttributeRef, Expression};
pub use loader::{DeclarationLoader, SourceDocument};
pub use resource::{Resource, ResourceId, SourceLocation};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use crate::error::PlanError;

/// A loaded output declaration.
#[derive(Debug, Clone)]
pub struct Output {
    /// Output name, also the template placeholder.
    pub name: String,
    /// Expression with variables already substituted.
    pub value: String,
    /// Resource attributes the expression reads.
    pub references: Vec<AttributeRef>,
    /// Free-form description.
    pub description: Option<String>,
    /// Hide the value in CLI output.
    pub sensitive: bool,
    /// Declaration site.
    pub location: SourceLocation,
}

/// A loaded render declaration with paths resolved.
#[derive(Debug, Clone)]
pub struct RenderTarget {
    /// Artifact name.
    pub name: String,
    /// Default template file.
    pub template: PathBuf,
    /// Template files keyed by host OS.
    pub variants: BTreeMap<String, PathBuf>,
    /// Target path; may still start with `~/`.
    pub path: PathBuf,
    /// Declaration site.
    pub location: SourceLocation,
}

impl RenderTarget {
    /// Returns the template file for the given host OS.
    #[must_use]
    pub fn template_for(&self, host_os: &str) -> &PathBuf {
        self.variants.get(host_os).unwrap_or(&self.template)
    }
}

/// Dependency graph of declared resources.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    graph: DiGraph<Resource, ()>,
    index: HashMap<ResourceId, NodeIndex>,
    outputs: Vec<Output>,
    renders: Vec<RenderTarget>,
}

impl ResourceGraph {
    /// Builds the graph from resources in declaration order.
    ///
    /// Edges to identities that are not part of `resources` are skipped;
    /// the loader rejects those before getting here.
    #[must_use]
    pub fn new(resources: Vec<Resource>, outputs: Vec<Output>, renders: Vec<RenderTarget>) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for resource in resources {
            let id = resource.id.clone();
            let idx = graph.add_node(resource);
            index.insert(id, idx);
        }

        let mut edges = Vec::new();
        for idx in graph.node_indices() {
            for dependency in graph[idx].dependencies() {
                if let Some(&dep_idx) = index.get(&dependency) {
                    edges.push((dep_idx, idx));
                }
            }
        }
        for (from, to) in edges {
            graph.update_edge(from, to, ());
        }

        Self {
            graph,
            index,
            outputs,
            renders,
        }
    }

    /// Returns all resources in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.graph.node_weights()
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Looks up a resource by identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    /// Returns true if the resource is declared.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Returns the declared outputs.
    #[must_use]
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// Returns the declared render targets.
    #[must_use]
    pub fn renders(&self) -> &[RenderTarget] {
        &self.renders
    }

    /// Returns the direct dependencies of a resource.
    #[must_use]
    pub fn dependencies(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Returns the direct dependents of a resource.
    #[must_use]
    pub fn dependents(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &ResourceId, direction: Direction) -> Vec<&ResourceId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        found.sort_unstable();
        found.into_iter().map(|n| &self.graph[n].id).collect()
    }

    /// Orders resources so that every resource follows its dependencies.
    ///
    /// Among resources that are ready at the same time, the one declared
    /// first comes first.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::Cycle` naming the resources on a cycle.
    pub fn topological_order(&self) -> Result<Vec<&Resource>, PlanError> {
        if let Some(cycle) = self.find_cycle() {
            let first = &self.graph[cycle[0]];
            let names: Vec<String> = cycle.iter().map(|&n| self.graph[n].id.to_string()).collect();
            return Err(PlanError::Cycle {
                cycle: names.join(" -> "),
                location: first.location.to_string(),
            });
        }

        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .collect();

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(next) = ready.pop_first() {
            let idx = NodeIndex::new(next);
            order.push(&self.graph[idx]);
            for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                let slot = &mut in_degree[dependent.index()];
                *slot -= 1;
                if *slot == 0 {
                    ready.insert(dependent.index());
                }
            }
        }

        Ok(order)
    }

    /// Finds one dependency cycle, written as the path that closes it.
    ///
    /// The first element is repeated at the end: `[a, b, a]` means `a`
    /// depends on `b` and `b` depends on `a`.
    fn find_cycle(&self) -> Option<Vec<NodeIndex>> {
        let mut components: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0])
            })
            .collect();

        for scc in &mut components {
            scc.sort_unstable();
        }
        components.sort_unstable_by_key(|scc| scc[0]);

        let scc = components.into_iter().next()?;
        let start = scc[0];
        if self.graph.contains_edge(start, start) {
            return Some(vec![start, start]);
        }

        let members: BTreeSet<NodeIndex> = scc.iter().copied().collect();
        let mut path = vec![start];
        let mut visited = BTreeSet::from([start]);
        if self.walk_back_to(start, start, &members, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn walk_back_to(
        &self,
        current: NodeIndex,
        start: NodeIndex,
        members: &BTreeSet<NodeIndex>,
        visited: &mut BTreeSet<NodeIndex>,
        path: &mut Vec<NodeIndex>,
    ) -> bool {
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(current, Direction::Incoming)
            .filter(|n| members.contains(n))
            .collect();
        next.sort_unstable();

        for dependency in next {
            if dependency == start {
                path.push(start);
                return true;
            }
            if visited.insert(dependency) {
                path.push(dependency);
                if self.walk_back_to(dependency, start, members, visited, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(kind: &str, name: &str, index: usize, deps: &[&str]) -> Resource {
        Resource {
            id: ResourceId::new(kind, name),
            attributes: BTreeMap::new(),
            depends_on: deps
                .iter()
                .map(|d| ResourceId::parse(d).expect("valid address"))
                .collect(),
            references: Vec::new(),
            replace_on_change: Vec::new(),
            location: SourceLocation {
                file: String::from("main.yaml"),
                index,
                section: "resources",
            },
        }
    }

    fn order(graph: &ResourceGraph) -> Vec<String> {
        graph
            .topological_order()
            .expect("acyclic graph")
            .iter()
            .map(|r| r.id.to_string())
            .collect()
    }

    #[test]
    fn test_dependencies_come_first() {
        let graph = ResourceGraph::new(
            vec![
                resource("instance", "dev", 0, &["subnet.public"]),
                resource("subnet", "public", 1, &["network.main"]),
                resource("network", "main", 2, &[]),
            ],
            Vec::new(),
            Vec::new(),
        );

        assert_eq!(order(&graph), vec!["network.main", "subnet.public", "instance.dev"]);
    }

    #[test]
    fn test_ties_break_by_declaration_order() {
        let graph = ResourceGraph::new(
            vec![
                resource("key_pair", "dev", 0, &[]),
                resource("network", "main", 1, &[]),
                resource("security_group", "ssh", 2, &["network.main"]),
                resource("subnet", "public", 3, &["network.main"]),
            ],
            Vec::new(),
            Vec::new(),
        );

        assert_eq!(
            order(&graph),
            vec!["key_pair.dev", "network.main", "security_group.ssh", "subnet.public"]
        );
        assert_eq!(
            graph
                .dependents(&ResourceId::new("network", "main"))
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            vec!["security_group.ssh", "subnet.public"]
        );
    }

    #[test]
    fn test_cycle_is_reported() {
        let graph = ResourceGraph::new(
            vec![
                resource("network", "main", 0, &[]),
                resource("subnet", "a", 1, &["route_table.b", "network.main"]),
                resource("route_table", "b", 2, &["subnet.a"]),
            ],
            Vec::new(),
            Vec::new(),
        );

        match graph.topological_order() {
            Err(PlanError::Cycle { cycle, location }) => {
                assert_eq!(cycle, "subnet.a -> route_table.b -> subnet.a");
                assert_eq!(location, "main.yaml: resources[1]");
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let graph = ResourceGraph::new(
            vec![resource("network", "main", 0, &["network.main"])],
            Vec::new(),
            Vec::new(),
        );

        match graph.topological_order() {
            Err(PlanError::Cycle { cycle, .. }) => assert_eq!(cycle, "network.main -> network.main"),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }
}
