//! Dependency DAG and topological ordering.
//!
//! The graph keeps an adjacency list indexed by declaration position. Ordering
//! uses Kahn's algorithm where the ready set is an ordered set of positions,
//! so among modules whose dependencies are satisfied the one declared first
//! always goes next. The same configuration therefore always yields the same
//! order.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::DesiredConfiguration;
use crate::error::GraphError;
use crate::state::StateSnapshot;

/// A module and the identifiers it depends on.
#[derive(Debug, Clone)]
struct Node {
    id: String,
    dependencies: Vec<String>,
}

/// Modules and their declared dependencies, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<Node>,
}

/// A topological order of modules: every module appears after all of its
/// dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionOrder {
    modules: Vec<String>,
    #[serde(skip)]
    positions: HashMap<String, usize>,
}

impl ResourceGraph {
    /// Creates an empty graph.
    #[must_use]
    pub const fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Adds a module. Validation is deferred to [`Self::build`].
    pub fn add_module<I, S>(&mut self, id: impl Into<String>, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes.push(Node {
            id: id.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        });
    }

    /// Builds the graph of one environment's desired modules.
    #[must_use]
    pub fn from_desired(desired: &DesiredConfiguration) -> Self {
        let mut graph = Self::new();
        for module in desired.modules() {
            graph.add_module(module.name.clone(), module.depends_on.iter().cloned());
        }
        graph
    }

    /// Builds the graph of modules recorded in a snapshot.
    ///
    /// Dependencies on modules that are no longer recorded are dropped, so
    /// the graph always builds from a consistent snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        let mut graph = Self::new();
        for (name, module) in &snapshot.modules {
            let deps = module
                .depends_on
                .iter()
                .filter(|d| snapshot.modules.contains_key(d.as_str()))
                .cloned();
            graph.add_module(name.clone(), deps);
        }
        graph
    }

    /// Number of modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no modules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Module identifiers in declaration order.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.id.as_str())
    }

    /// Declared dependencies of a module.
    #[must_use]
    pub fn dependencies(&self, id: &str) -> Option<&[String]> {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.dependencies.as_slice())
    }

    /// Modules that directly depend on `id`, in declaration order.
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.dependencies.iter().any(|d| d == id))
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Validates the graph and computes its execution order.
    ///
    /// # Errors
    ///
    /// - [`GraphError::DuplicateModule`] if two modules share an identifier.
    /// - [`GraphError::UnknownDependency`] for the first dependency, in
    ///   declaration order, naming an undeclared module.
    /// - [`GraphError::Cycle`] naming the modules of one cycle.
    pub fn build(&self) -> Result<ExecutionOrder, GraphError> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if index.insert(node.id.as_str(), i).is_some() {
                return Err(GraphError::DuplicateModule {
                    name: node.id.clone(),
                });
            }
        }

        // predecessors[i] holds the positions node i depends on, deduplicated.
        let mut predecessors: Vec<Vec<usize>> = Vec::with_capacity(self.nodes.len());
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            let mut deps = Vec::with_capacity(node.dependencies.len());
            for dep in &node.dependencies {
                let Some(&j) = index.get(dep.as_str()) else {
                    return Err(GraphError::UnknownDependency {
                        module: node.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                if !deps.contains(&j) {
                    deps.push(j);
                    successors[j].push(i);
                }
            }
            predecessors.push(deps);
        }

        let mut in_degree: Vec<usize> = predecessors.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut sorted = Vec::with_capacity(self.nodes.len());

        while let Some(next) = ready.pop_first() {
            sorted.push(next);
            for &succ in &successors[next] {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    ready.insert(succ);
                }
            }
        }

        if sorted.len() < self.nodes.len() {
            let cycle = self.find_cycle(&predecessors, &in_degree);
            debug!(cycle = ?cycle, "Dependency cycle detected");
            return Err(GraphError::Cycle { cycle });
        }

        let modules: Vec<String> = sorted
            .into_iter()
            .map(|i| self.nodes[i].id.clone())
            .collect();
        Ok(ExecutionOrder::from_modules(modules))
    }

    /// Finds one cycle among the nodes Kahn's algorithm could not release.
    ///
    /// Every unreleased node has an unreleased dependency, so walking
    /// dependencies from any of them must revisit a node on the current path.
    fn find_cycle(&self, predecessors: &[Vec<usize>], in_degree: &[usize]) -> Vec<String> {
        let blocked = |i: usize| in_degree[i] > 0;
        let Some(start) = (0..self.nodes.len()).find(|&i| blocked(i)) else {
            return Vec::new();
        };

        let mut path: Vec<usize> = vec![start];
        let mut on_path = vec![false; self.nodes.len()];
        on_path[start] = true;

        while let Some(&current) = path.last() {
            let Some(&next) = predecessors[current].iter().find(|&&p| blocked(p)) else {
                break;
            };
            if on_path[next] {
                let from = path.iter().position(|&p| p == next).unwrap_or(0);
                let mut cycle: Vec<String> = path[from..]
                    .iter()
                    .map(|&i| self.nodes[i].id.clone())
                    .collect();
                cycle.push(self.nodes[next].id.clone());
                return cycle;
            }
            on_path[next] = true;
            path.push(next);
        }

        path.into_iter().map(|i| self.nodes[i].id.clone()).collect()
    }
}

impl ExecutionOrder {
    fn from_modules(modules: Vec<String>) -> Self {
        let positions = modules
            .iter()
            .enumerate()
            .map(|(i, m)| (m.clone(), i))
            .collect();
        Self { modules, positions }
    }

    /// Modules in execution order.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.modules
    }

    /// Iterates modules in execution order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.modules.iter().map(String::as_str)
    }

    /// Position of a module in the order.
    #[must_use]
    pub fn position(&self, module: &str) -> Option<usize> {
        self.positions.get(module).copied()
    }

    /// Returns true if the module is part of the order.
    #[must_use]
    pub fn contains(&self, module: &str) -> bool {
        self.positions.contains_key(module)
    }

    /// Returns true if `first` comes strictly before `second`.
    #[must_use]
    pub fn precedes(&self, first: &str, second: &str) -> bool {
        matches!(
            (self.position(first), self.position(second)),
            (Some(a), Some(b)) if a < b
        )
    }

    /// The exact reverse order, used for teardown.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self::from_modules(self.modules.iter().rev().cloned().collect())
    }

    /// Number of modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns true if the order is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> ResourceGraph {
        let mut graph = ResourceGraph::new();
        for (id, deps) in edges {
            graph.add_module(*id, deps.iter().copied());
        }
        graph
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let g = graph(&[
            ("ingress", &["cluster"]),
            ("pool", &["cluster"]),
            ("cluster", &["network"]),
            ("network", &[]),
            ("storage", &["cluster", "network"]),
        ]);
        let order = g.build().expect("acyclic");

        assert_eq!(order.len(), 5);
        for id in g.modules() {
            for dep in g.dependencies(id).unwrap_or_default() {
                assert!(order.precedes(dep, id), "{dep} should precede {id}");
            }
        }
    }

    #[test]
    fn test_ties_broken_by_declaration_order() {
        let g = graph(&[
            ("c", &[]),
            ("a", &[]),
            ("b", &["c"]),
            ("d", &[]),
        ]);
        let order = g.build().expect("acyclic");
        assert_eq!(order.as_slice(), ["c", "a", "b", "d"]);
    }

    #[test]
    fn test_released_node_beats_later_declared_root() {
        // b is released after a and is declared before d, so it goes first.
        let g = graph(&[("a", &[]), ("b", &["a"]), ("d", &[])]);
        let order = g.build().expect("acyclic");
        assert_eq!(order.as_slice(), ["a", "b", "d"]);
    }

    #[test]
    fn test_cycle_names_its_members() {
        let g = graph(&[
            ("network", &[]),
            ("a", &["c", "network"]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("tail", &["a"]),
        ]);
        let err = g.build().unwrap_err();
        let GraphError::Cycle { cycle } = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(cycle.first(), cycle.last());
        let members: BTreeSet<&str> = cycle.iter().map(String::as_str).collect();
        assert_eq!(members, BTreeSet::from(["a", "b", "c"]));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let g = graph(&[("a", &["a"])]);
        assert_eq!(
            g.build(),
            Err(GraphError::Cycle {
                cycle: vec![String::from("a"), String::from("a")]
            })
        );
    }

    #[test]
    fn test_unknown_dependency_reported_in_declaration_order() {
        let g = graph(&[("a", &["x"]), ("b", &["y"])]);
        assert_eq!(
            g.build(),
            Err(GraphError::UnknownDependency {
                module: String::from("a"),
                dependency: String::from("x"),
            })
        );
    }

    #[test]
    fn test_duplicate_module() {
        let g = graph(&[("a", &[]), ("a", &[])]);
        assert!(matches!(g.build(), Err(GraphError::DuplicateModule { name }) if name == "a"));
    }

    #[test]
    fn test_repeated_dependency_counts_once() {
        let g = graph(&[("a", &[]), ("b", &["a", "a"])]);
        assert_eq!(g.build().expect("acyclic").as_slice(), ["a", "b"]);
    }

    #[test]
    fn test_reversed_and_dependents() {
        let g = graph(&[("net", &[]), ("cluster", &["net"]), ("pool", &["cluster"])]);
        let order = g.build().expect("acyclic");
        let reversed = order.reversed();
        assert_eq!(reversed.as_slice(), ["pool", "cluster", "net"]);
        assert_eq!(reversed.position("net"), Some(2));
        assert_eq!(g.dependents("net"), vec!["cluster"]);
    }

    #[test]
    fn test_empty_graph() {
        let order = ResourceGraph::new().build().expect("empty graph builds");
        assert!(order.is_empty());
    }
}
