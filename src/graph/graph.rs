// src/graph/graph.rs

use std::collections::{BTreeSet, HashMap};

use crate::errors::{FlowdagError, Result};
use crate::graph::task::TaskName;
use crate::recipe::Recipe;

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone)]
struct GraphNode {
    /// Direct dependencies: tasks that must succeed before this one can run.
    deps: Vec<TaskName>,
    /// Direct dependents: tasks that depend on this one.
    dependents: Vec<TaskName>,
}

/// In-memory dependency graph keyed by task name.
///
/// Declaration order is retained and drives the topological tie-break, so
/// run plans are reproducible across invocations.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    /// Task names in declaration order.
    order: Vec<TaskName>,
    nodes: HashMap<TaskName, GraphNode>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a validated [`Recipe`].
    ///
    /// Dependency edges are the task's full dependency set: explicit `needs`
    /// plus implicit edges from output references.
    pub fn from_recipe(recipe: &Recipe) -> Result<Self> {
        let mut graph = Self::new();
        for task in &recipe.tasks {
            graph.add_task(&task.name, task.dependency_names())?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Add a task with its dependency list.
    pub fn add_task(&mut self, name: &str, deps: Vec<TaskName>) -> Result<()> {
        if self.nodes.contains_key(name) {
            return Err(FlowdagError::DuplicateTaskName(name.to_string()));
        }
        self.order.push(name.to_string());
        self.nodes.insert(
            name.to_string(),
            GraphNode {
                deps,
                dependents: Vec::new(),
            },
        );
        Ok(())
    }

    /// Check that every dependency names a known task and that the `needs`
    /// relation is acyclic.
    pub fn validate(&mut self) -> Result<()> {
        for name in &self.order {
            for dep in &self.nodes[name].deps {
                if !self.nodes.contains_key(dep) {
                    return Err(FlowdagError::UnknownReference {
                        task: name.clone(),
                        reference: dep.clone(),
                    });
                }
            }
        }

        self.rebuild_dependents();

        let visited: Vec<&str> = self.topological_order().collect();
        if visited.len() != self.order.len() {
            let in_cycle = self
                .order
                .iter()
                .find(|name| !visited.contains(&name.as_str()))
                .cloned()
                .unwrap_or_default();
            return Err(FlowdagError::CyclicDependency(in_cycle));
        }
        Ok(())
    }

    fn rebuild_dependents(&mut self) {
        for node in self.nodes.values_mut() {
            node.dependents.clear();
        }
        for name in self.order.clone() {
            let deps = self.nodes[&name].deps.clone();
            for dep in deps {
                if let Some(dep_node) = self.nodes.get_mut(&dep) {
                    dep_node.dependents.push(name.clone());
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// All task names in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    /// Immediate dependencies of a task.
    pub fn dependencies_of(&self, name: &str) -> &[TaskName] {
        self.nodes
            .get(name)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a task.
    pub fn dependents_of(&self, name: &str) -> &[TaskName] {
        self.nodes
            .get(name)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Lazy topological order over the graph.
    ///
    /// Ties between tasks whose dependencies are all met break by
    /// declaration order. The iterator is finite and single-pass; call
    /// again for a fresh traversal. On a cyclic graph it simply stops
    /// early, which [`validate`](Self::validate) turns into a
    /// `CyclicDependency` error.
    pub fn topological_order(&self) -> TopologicalOrder<'_> {
        let index: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut indegree = vec![0usize; self.order.len()];
        for (i, name) in self.order.iter().enumerate() {
            indegree[i] = self
                .nodes[name]
                .deps
                .iter()
                .filter(|d| index.contains_key(d.as_str()))
                .count();
        }

        let ready: BTreeSet<usize> = indegree
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| (d == 0).then_some(i))
            .collect();

        TopologicalOrder {
            graph: self,
            indegree,
            ready,
        }
    }
}

/// Single-pass Kahn traversal with declaration-order tie-break.
#[derive(Debug)]
pub struct TopologicalOrder<'a> {
    graph: &'a TaskGraph,
    indegree: Vec<usize>,
    ready: BTreeSet<usize>,
}

impl<'a> Iterator for TopologicalOrder<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.ready.pop_first()?;
        let name = self.graph.order[next].as_str();

        for dependent in self.graph.dependents_of(name) {
            if let Some(i) = self.graph.order.iter().position(|n| n == dependent) {
                self.indegree[i] -= 1;
                if self.indegree[i] == 0 {
                    self.ready.insert(i);
                }
            }
        }

        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> TaskGraph {
        let mut g = TaskGraph::new();
        for (name, deps) in edges {
            g.add_task(name, deps.iter().map(|d| d.to_string()).collect())
                .unwrap();
        }
        g.validate().unwrap();
        g
    }

    #[test]
    fn duplicate_task_name_is_rejected() {
        let mut g = TaskGraph::new();
        g.add_task("a", vec![]).unwrap();
        let err = g.add_task("a", vec![]).unwrap_err();
        assert!(matches!(err, FlowdagError::DuplicateTaskName(name) if name == "a"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut g = TaskGraph::new();
        g.add_task("a", vec!["ghost".to_string()]).unwrap();
        assert!(matches!(
            g.validate().unwrap_err(),
            FlowdagError::UnknownReference { .. }
        ));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut g = TaskGraph::new();
        g.add_task("a", vec!["b".to_string()]).unwrap();
        g.add_task("b", vec!["a".to_string()]).unwrap();
        assert!(matches!(
            g.validate().unwrap_err(),
            FlowdagError::CyclicDependency(_)
        ));
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let g = graph(&[
            ("merge", &["left", "right"]),
            ("left", &["prepare"]),
            ("right", &["prepare"]),
            ("prepare", &[]),
        ]);

        let order: Vec<&str> = g.topological_order().collect();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "prepare");
        assert_eq!(order[3], "merge");
        let left = order.iter().position(|n| *n == "left").unwrap();
        let right = order.iter().position(|n| *n == "right").unwrap();
        assert!(left > 0 && right > 0);
    }

    #[test]
    fn tie_break_is_declaration_order() {
        // b and a are both roots; b is declared first and must come first.
        let g = graph(&[("b", &[]), ("a", &[]), ("c", &["a", "b"])]);
        let order: Vec<&str> = g.topological_order().collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn order_is_reproducible() {
        let g = graph(&[
            ("d", &["b", "c"]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("a", &[]),
        ]);
        let first: Vec<&str> = g.topological_order().collect();
        let second: Vec<&str> = g.topological_order().collect();
        assert_eq!(first, second);
        assert_eq!(first, vec!["a", "b", "c", "d"]);
    }
}
