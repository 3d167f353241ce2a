//! Deterministic topological ordering of a spec's dependency graph.

use crate::deptypes::DepFlag;
use crate::spec::{AbstractSpec, ConcreteSpec};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologicalSortError {
    #[error("spec has cycles through: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Name-keyed dependency graph. Building one copies the structure out of a
/// spec, so sorting never touches the spec itself.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    root: Option<String>,
    nodes: BTreeSet<String>,
    /// parent -> (child, kinds)
    edges: BTreeMap<String, Vec<(String, DepFlag)>>,
}

fn node_key(spec: &AbstractSpec) -> Option<String> {
    match (spec.name(), spec.abstract_hash()) {
        (Some(name), _) => Some(name.to_owned()),
        (None, Some(hash)) => Some(format!("/{hash}")),
        (None, None) => None,
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl Into<String>) {
        self.nodes.insert(name.into());
    }

    /// Add `parent -> child`. An empty `depflag` matches every filter.
    pub fn add_edge(
        &mut self,
        parent: impl Into<String>,
        child: impl Into<String>,
        depflag: DepFlag,
    ) {
        let (parent, child) = (parent.into(), child.into());
        self.nodes.insert(parent.clone());
        self.nodes.insert(child.clone());
        let children = self.edges.entry(parent).or_default();
        match children.iter_mut().find(|(c, _)| *c == child) {
            Some((_, flag)) => *flag |= depflag,
            None => children.push((child, depflag)),
        }
    }

    pub fn from_abstract(spec: &AbstractSpec) -> Self {
        let mut graph = Self::new();
        graph.root = node_key(spec);
        if let Some(root) = &graph.root {
            graph.nodes.insert(root.clone());
        }
        let mut stack = vec![spec];
        let mut visited = BTreeSet::new();
        while let Some(node) = stack.pop() {
            let parent = node_key(node);
            if let Some(key) = &parent {
                if !visited.insert(key.clone()) {
                    continue;
                }
            }
            for edge in node.dependencies() {
                let Some(child) = node_key(&edge.spec) else {
                    continue;
                };
                match &parent {
                    Some(parent) => graph.add_edge(parent.clone(), child, edge.depflag),
                    // An anonymous node contributes no vertex; its children stand alone.
                    None => graph.add_node(child),
                }
                stack.push(&edge.spec);
            }
        }
        graph
    }

    pub fn from_concrete(spec: &ConcreteSpec) -> Self {
        let mut graph = Self::new();
        graph.root = Some(spec.name().to_owned());
        for node in spec.traverse() {
            graph.add_node(node.name());
            for edge in node.dependencies() {
                graph.add_edge(node.name(), edge.spec.name(), edge.depflag);
            }
        }
        graph
    }

    fn children<'a>(&'a self, node: &str, deptypes: DepFlag) -> impl Iterator<Item = &'a str> {
        self.edges
            .get(node)
            .into_iter()
            .flatten()
            .filter(move |(_, flag)| flag.is_empty() || flag.intersects(deptypes))
            .map(|(child, _)| child.as_str())
    }

    /// Nodes in the subgraph selected by `deptypes`: everything reachable from
    /// the root over matching edges, or every node when there is no root.
    fn selected(&self, deptypes: DepFlag) -> BTreeSet<&str> {
        let Some(root) = &self.root else {
            return self.nodes.iter().map(String::as_str).collect();
        };
        let mut seen = BTreeSet::new();
        let mut stack = vec![root.as_str()];
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend(self.children(node, deptypes));
            }
        }
        seen
    }

    /// Kahn's algorithm over the subgraph selected by `deptypes`, always
    /// taking the lexicographically smallest ready node next.
    ///
    /// The forward order lists every dependency before its dependents;
    /// `reverse` lists dependents first, starting from the root.
    pub fn topological_sort(
        &self,
        deptypes: DepFlag,
        reverse: bool,
    ) -> Result<Vec<String>, TopologicalSortError> {
        let selected = self.selected(deptypes);
        let mut parents: BTreeMap<&str, BTreeSet<&str>> =
            selected.iter().map(|n| (*n, BTreeSet::new())).collect();
        let mut children: BTreeMap<&str, BTreeSet<&str>> =
            selected.iter().map(|n| (*n, BTreeSet::new())).collect();
        for parent in &selected {
            for child in self.children(parent, deptypes) {
                if let Some(set) = parents.get_mut(child) {
                    set.insert(*parent);
                }
                if let Some(set) = children.get_mut(parent) {
                    set.insert(child);
                }
            }
        }

        // Forward order waits on children; reverse order waits on parents.
        let (mut waiting, released_by) = if reverse {
            (parents, children)
        } else {
            (children, parents)
        };

        let mut heap: BinaryHeap<Reverse<&str>> = waiting
            .iter()
            .filter(|(_, pending)| pending.is_empty())
            .map(|(node, _)| Reverse(*node))
            .collect();
        let mut order = Vec::with_capacity(selected.len());
        while let Some(Reverse(node)) = heap.pop() {
            order.push(node.to_owned());
            for next in released_by.get(node).into_iter().flatten() {
                if let Some(pending) = waiting.get_mut(next) {
                    pending.remove(node);
                    if pending.is_empty() {
                        heap.push(Reverse(*next));
                    }
                }
            }
        }

        let stuck: Vec<String> = waiting
            .into_iter()
            .filter(|(_, pending)| !pending.is_empty())
            .map(|(node, _)| node.to_owned())
            .collect();
        if !stuck.is_empty() {
            return Err(TopologicalSortError::Cycle(stuck));
        }
        Ok(order)
    }
}

/// Topologically sort the DAG of `spec` over edges of kinds `deptypes`.
pub fn topological_sort(
    spec: &ConcreteSpec,
    deptypes: DepFlag,
    reverse: bool,
) -> Result<Vec<String>, TopologicalSortError> {
    DependencyGraph::from_concrete(spec).topological_sort(deptypes, reverse)
}
