use crate::{DependencyError, DependencyResult};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Directed graph where an edge `a -> b` means `a` depends on `b`
///
/// Nodes that only appear as edge targets are still nodes. Ordered maps keep
/// every traversal deterministic, so ties in a sort come out by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Graph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: impl Into<String>) {
        self.edges.entry(node.into()).or_default();
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.edges.entry(from.into()).or_default().insert(to.into());
    }

    /// Replace a node's outgoing edges
    pub fn insert<I, S>(&mut self, node: impl Into<String>, deps: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edges
            .insert(node.into(), deps.into_iter().map(Into::into).collect());
    }

    /// Drop a node's outgoing edges; edges pointing at it remain
    pub fn remove(&mut self, node: &str) -> Option<BTreeSet<String>> {
        self.edges.remove(node)
    }

    pub fn dependencies(&self, node: &str) -> Option<&BTreeSet<String>> {
        self.edges.get(node)
    }

    pub fn has_edges_for(&self, node: &str) -> bool {
        self.edges.contains_key(node)
    }

    /// Every node, whether it has edges or is only depended upon
    pub fn nodes(&self) -> BTreeSet<String> {
        self.edges
            .iter()
            .flat_map(|(node, deps)| std::iter::once(node).chain(deps.iter()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.edges.iter()
    }

    pub fn remove_self_edges(&mut self) {
        for (node, deps) in self.edges.iter_mut() {
            deps.remove(node);
        }
    }

    /// Edge-reversed copy, with every node present as a key
    pub fn reverse(&self) -> Graph {
        let mut reversed: BTreeMap<String, BTreeSet<String>> = self
            .nodes()
            .into_iter()
            .map(|n| (n, BTreeSet::new()))
            .collect();
        for (node, deps) in &self.edges {
            for dep in deps {
                reversed
                    .entry(dep.clone())
                    .or_default()
                    .insert(node.clone());
            }
        }
        Graph { edges: reversed }
    }

    /// Nodes reachable from `start` by following edges
    ///
    /// A start node is only included when a path leads back to it.
    pub fn reachable<'a, I>(&self, start: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut visited = BTreeSet::new();
        let mut stack: Vec<&str> = start.into_iter().collect();
        while let Some(node) = stack.pop() {
            let Some(next) = self.edges.get(node) else {
                continue;
            };
            for n in next {
                if visited.insert(n.clone()) {
                    stack.push(n);
                }
            }
        }
        visited
    }

    /// Everything that depends on any of `items`, directly or not
    pub fn transitive_dependents<'a, I>(&self, items: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.reverse().reachable(items)
    }

    /// Copy restricted to `keep`, dropping edges that leave it
    pub fn subgraph(&self, keep: &BTreeSet<String>) -> Graph {
        let mut edges = BTreeMap::new();
        for node in keep {
            let deps = self
                .edges
                .get(node)
                .map(|deps| deps.intersection(keep).cloned().collect())
                .unwrap_or_default();
            edges.insert(node.clone(), deps);
        }
        Graph { edges }
    }

    /// Order nodes so every node comes after its dependencies
    pub fn topo_sort(&self) -> DependencyResult<Vec<String>> {
        let mut order = Vec::new();
        let mut done = BTreeSet::new();
        let mut path: Vec<String> = Vec::new();

        for node in self.nodes() {
            if !done.contains(&node) {
                self.visit(&node, &mut done, &mut path, &mut order)?;
            }
        }
        Ok(order)
    }

    fn visit(
        &self,
        node: &str,
        done: &mut BTreeSet<String>,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> DependencyResult<()> {
        if let Some(pos) = path.iter().position(|p| p == node) {
            return Err(DependencyError::CircularDependency {
                cycle: path[pos..].to_vec(),
                partial: order.clone(),
            });
        }
        if done.contains(node) {
            return Ok(());
        }

        path.push(node.to_string());
        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                self.visit(dep, done, path, order)?;
            }
        }
        path.pop();

        done.insert(node.to_string());
        order.push(node.to_string());
        Ok(())
    }
}

impl<S: Into<String>, D: IntoIterator<Item = T>, T: Into<String>> FromIterator<(S, D)> for Graph {
    fn from_iter<I: IntoIterator<Item = (S, D)>>(iter: I) -> Self {
        let mut graph = Graph::new();
        for (node, deps) in iter {
            graph.insert(node, deps);
        }
        graph
    }
}
