//! What a reconciliation pass will do
//!
//! Each sort first closes its item set under dependents, then sorts the
//! subgraph spanned by those items. A cycle outside the items therefore
//! never blocks the pass.

use crate::{DependencyResult, Graph, ModuleDeps};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

/// Why the app manager is reconciling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// First pass after startup
    Init,
    /// Periodic pass from the utility loop
    Normal,
    /// A plugin went away; stop the apps using its namespace
    PluginFailed,
    /// A plugin came back; start them again
    PluginRestart,
    /// Shutdown; stop everything
    Terminate,
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateMode::Init => "INIT",
            UpdateMode::Normal => "NORMAL",
            UpdateMode::PluginFailed => "PLUGIN_FAILED",
            UpdateMode::PluginRestart => "PLUGIN_RESTART",
            UpdateMode::Terminate => "TERMINATE",
        })
    }
}

/// Items to start, restart, stop, and those that failed along the way
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadingActions {
    pub init: BTreeSet<String>,
    pub reload: BTreeSet<String>,
    pub term: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}

impl LoadingActions {
    pub fn changes(&self) -> bool {
        !self.init.is_empty() || !self.reload.is_empty() || !self.term.is_empty()
    }

    /// New or reloading, minus failures
    pub fn init_set(&self) -> BTreeSet<String> {
        self.init
            .union(&self.reload)
            .filter(|n| !self.failed.contains(*n))
            .cloned()
            .collect()
    }

    /// Reloading or terminating
    pub fn term_set(&self) -> BTreeSet<String> {
        self.reload.union(&self.term).cloned().collect()
    }

    /// Modules to import, dependencies first
    pub fn import_sort(&self, modules: &ModuleDeps) -> DependencyResult<Vec<String>> {
        let items = self.init_set();
        modules.import_order(items.iter().map(String::as_str))
    }

    /// Apps to start, dependencies first
    ///
    /// Lower `priority` starts earlier. The ordering is expressed as extra
    /// edges, skipped when one would close a cycle; ties keep name order.
    pub fn start_sort(
        &self,
        graph: &Graph,
        priorities: &BTreeMap<String, f64>,
    ) -> DependencyResult<Vec<String>> {
        let base = self.init_set();
        let mut items = base.clone();
        items.extend(graph.transitive_dependents(base.iter().map(String::as_str)));
        items.retain(|n| !self.failed.contains(n));

        let mut augmented = graph.subgraph(&items);
        let reversed = augmented.reverse();
        let priority = |n: &String| priorities.get(n).copied().unwrap_or(50.0);
        for app in &items {
            let dependents = reversed.reachable([app.as_str()]);
            for other in &items {
                if priority(other) < priority(app) {
                    if dependents.contains(other) {
                        warn!(
                            app = %app,
                            dependency = %other,
                            "Applying priority would cause a circular dependency"
                        );
                    } else {
                        augmented.add_edge(app.clone(), other.clone());
                    }
                }
            }
        }
        augmented.topo_sort()
    }

    /// Apps to stop, dependents first
    pub fn term_sort(&self, graph: &Graph) -> DependencyResult<Vec<String>> {
        let base = self.term_set();
        let reversed = graph.reverse();
        let mut items = base.clone();
        items.extend(reversed.reachable(base.iter().map(String::as_str)));
        reversed.subgraph(&items).topo_sort()
    }
}

/// Actions for modules, apps and sequences in one pass
#[derive(Debug, Clone, Default)]
pub struct UpdateActions {
    pub modules: LoadingActions,
    pub apps: LoadingActions,
    pub sequences: LoadingActions,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DependencyError;

    fn apps(edges: &[(&str, &[&str])]) -> Graph {
        edges
            .iter()
            .map(|(n, deps)| (*n, deps.iter().copied()))
            .collect()
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_start_sort_pulls_in_dependents() {
        let graph = apps(&[("hall", &["base"]), ("base", &[]), ("other", &[])]);
        let actions = LoadingActions {
            reload: names(&["base"]),
            ..Default::default()
        };
        assert_eq!(
            actions.start_sort(&graph, &BTreeMap::new()).unwrap(),
            vec!["base", "hall"]
        );
    }

    #[test]
    fn test_start_sort_priority() {
        let graph = apps(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let actions = LoadingActions {
            init: names(&["a", "b", "c"]),
            ..Default::default()
        };
        let priorities = BTreeMap::from([
            ("a".to_string(), 90.0),
            ("b".to_string(), 10.0),
            ("c".to_string(), 50.0),
        ]);
        assert_eq!(actions.start_sort(&graph, &priorities).unwrap(), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_priority_never_overrides_dependency() {
        // low depends on high, so high must start first despite its priority
        let graph = apps(&[("low", &["high"]), ("high", &[])]);
        let actions = LoadingActions {
            init: names(&["low", "high"]),
            ..Default::default()
        };
        let priorities = BTreeMap::from([("low".to_string(), 1.0), ("high".to_string(), 99.0)]);
        assert_eq!(actions.start_sort(&graph, &priorities).unwrap(), vec!["high", "low"]);
    }

    #[test]
    fn test_term_sort_stops_dependents_first() {
        let graph = apps(&[("hall", &["base"]), ("base", &[]), ("other", &[])]);
        let actions = LoadingActions {
            term: names(&["base"]),
            ..Default::default()
        };
        assert_eq!(actions.term_sort(&graph).unwrap(), vec!["hall", "base"]);
    }

    #[test]
    fn test_cycle_elsewhere_does_not_block() {
        let graph = apps(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        let ok = LoadingActions {
            init: names(&["c"]),
            ..Default::default()
        };
        assert_eq!(ok.start_sort(&graph, &BTreeMap::new()).unwrap(), vec!["c"]);

        let cyclic = LoadingActions {
            init: names(&["a", "c"]),
            ..Default::default()
        };
        assert!(matches!(
            cyclic.start_sort(&graph, &BTreeMap::new()),
            Err(DependencyError::CircularDependency { .. })
        ));
    }

    #[test]
    fn test_init_set_excludes_failed() {
        let actions = LoadingActions {
            init: names(&["a"]),
            reload: names(&["b"]),
            failed: names(&["b"]),
            ..Default::default()
        };
        assert_eq!(actions.init_set(), names(&["a"]));
        assert!(actions.changes());
    }
}
