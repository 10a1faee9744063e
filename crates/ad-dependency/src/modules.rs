use crate::imports::{dependency_graph, module_name};
use crate::{DependencyResult, FileCheck, Graph};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Module import graph kept in step with the source files
#[derive(Debug, Clone)]
pub struct ModuleDeps {
    pub files: FileCheck,
    marker: String,
    graph: Graph,
    reversed: Graph,
    names: BTreeMap<PathBuf, String>,
    /// Edges of modules deleted in the last update
    removed: Graph,
    failed: BTreeSet<PathBuf>,
}

impl ModuleDeps {
    pub fn from_paths<I>(paths: I, marker: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut deps = Self {
            files: FileCheck::from_paths(paths),
            marker: marker.into(),
            graph: Graph::new(),
            reversed: Graph::new(),
            names: BTreeMap::new(),
            removed: Graph::new(),
            failed: BTreeSet::new(),
        };
        deps.refresh();
        deps
    }

    /// Rescan with a new file listing and rebuild the graph
    pub fn update<I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        self.files.update(paths);

        let mut removed = Graph::new();
        for path in &self.files.deleted {
            if let Some(name) = self.names.get(path) {
                let deps = self.graph.dependencies(name).cloned().unwrap_or_default();
                removed.insert(name.clone(), deps);
            }
        }
        self.removed = removed;
        self.refresh();
    }

    /// Re-read every tracked file
    pub fn refresh(&mut self) {
        let files: Vec<PathBuf> = self.files.paths().cloned().collect();
        let (graph, failed) = dependency_graph(&files, &self.marker);
        self.names = files
            .iter()
            .filter_map(|p| module_name(p, &self.marker).map(|n| (p.clone(), n)))
            .collect();
        self.reversed = graph.reverse();
        self.graph = graph;
        self.failed = failed;
        debug!(modules = self.graph.len(), failed = self.failed.len(), "Module graph rebuilt");
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn reversed(&self) -> &Graph {
        &self.reversed
    }

    pub fn failed_files(&self) -> &BTreeSet<PathBuf> {
        &self.failed
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Module name of a tracked (or just deleted) file
    pub fn name_of(&self, path: &Path) -> Option<String> {
        self.names
            .get(path)
            .cloned()
            .or_else(|| module_name(path, &self.marker))
    }

    pub fn path_of(&self, module: &str) -> Option<&PathBuf> {
        self.names
            .iter()
            .find_map(|(path, name)| (name == module).then_some(path))
    }

    pub fn contains(&self, module: &str) -> bool {
        self.names.values().any(|n| n == module)
    }

    /// `items` plus every module importing them, directly or not
    pub fn get_dependents<'a, I>(&self, items: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let items: Vec<&str> = items.into_iter().collect();
        let mut all: BTreeSet<String> = items.iter().map(|s| s.to_string()).collect();
        all.extend(self.reversed.reachable(items));
        all
    }

    fn names_for(&self, paths: &BTreeSet<PathBuf>) -> BTreeSet<String> {
        paths.iter().filter_map(|p| self.name_of(p)).collect()
    }

    /// Names of new and modified modules
    pub fn modules_to_import(&self) -> BTreeSet<String> {
        let mut names = self.names_for(&self.files.new);
        names.extend(self.names_for(&self.files.modified));
        names
    }

    pub fn modified_modules(&self) -> BTreeSet<String> {
        self.names_for(&self.files.modified)
    }

    /// Deleted modules, dependencies first
    pub fn modules_to_delete(&self) -> DependencyResult<Vec<String>> {
        let keep = self.removed.iter().map(|(n, _)| n.clone()).collect();
        self.removed.subgraph(&keep).topo_sort()
    }

    /// `modules` and their importers in load order
    pub fn import_order<'a, I>(&self, modules: I) -> DependencyResult<Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let items = self.get_dependents(modules);
        self.graph.subgraph(&items).topo_sort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_tracks_graph_through_updates() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.py");
        let user = dir.path().join("user.py");
        fs::write(&base, "import json\n").unwrap();
        fs::write(&user, "import base\n").unwrap();

        let mut deps = ModuleDeps::from_paths(vec![base.clone(), user.clone()], "__init__.py");
        assert_eq!(
            deps.modules_to_import(),
            BTreeSet::from(["base".to_string(), "user".to_string()])
        );
        assert_eq!(
            deps.get_dependents(["base"]),
            BTreeSet::from(["base".to_string(), "user".to_string()])
        );
        assert_eq!(deps.import_order(["base"]).unwrap(), vec!["base", "user"]);

        fs::remove_file(&user).unwrap();
        deps.update(vec![base.clone()]);
        assert_eq!(deps.modules_to_delete().unwrap(), vec!["user"]);
        assert!(!deps.contains("user"));
        assert_eq!(deps.name_of(&user).as_deref(), Some("user"));
    }
}
