//! Module naming and import extraction
//!
//! A module's full name is its file stem prefixed by every enclosing
//! directory that holds a package marker file. Imports are read from
//! unindented `import a, b.c` and `from .pkg import x` lines.

use crate::{DependencyError, DependencyResult, Graph};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

/// One import statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Import {
    /// `import a.b, c`
    Absolute(Vec<String>),
    /// `from [dots]module import ...`
    From { level: usize, module: Option<String> },
}

fn import_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^import\s+(.+)$").ok())
        .as_ref()
}

fn from_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^from\s+(\.*)([\w.]*)\s+import\b").ok())
        .as_ref()
}

/// Full dotted name of a module file
pub fn module_name(path: &Path, marker: &str) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let mut parts = Vec::new();
    if file_name != marker {
        parts.push(path.file_stem()?.to_str()?.to_string());
    }
    for parent in path.ancestors().skip(1) {
        if parent.join(marker).exists() {
            match parent.file_name().and_then(|n| n.to_str()) {
                Some(name) => parts.push(name.to_string()),
                None => break,
            }
        } else {
            break;
        }
    }
    parts.reverse();
    (!parts.is_empty()).then(|| parts.join("."))
}

/// Import statements at the top level of a source file
pub fn parse_imports(source: &str) -> Vec<Import> {
    let mut imports = Vec::new();
    for line in source.lines() {
        let line = line.split('#').next().unwrap_or("").trim_end();
        if let Some(caps) = from_re().and_then(|re| re.captures(line)) {
            let module = caps
                .get(2)
                .map(|m| m.as_str())
                .filter(|m| !m.is_empty())
                .map(str::to_string);
            imports.push(Import::From {
                level: caps[1].len(),
                module,
            });
        } else if let Some(caps) = import_re().and_then(|re| re.captures(line)) {
            let names = caps[1]
                .split(',')
                .filter_map(|part| part.split_whitespace().next())
                .map(|name| name.trim_matches(|c| c == '(' || c == ')').to_string())
                .filter(|name| !name.is_empty())
                .collect();
            imports.push(Import::Absolute(names));
        }
    }
    imports
}

/// Absolute module named by a relative import inside `full_name`
///
/// Package marker files count as the package itself, so they drop one
/// level less.
pub fn resolve_relative(
    full_name: &str,
    is_package: bool,
    level: usize,
    module: Option<&str>,
) -> String {
    let mut parts: Vec<&str> = full_name.split('.').collect();
    let drop = if is_package { level.saturating_sub(1) } else { level };
    for _ in 0..drop {
        parts.pop();
    }
    if let Some(module) = module {
        parts.push(module);
    }
    parts.join(".")
}

/// Modules a source file imports
pub fn file_dependencies(path: &Path, marker: &str) -> DependencyResult<BTreeSet<String>> {
    let source = std::fs::read_to_string(path).map_err(|source| DependencyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let full_name =
        module_name(path, marker).ok_or_else(|| DependencyError::NotAModule(path.to_path_buf()))?;
    let is_package = path.file_name().and_then(|n| n.to_str()) == Some(marker);

    let mut deps = BTreeSet::new();
    for import in parse_imports(&source) {
        match import {
            Import::Absolute(names) => deps.extend(names),
            Import::From { level: 0, module } => deps.extend(module),
            Import::From { level, module } => {
                deps.insert(resolve_relative(
                    &full_name,
                    is_package,
                    level,
                    module.as_deref(),
                ));
            }
        }
    }
    Ok(deps)
}

/// Module graph for a set of files, plus the files that could not be read
pub fn dependency_graph<'a, I>(files: I, marker: &str) -> (Graph, BTreeSet<PathBuf>)
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    let mut graph = Graph::new();
    let mut failed = BTreeSet::new();
    for file in files {
        let Some(name) = module_name(file, marker) else {
            failed.insert(file.clone());
            continue;
        };
        match file_dependencies(file, marker) {
            Ok(deps) => graph.insert(name, deps),
            Err(e) => {
                warn!(path = %file.display(), error = %e, "Unable to read module imports");
                failed.insert(file.clone());
            }
        }
    }
    graph.remove_self_edges();
    (graph, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_imports() {
        let source = "\
import os, sys as system
from . import helpers
from ..shared.util import thing  # comment
from collections import OrderedDict
    import indented_is_ignored
def f():
    pass
";
        assert_eq!(
            parse_imports(source),
            vec![
                Import::Absolute(vec!["os".into(), "sys".into()]),
                Import::From { level: 1, module: None },
                Import::From {
                    level: 2,
                    module: Some("shared.util".into())
                },
                Import::From {
                    level: 0,
                    module: Some("collections".into())
                },
            ]
        );
    }

    #[test]
    fn test_resolve_relative() {
        assert_eq!(resolve_relative("pkg.sub.mod", false, 1, Some("x")), "pkg.sub.x");
        assert_eq!(resolve_relative("pkg.sub.mod", false, 2, None), "pkg");
        // Inside pkg/sub/__init__.py, one dot is the package itself
        assert_eq!(resolve_relative("pkg.sub", true, 1, Some("x")), "pkg.sub.x");
    }

    #[test]
    fn test_module_names_follow_package_markers() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("pkg");
        fs::create_dir_all(pkg.join("sub")).unwrap();
        fs::write(pkg.join("__init__.py"), "").unwrap();
        fs::write(pkg.join("sub").join("__init__.py"), "").unwrap();
        fs::write(pkg.join("sub").join("lights.py"), "from .. import common\n").unwrap();
        fs::write(dir.path().join("plain.py"), "import pkg.sub.lights\nimport plain\n").unwrap();

        let lights = pkg.join("sub").join("lights.py");
        assert_eq!(module_name(&lights, "__init__.py").as_deref(), Some("pkg.sub.lights"));
        assert_eq!(
            module_name(&pkg.join("__init__.py"), "__init__.py").as_deref(),
            Some("pkg")
        );

        let files = vec![lights, dir.path().join("plain.py")];
        let (graph, failed) = dependency_graph(&files, "__init__.py");
        assert!(failed.is_empty());
        assert_eq!(
            graph.dependencies("pkg.sub.lights").unwrap(),
            &BTreeSet::from(["pkg".to_string()])
        );
        // Self import dropped
        assert_eq!(
            graph.dependencies("plain").unwrap(),
            &BTreeSet::from(["pkg.sub.lights".to_string()])
        );
    }
}
