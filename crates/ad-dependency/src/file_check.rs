//! File change tracking by modification time

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Per-path mtimes plus what changed in the last [`FileCheck::update`]
///
/// A fresh check built with [`FileCheck::from_paths`] reports every path
/// as new.
#[derive(Debug, Clone, Default)]
pub struct FileCheck {
    mtimes: BTreeMap<PathBuf, SystemTime>,
    pub new: BTreeSet<PathBuf>,
    pub modified: BTreeSet<PathBuf>,
    pub deleted: BTreeSet<PathBuf>,
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl FileCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_paths<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mtimes: BTreeMap<PathBuf, SystemTime> = paths
            .into_iter()
            .filter_map(|p| mtime(&p).map(|t| (p, t)))
            .collect();
        let new = mtimes.keys().cloned().collect();
        Self {
            mtimes,
            new,
            modified: BTreeSet::new(),
            deleted: BTreeSet::new(),
        }
    }

    /// Diff against a fresh listing of files
    pub fn update<I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let current: BTreeSet<PathBuf> = paths.into_iter().collect();
        self.new.clear();
        self.modified.clear();
        self.deleted.clear();

        let gone: Vec<PathBuf> = self
            .mtimes
            .keys()
            .filter(|p| !current.contains(*p))
            .cloned()
            .collect();
        for path in gone {
            self.mtimes.remove(&path);
            self.deleted.insert(path);
        }

        for path in current {
            let Some(modified) = mtime(&path) else {
                warn!(path = %path.display(), "Unable to stat file");
                continue;
            };
            match self.mtimes.insert(path.clone(), modified) {
                Some(previous) if modified > previous => {
                    self.modified.insert(path);
                }
                Some(_) => {}
                None => {
                    self.new.insert(path);
                }
            }
        }
    }

    /// Mark a path as modified so the next pass reloads it
    pub fn touch(&mut self, path: &Path) {
        if self.mtimes.contains_key(path) {
            self.modified.insert(path.to_path_buf());
        }
    }

    pub fn there_were_changes(&self) -> bool {
        !self.new.is_empty() || !self.modified.is_empty() || !self.deleted.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.mtimes.keys()
    }

    pub fn mtime(&self, path: &Path) -> Option<SystemTime> {
        self.mtimes.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.mtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mtimes.is_empty()
    }

    pub fn log_changes(&self, what: &str, base: &Path) {
        let rel = |p: &PathBuf| p.strip_prefix(base).unwrap_or(p).display().to_string();
        for path in &self.new {
            debug!(path = %rel(path), "New {what} file");
        }
        for path in &self.modified {
            debug!(path = %rel(path), "Detected {what} file modification");
        }
        for path in &self.deleted {
            debug!(path = %rel(path), "Detected {what} file deletion");
        }
    }
}

/// Files under `root` with extension `ext`
///
/// Hidden directories, directories with a `.` in their name and anything
/// listed in `exclude_dirs` are skipped.
pub fn collect_files(root: &Path, ext: &str, exclude_dirs: &[String]) -> BTreeSet<PathBuf> {
    let mut found = BTreeSet::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Unable to read directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_dir() {
                if !name.contains('.') && !exclude_dirs.iter().any(|d| d == name) {
                    pending.push(path);
                }
            } else if !name.starts_with('.')
                && path.extension().and_then(|e| e.to_str()) == Some(ext)
            {
                found.insert(path);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn bump(path: &Path) {
        let later = SystemTime::now() + Duration::from_secs(5);
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(later).unwrap();
    }

    #[test]
    fn test_classifies_new_modified_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.py");
        let b = dir.path().join("b.py");
        fs::write(&a, "").unwrap();
        fs::write(&b, "").unwrap();

        let mut check = FileCheck::from_paths(vec![a.clone(), b.clone()]);
        assert_eq!(check.new.len(), 2);

        check.update(vec![a.clone(), b.clone()]);
        assert!(!check.there_were_changes());

        bump(&a);
        fs::remove_file(&b).unwrap();
        let c = dir.path().join("c.py");
        fs::write(&c, "").unwrap();
        check.update(vec![a.clone(), c.clone()]);

        assert_eq!(check.modified, BTreeSet::from([a]));
        assert_eq!(check.deleted, BTreeSet::from([b]));
        assert_eq!(check.new, BTreeSet::from([c]));
    }

    #[test]
    fn test_collect_files_skips_excluded() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("apps/lights")).unwrap();
        fs::create_dir_all(dir.path().join("apps/skip")).unwrap();
        fs::create_dir_all(dir.path().join("apps/pkg.egg-info")).unwrap();
        fs::write(dir.path().join("apps/lights/hall.py"), "").unwrap();
        fs::write(dir.path().join("apps/skip/old.py"), "").unwrap();
        fs::write(dir.path().join("apps/pkg.egg-info/x.py"), "").unwrap();
        fs::write(dir.path().join("apps/lights/hall.yaml"), "").unwrap();

        let files = collect_files(&dir.path().join("apps"), "py", &["skip".to_string()]);
        assert_eq!(
            files,
            BTreeSet::from([dir.path().join("apps/lights/hall.py")])
        );
    }
}
