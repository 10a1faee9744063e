//! Dependency tracking for app reloads
//!
//! - [`Graph`] - directed depends-on graph with reverse, closure and DFS topo sort
//! - [`imports`] - module naming and import extraction from source files
//! - [`FileCheck`] - mtime snapshots classifying paths as new, modified or deleted
//! - [`ModuleDeps`] - the module graph kept in step with a [`FileCheck`]
//! - [`LoadingActions`] / [`UpdateActions`] - what one reconciliation pass does, in order

mod actions;
mod file_check;
mod graph;
pub mod imports;
mod modules;

pub use actions::{LoadingActions, UpdateActions, UpdateMode};
pub use file_check::{collect_files, FileCheck};
pub use graph::Graph;
pub use modules::ModuleDeps;

use std::path::PathBuf;
use thiserror::Error;

/// Result type for dependency operations
pub type DependencyResult<T> = Result<T, DependencyError>;

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("circular dependency between {cycle:?}")]
    CircularDependency {
        /// Nodes on the cycle, in edge order
        cycle: Vec<String>,
        /// Order established before the cycle was hit
        partial: Vec<String>,
    },

    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not a module file")]
    NotAModule(PathBuf),
}
