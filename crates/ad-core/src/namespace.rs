//! Namespace vocabulary

use serde::{Deserialize, Serialize};

/// Namespace of the primary backend
pub const DEFAULT: &str = "default";

/// Runtime-internal namespace for lifecycle events and diagnostic entities
pub const ADMIN: &str = "admin";

/// Namespace holding sequence entities
pub const RULES: &str = "rules";

/// Pseudo-namespace: callbacks registered here match every namespace, and
/// events published here reach callbacks of every namespace
pub const GLOBAL: &str = "global";

/// How a namespace's persistent store is synchronised to disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Writeback {
    /// Flush on every change
    #[default]
    Safe,
    /// Flush on the utility loop's periodic checkpoint
    Hybrid,
    /// Memory only
    None,
}

impl Writeback {
    pub fn is_persistent(self) -> bool {
        !matches!(self, Writeback::None)
    }
}
