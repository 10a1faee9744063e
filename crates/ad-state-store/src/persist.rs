//! JSON persistence for namespaces with a writeback policy
//!
//! One file per namespace under `<config_dir>/namespaces/<name>.json`:
//! ```json
//! {
//!   "version": 1,
//!   "key": "mqtt",
//!   "data": { "sensor.x": { ... } }
//! }
//! ```

use ad_core::NamespaceMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Current on-disk format version
pub const STORAGE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported version {found} for namespace file {key} (expected {expected})")]
    VersionMismatch {
        key: String,
        expected: u32,
        found: u32,
    },
}

/// Versioned wrapper around a namespace's entity map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceFile {
    pub version: u32,
    pub key: String,
    pub data: NamespaceMap,
}

/// Reads and writes namespace files in one directory
#[derive(Debug, Clone)]
pub struct NamespaceStorage {
    dir: PathBuf,
}

impl NamespaceStorage {
    /// Storage rooted at `<config_dir>/namespaces`
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: config_dir.as_ref().join("namespaces"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }

    /// Load a namespace; `None` when no file exists yet
    pub async fn load(&self, namespace: &str) -> Result<Option<NamespaceMap>, StorageError> {
        let path = self.file_path(namespace);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await.map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        let file: NamespaceFile =
            serde_json::from_str(&content).map_err(|source| StorageError::Json {
                path: path.clone(),
                source,
            })?;

        if file.version != STORAGE_VERSION {
            return Err(StorageError::VersionMismatch {
                key: file.key,
                expected: STORAGE_VERSION,
                found: file.version,
            });
        }

        debug!(namespace, entities = file.data.len(), "Loaded namespace file");
        Ok(Some(file.data))
    }

    /// Write a namespace atomically (temp file, then rename)
    pub async fn save(&self, namespace: &str, data: &NamespaceMap) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StorageError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.file_path(namespace);
        let temp_path = self.dir.join(format!("{namespace}.json.tmp"));

        let file = NamespaceFile {
            version: STORAGE_VERSION,
            key: namespace.to_string(),
            data: data.clone(),
        };
        let content = serde_json::to_string_pretty(&file).map_err(|source| StorageError::Json {
            path: path.clone(),
            source,
        })?;

        fs::write(&temp_path, &content)
            .await
            .map_err(|source| StorageError::Io {
                path: temp_path.clone(),
                source,
            })?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(namespace, entities = data.len(), "Saved namespace file");
        Ok(())
    }

    pub async fn delete(&self, namespace: &str) -> Result<(), StorageError> {
        let path = self.file_path(namespace);
        if path.exists() {
            fs::remove_file(&path)
                .await
                .map_err(|source| StorageError::Io { path, source })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ad_core::EntityState;
    use indexmap::IndexMap;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let storage = NamespaceStorage::new(dir.path());

        let mut data = NamespaceMap::new();
        let mut attributes = IndexMap::new();
        attributes.insert("unit".to_string(), json!("C"));
        data.insert(
            "sensor.temp".to_string(),
            EntityState::new("sensor.temp".parse().unwrap(), json!(21.5), attributes),
        );

        storage.save("cache", &data).await.unwrap();
        assert!(storage.file_path("cache").exists());
        assert!(!dir.path().join("namespaces/cache.json.tmp").exists());

        let loaded = storage.load("cache").await.unwrap().unwrap();
        assert_eq!(loaded, data);
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let storage = NamespaceStorage::new(dir.path());
        assert!(storage.load("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let storage = NamespaceStorage::new(dir.path());
        std::fs::create_dir_all(storage.dir()).unwrap();
        std::fs::write(
            storage.file_path("old"),
            r#"{"version": 99, "key": "old", "data": {}}"#,
        )
        .unwrap();

        let err = storage.load("old").await.unwrap_err();
        assert!(matches!(err, StorageError::VersionMismatch { found: 99, .. }));
    }
}
