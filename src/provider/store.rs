//! JSON file persistence for registry records.
//!
//! `JsonStore<T>` owns one file and knows nothing about the record type
//! beyond serde. Loading never fails: a missing file is created empty, a blank
//! or corrupt file is logged and treated as empty. Saving writes pretty JSON to
//! a sibling temp file and renames it over the target.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Failure to persist a record.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to serialize {label}: {reason}")]
    Serialize { label: &'static str, reason: String },

    #[error("failed to write {path}: {reason}")]
    Write { path: String, reason: String },
}

/// A single JSON-backed record of type `T`.
pub struct JsonStore<T> {
    path: PathBuf,
    label: &'static str,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// `label` names the record in log output (e.g. "provider configs").
    pub fn new(path: impl Into<PathBuf>, label: &'static str) -> Self {
        Self {
            path: path.into(),
            label,
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record, falling back to `T::default()` on any problem.
    pub fn load(&self) -> T {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    path = %self.path.display(),
                    record = self.label,
                    "store file missing, creating empty record"
                );
                let empty = T::default();
                if let Err(e) = self.save(&empty) {
                    tracing::error!(error = %e, record = self.label, "failed to create store file");
                }
                return empty;
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %self.path.display(),
                    record = self.label,
                    "failed to read store file, starting empty"
                );
                return T::default();
            }
        };

        if content.trim().is_empty() {
            tracing::info!(record = self.label, "store file is empty");
            return T::default();
        }

        match serde_json::from_str::<T>(&content) {
            Ok(record) => {
                tracing::debug!(path = %self.path.display(), record = self.label, "loaded store");
                record
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %self.path.display(),
                    record = self.label,
                    "store file is corrupt, starting empty"
                );
                T::default()
            }
        }
    }

    /// Persist the record (temp file + rename).
    pub fn save(&self, record: &T) -> Result<(), StoreError> {
        let content =
            serde_json::to_string_pretty(record).map_err(|e| StoreError::Serialize {
                label: self.label,
                reason: e.to_string(),
            })?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.write_error(e))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content).map_err(|e| self.write_error(e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| self.write_error(e))?;

        tracing::debug!(path = %self.path.display(), record = self.label, "saved store");
        Ok(())
    }

    fn write_error(&self, e: std::io::Error) -> StoreError {
        StoreError::Write {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    type Mappings = BTreeMap<String, String>;

    fn store_in(dir: &Path) -> JsonStore<Mappings> {
        JsonStore::new(dir.join("tool_mappings.json"), "tool routes")
    }

    #[test]
    fn test_missing_file_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let loaded = store.load();
        assert!(loaded.is_empty());

        let on_disk = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(on_disk.trim(), "{}");
    }

    #[test]
    fn test_blank_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        std::fs::write(store.path(), "  \n").unwrap();

        assert!(store.load().is_empty());
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        std::fs::write(store.path(), "{ not json").unwrap();

        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let mut routes = Mappings::new();
        routes.insert("get_weather".into(), "weather".into());
        store.save(&routes).unwrap();

        assert_eq!(store.load(), routes);
        assert!(!dir.path().join("tool_mappings.json.tmp").exists());
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<Mappings> =
            JsonStore::new(dir.path().join("nested/config/routes.json"), "tool routes");

        store.save(&Mappings::new()).unwrap();
        assert!(store.path().exists());
    }
}
