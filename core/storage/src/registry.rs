//! Built-in store kinds, opened by the name a config file uses.

use serde_json::Value;
use std::sync::Arc;

use crate::dir::DirStore;
use crate::memory::MemoryStore;
use crate::provider::CloudStore;
use vaultsync_common::{Error, Result};

/// Opens a store from its JSON settings.
pub type OpenStore = fn(&Value) -> Result<Arc<dyn CloudStore>>;

/// A kind of store sync pairs can be backed by.
pub struct StoreKind {
    /// Name used as `store.type` in the config file.
    pub name: &'static str,
    pub summary: &'static str,
    open: OpenStore,
}

impl StoreKind {
    pub fn open(&self, config: &Value) -> Result<Arc<dyn CloudStore>> {
        (self.open)(config)
    }
}

/// Every store kind this build knows, sorted by name.
pub const STORE_KINDS: &[StoreKind] = &[
    StoreKind {
        name: "dir",
        summary: "sealed chunks and a manifest under {\"path\": \"<dir>\"}",
        open: open_dir,
    },
    StoreKind {
        name: "memory",
        summary: "volatile, for tests and dry runs",
        open: open_memory,
    },
];

/// Look up a store kind by name.
///
/// # Errors
/// - `Error::NotFound` naming the known kinds
pub fn store_kind(name: &str) -> Result<&'static StoreKind> {
    STORE_KINDS
        .iter()
        .find(|kind| kind.name == name)
        .ok_or_else(|| {
            let known: Vec<&str> = STORE_KINDS.iter().map(|kind| kind.name).collect();
            Error::NotFound(format!(
                "Unknown store type '{}' (known: {})",
                name,
                known.join(", ")
            ))
        })
}

/// Open a store of kind `name` with `config`.
pub fn open_store(name: &str, config: &Value) -> Result<Arc<dyn CloudStore>> {
    store_kind(name)?.open(config)
}

fn open_memory(_config: &Value) -> Result<Arc<dyn CloudStore>> {
    Ok(Arc::new(MemoryStore::new()))
}

fn open_dir(config: &Value) -> Result<Arc<dyn CloudStore>> {
    let path = config
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidInput("Dir store requires 'path'".to_string()))?;
    Ok(Arc::new(DirStore::new(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_sorted_and_unique() {
        let names: Vec<&str> = STORE_KINDS.iter().map(|kind| kind.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_unknown_kind_names_the_known_ones() {
        let err = open_store("ftp", &Value::Null).err().unwrap();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(err.to_string().contains("dir, memory"));
    }

    #[test]
    fn test_dir_requires_path() {
        assert!(matches!(
            open_store("dir", &Value::Null),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_open_builtin_stores() {
        let temp = tempfile::TempDir::new().unwrap();

        let dir = open_store("dir", &serde_json::json!({ "path": temp.path() })).unwrap();
        assert_eq!(dir.name(), "dir");

        let memory = store_kind("memory").unwrap().open(&Value::Null).unwrap();
        assert_eq!(memory.name(), "memory");
    }
}
