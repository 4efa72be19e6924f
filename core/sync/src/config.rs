//! Configuration for the sync engine and its pairs.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use vaultsync_common::{Error, Result};
use vaultsync_storage::{open_store, store_kind, CloudStore};

use crate::delta::{Delta, Side};

/// Which direction changes flow for a pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// Changes flow both ways.
    #[default]
    TwoWay,
    /// Local changes are mirrored to the cloud.
    LocalToCloud,
    /// Like `LocalToCloud`, but nothing is ever deleted in the cloud.
    LocalBackup,
    /// Cloud changes are mirrored locally.
    CloudToLocal,
    /// Like `CloudToLocal`, but nothing is ever deleted locally.
    CloudBackup,
}

impl SyncMode {
    /// Whether a pair in this mode may carry out `delta`.
    pub fn allows(&self, delta: &Delta) -> bool {
        match self {
            SyncMode::TwoWay => true,
            SyncMode::LocalToCloud => delta.side() == Side::Remote,
            SyncMode::LocalBackup => delta.side() == Side::Remote && !delta.is_delete(),
            SyncMode::CloudToLocal => delta.side() == Side::Local,
            SyncMode::CloudBackup => delta.side() == Side::Local && !delta.is_delete(),
        }
    }
}

/// Which [`CloudStore`] backs the pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// One of [`STORE_KINDS`](vaultsync_storage::STORE_KINDS) (`memory`, `dir`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Store-specific settings.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl StoreConfig {
    /// Open the configured store.
    pub fn open(&self) -> Result<Arc<dyn CloudStore>> {
        open_store(&self.kind, &self.config)
    }
}

/// One local directory kept in step with one remote directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairConfig {
    pub id: String,
    pub local_path: PathBuf,
    /// Remote directory, created when missing.
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
    /// Remote directory id; takes precedence over `remote_path`.
    #[serde(default)]
    pub remote_parent_id: Option<String>,
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default)]
    pub paused: bool,
    /// Extra ignore patterns.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Delete for good instead of moving to the trash.
    #[serde(default)]
    pub permanent_deletes: bool,
}

impl PairConfig {
    pub fn new(id: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            local_path: local_path.into(),
            remote_path: default_remote_path(),
            remote_parent_id: None,
            mode: SyncMode::default(),
            paused: false,
            ignore: Vec::new(),
            permanent_deletes: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory holding persisted sync state.
    pub db_path: PathBuf,
    /// Quiet period required after a local change before a cycle starts.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Pause between cycles.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Age after which the cached remote tree is fetched again.
    #[serde(default = "default_remote_refresh_ms")]
    pub remote_refresh_ms: u64,
    /// Retries for transient store failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub store: StoreConfig,
    pub pairs: Vec<PairConfig>,
}

fn default_remote_path() -> String {
    "/".to_string()
}

fn default_debounce_ms() -> u64 {
    5000
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_remote_refresh_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

impl SyncConfig {
    pub fn new(db_path: impl Into<PathBuf>, store: StoreConfig) -> Self {
        Self {
            db_path: db_path.into(),
            debounce_ms: default_debounce_ms(),
            interval_ms: default_interval_ms(),
            remote_refresh_ms: default_remote_refresh_ms(),
            max_retries: default_max_retries(),
            store,
            pairs: Vec::new(),
        }
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&json)
    }

    /// Check that the store type is known and pair ids are present and
    /// unique.
    pub fn validate(&self) -> Result<()> {
        store_kind(&self.store.kind).map_err(|e| Error::InvalidInput(e.to_string()))?;

        let mut seen = HashSet::new();
        for pair in &self.pairs {
            if pair.id.trim().is_empty() {
                return Err(Error::InvalidInput("pair id must not be empty".to_string()));
            }
            if pair.id.contains(['/', '\\']) {
                return Err(Error::InvalidInput(format!(
                    "pair id '{}' must not contain path separators",
                    pair.id
                )));
            }
            if !seen.insert(pair.id.as_str()) {
                return Err(Error::InvalidInput(format!("duplicate pair id '{}'", pair.id)));
            }
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn remote_refresh(&self) -> Duration {
        Duration::from_millis(self.remote_refresh_ms)
    }

    pub fn pair(&self, id: &str) -> Option<&PairConfig> {
        self.pairs.iter().find(|pair| pair.id == id)
    }
}
