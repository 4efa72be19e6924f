//! Sync state and its on-disk persistence.
//!
//! Each pair keeps three maps between cycles: the local tree and the remote
//! tree as of the end of the last cycle, and the content hashes recorded for
//! local files. They are written together as one generation under
//! `<db>/state/v<STATE_VERSION>/<pair>/gen-<n>/`; the `CURRENT` file names
//! the generation in force. A save writes a complete new generation and
//! then replaces `CURRENT` atomically, so a crash leaves either the old
//! state or the new one, never a mix.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use vaultsync_common::{Error, Result, SyncPath};

use crate::tree::{FileHashes, LocalTree, RemoteTree, Tree, TreeItem};

/// Layout version of the persisted state.
pub const STATE_VERSION: u32 = 1;

const CURRENT: &str = "CURRENT";
const GENERATION_PREFIX: &str = "gen-";
const PREVIOUS_LOCAL_TREE: &str = "previousLocalTree";
const PREVIOUS_REMOTE_TREE: &str = "previousRemoteTree";
const LOCAL_FILE_HASHES: &str = "localFileHashes";

/// The state carried from one cycle to the next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    pub local: LocalTree,
    pub remote: RemoteTree,
    pub hashes: FileHashes,
}

/// Reads and writes one pair's [`SyncState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(db_path: impl AsRef<Path>, pair_id: &str) -> Self {
        let dir = db_path
            .as_ref()
            .join("state")
            .join(format!("v{}", STATE_VERSION))
            .join(pair_id);
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory of the generation `CURRENT` points at, if any.
    pub fn current_generation(&self) -> Option<PathBuf> {
        read_current(&self.dir).map(|generation| self.dir.join(generation_name(generation)))
    }

    /// Load the persisted state.
    ///
    /// A missing pointer or generation yields an empty state; a map that
    /// fails to decode is logged and starts empty.
    pub async fn load(&self) -> SyncState {
        let dir = self.dir.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            let Some(generation) = read_current(&dir) else {
                return SyncState::default();
            };
            let gen_dir = dir.join(generation_name(generation));
            SyncState {
                local: load_tree(&gen_dir.join(PREVIOUS_LOCAL_TREE)),
                remote: load_tree(&gen_dir.join(PREVIOUS_REMOTE_TREE)),
                hashes: load_map(&gen_dir.join(LOCAL_FILE_HASHES)).unwrap_or_default(),
            }
        })
        .await;

        match loaded {
            Ok(state) => {
                debug!(
                    local = state.local.len(),
                    remote = state.remote.len(),
                    hashes = state.hashes.len(),
                    "Loaded sync state from {:?}",
                    self.dir
                );
                state
            }
            Err(e) => {
                warn!("Loading sync state panicked: {}", e);
                SyncState::default()
            }
        }
    }

    /// Persist `state` as a new generation and switch to it.
    pub async fn save(&self, state: &SyncState) -> Result<()> {
        let dir = self.dir.clone();
        let local = state.local.as_map().clone();
        let remote = state.remote.as_map().clone();
        let hashes = state.hashes.clone();

        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&dir)?;
            let next = read_current(&dir).map_or(1, |generation| generation + 1);
            let gen_dir = dir.join(generation_name(next));

            // Leftover from a save that never switched over.
            if gen_dir.exists() {
                fs::remove_dir_all(&gen_dir)?;
            }
            fs::create_dir(&gen_dir)?;
            write_synced(&gen_dir.join(PREVIOUS_LOCAL_TREE), &local)?;
            write_synced(&gen_dir.join(PREVIOUS_REMOTE_TREE), &remote)?;
            write_synced(&gen_dir.join(LOCAL_FILE_HASHES), &hashes)?;
            sync_dir(&gen_dir)?;

            switch_current(&dir, next)?;
            remove_stale_generations(&dir, next);
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| Error::Persistence(format!("state writer failed: {}", e)))?
        .map_err(|e| match e {
            Error::Persistence(_) => e,
            other => Error::Persistence(other.to_string()),
        })
    }
}

fn generation_name(generation: u64) -> String {
    format!("{}{}", GENERATION_PREFIX, generation)
}

fn read_current(dir: &Path) -> Option<u64> {
    let path = dir.join(CURRENT);
    match fs::read_to_string(&path) {
        Ok(text) => match text.trim().parse() {
            Ok(generation) => Some(generation),
            Err(e) => {
                warn!("Unreadable state pointer {:?}, starting empty: {}", path, e);
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Cannot open {:?}, starting empty: {}", path, e);
            None
        }
    }
}

/// Point `CURRENT` at `generation`: temp file, fsync, rename, fsync.
fn switch_current(dir: &Path, generation: u64) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", CURRENT));
    let mut file = fs::File::create(&tmp)?;
    writeln!(file, "{}", generation)?;
    file.sync_all()?;
    fs::rename(&tmp, dir.join(CURRENT))?;
    sync_dir(dir)
}

fn remove_stale_generations(dir: &Path, keep: u64) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot list {:?} for cleanup: {}", dir, e);
            return;
        }
    };
    let keep = generation_name(keep);
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(GENERATION_PREFIX) && name != keep.as_str() {
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                debug!("Cannot remove stale state {:?}: {}", entry.path(), e);
            }
        }
    }
}

fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

fn load_tree<T>(path: &Path) -> Tree<T>
where
    T: TreeItem + DeserializeOwned,
{
    load_map::<BTreeMap<SyncPath, T>>(path)
        .map(|map| Tree::from_items(map.into_values()))
        .unwrap_or_default()
}

fn load_map<M: DeserializeOwned>(path: &Path) -> Option<M> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Cannot open {:?}, starting empty: {}", path, e);
            return None;
        }
    };
    match bincode_options().deserialize_from(BufReader::new(file)) {
        Ok(map) => Some(map),
        Err(e) => {
            warn!("Corrupt state file {:?}, starting empty: {}", path, e);
            None
        }
    }
}

fn write_synced<M: Serialize>(path: &Path, value: &M) -> Result<()> {
    let file = fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    bincode_options()
        .serialize_into(&mut writer, value)
        .map_err(|e| Error::Persistence(format!("encoding {:?}: {}", path, e)))?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?
        .sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::{local_dir, local_file, p, remote_file};
    use crate::tree::ContentHash;
    use tempfile::TempDir;

    fn sample_state() -> SyncState {
        let mut hashes = FileHashes::new();
        hashes.insert(p("/docs/a.txt"), ContentHash::of_bytes(b"a"));
        SyncState {
            local: LocalTree::from_items(vec![local_dir("/docs", 1), local_file("/docs/a.txt", 2, 10)]),
            remote: RemoteTree::from_items(vec![remote_file("/docs/a.txt", "r1", 10)]),
            hashes,
        }
    }

    #[tokio::test]
    async fn test_cold_start_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path(), "pair");

        assert_eq!(store.load().await, SyncState::default());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path(), "pair");
        let state = sample_state();

        store.save(&state).await.unwrap();
        let loaded = store.load().await;

        assert_eq!(loaded, state);
        assert!(loaded.local.get_by_id(&2).is_some());
        assert_eq!(loaded.remote.get_by_id(&"r1".to_string()).unwrap().path, p("/docs/a.txt"));
        assert!(store.dir().ends_with("state/v1/pair"));
    }

    #[tokio::test]
    async fn test_torn_pointer_temp_file_is_ignored() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path(), "pair");
        let state = sample_state();
        store.save(&state).await.unwrap();

        // A crash mid-switch leaves a partial temp pointer behind.
        fs::write(store.dir().join("CURRENT.tmp"), b"\x01\x02garbage").unwrap();

        assert_eq!(store.load().await, state);
    }

    #[tokio::test]
    async fn test_interrupted_save_keeps_previous_generation() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path(), "pair");
        let before = sample_state();
        store.save(&before).await.unwrap();

        let mut after = sample_state();
        after.local.insert(local_file("/docs/b.txt", 3, 20));

        // The next generation got its first map written, then the process
        // died before the pointer moved.
        let next = store.dir().join(generation_name(2));
        fs::create_dir(&next).unwrap();
        write_synced(&next.join(PREVIOUS_LOCAL_TREE), after.local.as_map()).unwrap();

        assert_eq!(store.load().await, before);

        // The next save replaces the leftover and drops the old generation.
        store.save(&after).await.unwrap();
        assert_eq!(store.load().await, after);
        assert_eq!(store.current_generation(), Some(next));
        assert!(!store.dir().join(generation_name(1)).exists());
    }

    #[tokio::test]
    async fn test_each_save_is_a_new_generation() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path(), "pair");

        store.save(&SyncState::default()).await.unwrap();
        store.save(&sample_state()).await.unwrap();

        assert_eq!(
            store.current_generation(),
            Some(store.dir().join(generation_name(2)))
        );
        let generations: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(GENERATION_PREFIX))
            .collect();
        assert_eq!(generations.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_that_map_empty() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path(), "pair");
        let state = sample_state();
        store.save(&state).await.unwrap();

        let generation = store.current_generation().unwrap();
        fs::write(generation.join(PREVIOUS_REMOTE_TREE), b"\xff").unwrap();
        let loaded = store.load().await;

        assert!(loaded.remote.is_empty());
        assert_eq!(loaded.local, state.local);
        assert_eq!(loaded.hashes, state.hashes);
    }

    #[tokio::test]
    async fn test_garbled_pointer_starts_empty() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path(), "pair");
        store.save(&sample_state()).await.unwrap();

        fs::write(store.dir().join(CURRENT), b"not a number").unwrap();

        assert_eq!(store.load().await, SyncState::default());
    }

    #[tokio::test]
    async fn test_pairs_are_isolated() {
        let temp = TempDir::new().unwrap();
        StateStore::new(temp.path(), "one")
            .save(&sample_state())
            .await
            .unwrap();

        assert!(StateStore::new(temp.path(), "two").load().await.local.is_empty());
    }
}
