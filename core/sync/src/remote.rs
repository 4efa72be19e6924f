//! Remote adapter over a [`CloudStore`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use vaultsync_common::{Error, ItemKind, Result, SyncPath};
use vaultsync_storage::{CloudNode, CloudStore};

use crate::adapter::{RemoteAdapter, Transferred};
use crate::ignore::IgnoreRules;
use crate::local::{fs_path, local_item, DOWNLOAD_STAGING_DIR};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::signal::ChangeSignal;
use crate::tree::{ContentHash, LocalItem, RemoteFileMeta, RemoteItem, RemoteTree};

/// Default age after which the cached remote listing is refetched.
pub const DEFAULT_REMOTE_REFRESH: Duration = Duration::from_secs(30);

struct CachedTree {
    tree: RemoteTree,
    fetched_at: Instant,
}

fn remote_item(path: SyncPath, node: &CloudNode) -> RemoteItem {
    RemoteItem {
        path,
        kind: node.kind,
        id: node.id.clone(),
        size: node.size,
        last_modified: node.modified,
        file: node.file.as_ref().map(|meta| RemoteFileMeta {
            key: meta.key.clone(),
            chunks: meta.chunks,
            region: meta.region.clone(),
            bucket: meta.bucket.clone(),
        }),
    }
}

/// Turn a flat store listing into a tree rooted at `root_id`.
///
/// Nodes whose parent chain does not reach `root_id` are dropped. When two
/// nodes resolve to the same path the one listed first wins, and the
/// loser's subtree is dropped with it.
fn build_tree(root_id: &str, nodes: &[CloudNode]) -> RemoteTree {
    let by_id: HashMap<&str, &CloudNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    let depth_of = |node: &CloudNode| -> Option<usize> {
        let mut depth = 1;
        let mut parent = node.parent.as_str();
        while parent != root_id {
            parent = by_id.get(parent)?.parent.as_str();
            depth += 1;
            if depth > nodes.len() {
                return None;
            }
        }
        Some(depth)
    };

    let mut ordered: Vec<(usize, &CloudNode)> = nodes
        .iter()
        .filter_map(|node| depth_of(node).map(|depth| (depth, node)))
        .collect();
    // Stable: listing order is kept among nodes of equal depth.
    ordered.sort_by_key(|(depth, _)| *depth);

    let mut dirs: HashMap<&str, SyncPath> = HashMap::new();
    let mut tree = RemoteTree::new();
    for (_, node) in ordered {
        let parent_path = if node.parent == root_id {
            SyncPath::root()
        } else {
            match dirs.get(node.parent.as_str()) {
                Some(parent) => parent.clone(),
                None => continue,
            }
        };
        let path = match parent_path.join(&node.name) {
            Ok(path) => path,
            Err(e) => {
                warn!("Skipping remote item {} named {:?}: {}", node.id, node.name, e);
                continue;
            }
        };
        if tree.contains(&path) {
            debug!("Duplicate remote path {}, keeping the first", path);
            continue;
        }
        if node.kind.is_dir() {
            dirs.insert(&node.id, path.clone());
        }
        tree.insert(remote_item(path, node));
    }
    tree
}

/// The cloud side of a pair.
///
/// Keeps the last listing in memory and patches it after every mutation it
/// performs, so a fresh listing is only needed once it is older than the
/// refresh window.
pub struct RemoteFs {
    store: Arc<dyn CloudStore>,
    root_id: String,
    local_root: PathBuf,
    signal: Arc<ChangeSignal>,
    ignore: Arc<IgnoreRules>,
    retry: RetryExecutor,
    refresh: Duration,
    cache: Mutex<Option<CachedTree>>,
}

impl RemoteFs {
    /// `local_root` and `signal` belong to the local side: downloads are
    /// written there.
    pub fn new(
        store: Arc<dyn CloudStore>,
        root_id: impl Into<String>,
        local_root: impl AsRef<Path>,
        signal: Arc<ChangeSignal>,
        ignore: Arc<IgnoreRules>,
    ) -> Self {
        Self {
            store,
            root_id: root_id.into(),
            local_root: local_root.as_ref().to_path_buf(),
            signal,
            ignore,
            retry: RetryExecutor::default(),
            refresh: DEFAULT_REMOTE_REFRESH,
            cache: Mutex::new(None),
        }
    }

    pub fn with_refresh(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryExecutor::new(config);
        self
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Find the id of `remote_path`, creating missing directories.
    pub async fn resolve_root(store: &dyn CloudStore, remote_path: &str) -> Result<String> {
        let path = SyncPath::parse(remote_path)?;
        let mut id = store.root_id().to_string();
        for name in path.components() {
            id = store.create_dir(&id, name).await?.id;
        }
        Ok(id)
    }

    async fn fetch(&self) -> Result<RemoteTree> {
        let nodes = self
            .retry
            .execute(|| self.store.list_tree(&self.root_id))
            .await?;
        let tree = build_tree(&self.root_id, &nodes);
        debug!("Fetched {} remote items ({} listed)", tree.len(), nodes.len());
        Ok(tree)
    }

    /// The cache, populated if it is still empty.
    async fn cached(&self) -> Result<MutexGuard<'_, Option<CachedTree>>> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            let tree = self.fetch().await?;
            *cache = Some(CachedTree {
                tree,
                fetched_at: Instant::now(),
            });
        }
        Ok(cache)
    }

    async fn lookup(&self, path: &SyncPath) -> Result<RemoteItem> {
        let cache = self.cached().await?;
        cache
            .as_ref()
            .and_then(|cached| cached.tree.get(path))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No remote item at {}", path)))
    }

    async fn dir_id(&self, path: &SyncPath) -> Result<String> {
        if path.is_root() {
            return Ok(self.root_id.clone());
        }
        let item = self.lookup(path).await?;
        if !item.kind.is_dir() {
            return Err(Error::InvalidInput(format!("Not a directory: {}", path)));
        }
        Ok(item.id)
    }

    async fn patch(&self, update: impl FnOnce(&mut RemoteTree)) {
        if let Some(cached) = self.cache.lock().await.as_mut() {
            update(&mut cached.tree);
        }
    }

    fn split(path: &SyncPath) -> Result<(SyncPath, &str)> {
        match (path.parent(), path.name()) {
            (Some(parent), Some(name)) => Ok((parent, name)),
            _ => Err(Error::InvalidInput("The sync root cannot be changed".to_string())),
        }
    }

    /// Store `data` at `path`, replacing any file already there.
    pub async fn put_file(&self, path: &SyncPath, data: Vec<u8>, modified: i64) -> Result<RemoteItem> {
        let (parent, name) = Self::split(path)?;
        let parent_id = self.dir_id(&parent).await?;
        let size = data.len();
        let node = self
            .retry
            .execute(|| self.store.upload(&parent_id, name, data.clone(), modified))
            .await?;

        let item = remote_item(path.clone(), &node);
        let cached = item.clone();
        self.patch(move |tree| {
            tree.insert(cached);
        })
        .await;
        info!(path = %path, size, "Uploaded file");
        Ok(item)
    }
}

#[async_trait]
impl RemoteAdapter for RemoteFs {
    async fn scan(&self, force: bool) -> Result<RemoteTree> {
        let mut cache = self.cache.lock().await;
        let fresh = matches!(
            cache.as_ref(),
            Some(cached) if !force && cached.fetched_at.elapsed() < self.refresh
        );
        if !fresh {
            let tree = self
                .fetch()
                .await
                .map_err(|e| Error::Scan(format!("Remote listing failed: {}", e)))?;
            *cache = Some(CachedTree {
                tree,
                fetched_at: Instant::now(),
            });
        } else {
            debug!("Reusing cached remote listing");
        }

        let mut tree = cache
            .as_ref()
            .map(|cached| cached.tree.clone())
            .unwrap_or_default();
        tree.retain(|path| !self.ignore.is_ignored(path));
        Ok(tree)
    }

    async fn mkdir(&self, path: &SyncPath) -> Result<RemoteItem> {
        let (parent, name) = Self::split(path)?;
        let parent_id = self.dir_id(&parent).await?;
        let node = self
            .retry
            .execute(|| self.store.create_dir(&parent_id, name))
            .await?;

        let item = remote_item(path.clone(), &node);
        let cached = item.clone();
        self.patch(move |tree| {
            tree.insert(cached);
        })
        .await;
        info!(path = %path, "Created remote directory");
        Ok(item)
    }

    async fn unlink(&self, path: &SyncPath, kind: ItemKind, permanent: bool) -> Result<()> {
        let item = match self.lookup(path).await {
            Ok(item) => item,
            Err(e) if e.is_not_found() => {
                debug!("{} already gone remotely", path);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if item.kind != kind {
            return Err(Error::InvalidInput(format!(
                "Expected {} at {}, found {}",
                kind, path, item.kind
            )));
        }

        let result = if permanent {
            self.retry.execute(|| self.store.delete(&item.id)).await
        } else {
            self.retry.execute(|| self.store.trash(&item.id)).await
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("{} already gone remotely", path),
            Err(e) => return Err(e),
        }

        self.patch(|tree| {
            tree.remove_subtree(path);
        })
        .await;
        info!(path = %path, permanent, "Deleted remote item");
        Ok(())
    }

    async fn rename(&self, from: &SyncPath, to: &SyncPath) -> Result<()> {
        let item = self.lookup(from).await?;
        let (from_parent, from_name) = Self::split(from)?;
        let (to_parent, to_name) = Self::split(to)?;

        if from_name != to_name {
            self.retry
                .execute(|| self.store.rename(&item.id, to_name))
                .await?;
        }
        if from_parent != to_parent {
            let parent_id = self.dir_id(&to_parent).await?;
            self.retry
                .execute(|| self.store.move_to(&item.id, &parent_id))
                .await?;
        }

        self.patch(|tree| tree.rename_subtree(from, to)).await;
        info!(from = %from, to = %to, "Renamed remote item");
        Ok(())
    }

    async fn download(&self, path: &SyncPath) -> Result<Transferred<LocalItem>> {
        let item = self.lookup(path).await?;
        if item.kind.is_dir() {
            return Err(Error::InvalidInput(format!("Cannot download directory {}", path)));
        }
        let data = self.retry.execute(|| self.store.download(&item.id)).await?;
        let hash = ContentHash::of_bytes(&data);

        let staging = self.local_root.join(DOWNLOAD_STAGING_DIR);
        fs::create_dir_all(&staging).await?;
        let tmp = staging.join(Uuid::new_v4().to_string());
        let modified = UNIX_EPOCH + Duration::from_millis(item.last_modified.max(0) as u64);
        let size = data.len();

        let tmp_path = tmp.clone();
        tokio::task::spawn_blocking(move || write_with_mtime(&tmp_path, &data, modified))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        let target = fs_path(&self.local_root, path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        self.signal.touch();

        let meta = fs::symlink_metadata(&target).await?;
        info!(path = %path, size, "Downloaded file");
        Ok(Transferred {
            item: local_item(path.clone(), &meta),
            hash,
        })
    }
}

fn write_with_mtime(path: &Path, data: &[u8], modified: SystemTime) -> Result<()> {
    use std::io::Write;

    let mut file = std::fs::File::create(path)?;
    file.write_all(data)?;
    file.set_modified(modified)?;
    file.sync_all()?;
    Ok(())
}
