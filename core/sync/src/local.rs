//! Local disk adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha512};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vaultsync_common::{Error, ItemKind, Result, SyncPath};

use crate::adapter::{ContentHasher, LocalAdapter, Transferred};
use crate::ignore::IgnoreRules;
use crate::remote::RemoteFs;
use crate::signal::ChangeSignal;
use crate::tree::{ContentHash, LocalItem, LocalTree, RemoteItem};

/// Where non-permanent local deletions end up, relative to the root.
pub const LOCAL_TRASH_DIR: &str = ".vaultsync.trash.local";

/// Where downloads are staged before being moved into place.
pub const DOWNLOAD_STAGING_DIR: &str = ".vaultsync.tmp";

pub(crate) fn system_time_ms(time: SystemTime) -> i64 {
    DateTime::<Utc>::from(time).timestamp_millis()
}

pub(crate) fn fs_path(root: &Path, path: &SyncPath) -> PathBuf {
    let mut fs_path = root.to_path_buf();
    for component in path.components() {
        fs_path.push(component);
    }
    fs_path
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata, _path: &SyncPath) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

/// Without inodes, identity degrades to the path itself.
#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata, path: &SyncPath) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

/// Build a [`LocalItem`] from filesystem metadata.
pub(crate) fn local_item(path: SyncPath, meta: &std::fs::Metadata) -> LocalItem {
    let kind = if meta.is_dir() {
        ItemKind::Directory
    } else {
        ItemKind::File
    };
    LocalItem {
        inode: inode_of(meta, &path),
        path,
        kind,
        size: if kind.is_dir() { 0 } else { meta.len() },
        last_modified: meta.modified().map(system_time_ms).unwrap_or(0),
        creation_time: meta.created().map(system_time_ms).unwrap_or(0),
    }
}

fn scan_error(path: &Path, err: std::io::Error) -> Error {
    Error::Scan(format!("Cannot read {:?}: {}", path, err))
}

fn scan_blocking(root: &Path, ignore: &IgnoreRules) -> Result<LocalTree> {
    let mut tree = LocalTree::new();
    let mut pending = vec![SyncPath::root()];

    while let Some(dir) = pending.pop() {
        let dir_path = fs_path(root, &dir);
        let entries = match std::fs::read_dir(&dir_path) {
            Ok(entries) => entries,
            // Vanished since its parent was listed.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !dir.is_root() => continue,
            Err(e) => return Err(scan_error(&dir_path, e)),
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(scan_error(&dir_path, e)),
            };
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                warn!("Skipping non UTF-8 name {:?} in {:?}", file_name, dir_path);
                continue;
            };
            if dir.is_root() && (name == LOCAL_TRASH_DIR || name == DOWNLOAD_STAGING_DIR) {
                continue;
            }
            let path = match dir.join(name) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping {:?} in {:?}: {}", name, dir_path, e);
                    continue;
                }
            };
            if ignore.is_ignored(&path) {
                continue;
            }

            let meta = match std::fs::symlink_metadata(entry.path()) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(scan_error(&entry.path(), e)),
            };
            let file_type = meta.file_type();
            if file_type.is_dir() {
                pending.push(path.clone());
            } else if !file_type.is_file() {
                debug!("Skipping special file {}", path);
                continue;
            }
            tree.insert(local_item(path, &meta));
        }
    }

    Ok(tree)
}

/// The local disk side of a pair.
pub struct LocalFs {
    root: PathBuf,
    signal: Arc<ChangeSignal>,
    ignore: Arc<IgnoreRules>,
    remote: Arc<RemoteFs>,
    last_scan: Mutex<Option<(u64, LocalTree)>>,
}

impl LocalFs {
    /// `remote` receives the bytes of uploads.
    pub fn new(
        root: impl AsRef<Path>,
        signal: Arc<ChangeSignal>,
        ignore: Arc<IgnoreRules>,
        remote: Arc<RemoteFs>,
    ) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            signal,
            ignore,
            remote,
            last_scan: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn fs_path(&self, path: &SyncPath) -> PathBuf {
        fs_path(&self.root, path)
    }
}

#[async_trait]
impl ContentHasher for LocalFs {
    async fn hash(&self, path: &SyncPath) -> Result<ContentHash> {
        let fs_path = self.fs_path(path);
        tokio::task::spawn_blocking(move || {
            let mut file = std::fs::File::open(&fs_path)?;
            let mut hasher = Sha512::new();
            std::io::copy(&mut file, &mut hasher)?;
            Ok(ContentHash::from_digest(hasher))
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

#[async_trait]
impl LocalAdapter for LocalFs {
    async fn scan(&self) -> Result<LocalTree> {
        let generation = self.signal.generation();
        let mut last_scan = self.last_scan.lock().await;
        if let Some((seen, tree)) = last_scan.as_ref() {
            if *seen == generation {
                debug!("No local change since last scan");
                return Ok(tree.clone());
            }
        }

        let root = self.root.clone();
        let ignore = self.ignore.clone();
        let tree = tokio::task::spawn_blocking(move || scan_blocking(&root, &ignore))
            .await
            .map_err(|e| Error::Scan(format!("Scan task failed: {}", e)))??;

        debug!("Scanned {} local items under {:?}", tree.len(), self.root);
        *last_scan = Some((generation, tree.clone()));
        Ok(tree)
    }

    async fn mkdir(&self, path: &SyncPath) -> Result<LocalItem> {
        let target = self.fs_path(path);
        fs::create_dir_all(&target).await?;
        self.signal.touch();

        let meta = fs::symlink_metadata(&target).await?;
        Ok(local_item(path.clone(), &meta))
    }

    async fn unlink(&self, path: &SyncPath, permanent: bool) -> Result<()> {
        let target = self.fs_path(path);
        let meta = match fs::symlink_metadata(&target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} already gone", path);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if permanent {
            if meta.is_dir() {
                fs::remove_dir_all(&target).await?;
            } else {
                fs::remove_file(&target).await?;
            }
        } else {
            let name = path
                .name()
                .ok_or_else(|| Error::InvalidInput("Cannot delete the sync root".to_string()))?;
            let bin = self.root.join(LOCAL_TRASH_DIR).join(Uuid::new_v4().to_string());
            fs::create_dir_all(&bin).await?;
            fs::rename(&target, bin.join(name)).await?;
        }
        self.signal.touch();
        info!(path = %path, permanent, "Deleted local item");
        Ok(())
    }

    async fn rename(&self, from: &SyncPath, to: &SyncPath) -> Result<()> {
        let source = self.fs_path(from);
        let target = self.fs_path(to);
        if fs::symlink_metadata(&target).await.is_ok() {
            return Err(Error::AlreadyExists(format!("Destination exists: {}", to)));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&source, &target).await?;
        self.signal.touch();
        info!(from = %from, to = %to, "Renamed local item");
        Ok(())
    }

    async fn upload(&self, path: &SyncPath) -> Result<Transferred<RemoteItem>> {
        let source = self.fs_path(path);
        let meta = fs::metadata(&source).await?;
        if !meta.is_file() {
            return Err(Error::InvalidInput(format!("Not a file: {}", path)));
        }
        let modified = system_time_ms(meta.modified()?);
        let data = fs::read(&source).await?;
        let hash = ContentHash::of_bytes(&data);

        let item = self.remote.put_file(path, data, modified).await?;
        Ok(Transferred { item, hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RemoteAdapter;
    use tempfile::TempDir;
    use vaultsync_storage::{CloudStore, MemoryStore};

    fn p(s: &str) -> SyncPath {
        SyncPath::parse(s).unwrap()
    }

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        signal: Arc<ChangeSignal>,
        remote: Arc<RemoteFs>,
        local: LocalFs,
    }

    fn fixture(patterns: &[String]) -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let signal = Arc::new(ChangeSignal::new());
        let ignore = Arc::new(IgnoreRules::new(&root, patterns).unwrap());
        let store: Arc<dyn CloudStore> = Arc::new(MemoryStore::new());
        let root_id = store.root_id().to_string();
        let remote = Arc::new(RemoteFs::new(
            store,
            root_id,
            &root,
            signal.clone(),
            ignore.clone(),
        ));
        let local = LocalFs::new(&root, signal.clone(), ignore, remote.clone());
        Fixture {
            _temp: temp,
            root,
            signal,
            remote,
            local,
        }
    }

    #[tokio::test]
    async fn test_scan_lists_tree() {
        let f = fixture(&["*.tmp".to_string()]);
        std::fs::create_dir_all(f.root.join("docs/sub")).unwrap();
        std::fs::write(f.root.join("docs/a.txt"), b"hello").unwrap();
        std::fs::write(f.root.join("docs/sub/b.txt"), b"world!").unwrap();
        std::fs::write(f.root.join("scratch.tmp"), b"x").unwrap();
        std::fs::create_dir_all(f.root.join(LOCAL_TRASH_DIR).join("old")).unwrap();

        let tree = f.local.scan().await.unwrap();

        let paths: Vec<String> = tree.iter().map(|i| i.path.to_string()).collect();
        assert_eq!(paths, vec!["/docs", "/docs/a.txt", "/docs/sub", "/docs/sub/b.txt"]);
        let file = tree.get(&p("/docs/sub/b.txt")).unwrap();
        assert_eq!(file.kind, ItemKind::File);
        assert_eq!(file.size, 6);
        assert!(file.last_modified > 0);
        assert!(tree.is_consistent());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_skips_symlinks() {
        let f = fixture(&[]);
        std::fs::write(f.root.join("real.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(f.root.join("real.txt"), f.root.join("link.txt")).unwrap();

        let tree = f.local.scan().await.unwrap();
        assert!(tree.contains(&p("/real.txt")));
        assert!(!tree.contains(&p("/link.txt")));
    }

    #[tokio::test]
    async fn test_scan_reused_until_signal() {
        let f = fixture(&[]);
        std::fs::write(f.root.join("a.txt"), b"x").unwrap();
        assert_eq!(f.local.scan().await.unwrap().len(), 1);

        std::fs::write(f.root.join("b.txt"), b"y").unwrap();
        assert_eq!(f.local.scan().await.unwrap().len(), 1);

        f.signal.touch();
        assert_eq!(f.local.scan().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_scan_of_missing_root_fails() {
        let f = fixture(&[]);
        let local = LocalFs::new(
            f.root.join("missing"),
            f.signal.clone(),
            Arc::new(IgnoreRules::new(&f.root, &[]).unwrap()),
            f.remote.clone(),
        );
        assert!(matches!(local.scan().await, Err(Error::Scan(_))));
    }

    #[tokio::test]
    async fn test_mkdir_rename_unlink() {
        let f = fixture(&[]);

        let item = f.local.mkdir(&p("/a/b")).await.unwrap();
        assert_eq!(item.kind, ItemKind::Directory);
        assert!(f.root.join("a/b").is_dir());
        assert!(f.signal.generation() > 0);

        f.local.rename(&p("/a/b"), &p("/c/d")).await.unwrap();
        assert!(f.root.join("c/d").is_dir());
        assert!(!f.root.join("a/b").exists());

        f.local.unlink(&p("/c/d"), false).await.unwrap();
        assert!(!f.root.join("c/d").exists());
        let trashed: Vec<_> = std::fs::read_dir(f.root.join(LOCAL_TRASH_DIR)).unwrap().collect();
        assert_eq!(trashed.len(), 1);

        f.local.unlink(&p("/c"), true).await.unwrap();
        assert!(!f.root.join("c").exists());

        // Already gone is fine.
        f.local.unlink(&p("/c"), true).await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_onto_existing_fails() {
        let f = fixture(&[]);
        std::fs::write(f.root.join("x"), b"1").unwrap();
        std::fs::write(f.root.join("y"), b"2").unwrap();

        assert!(matches!(
            f.local.rename(&p("/x"), &p("/y")).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_hash_and_upload() {
        let f = fixture(&[]);
        std::fs::write(f.root.join("f.txt"), b"content").unwrap();

        let hash = f.local.hash(&p("/f.txt")).await.unwrap();
        assert_eq!(hash, ContentHash::of_bytes(b"content"));

        let sent = f.local.upload(&p("/f.txt")).await.unwrap();
        assert_eq!(sent.hash, hash);
        assert_eq!(sent.item.path, p("/f.txt"));
        assert_eq!(sent.item.size, 7);

        let remote = f.remote.scan(false).await.unwrap();
        assert_eq!(remote.get(&p("/f.txt")).unwrap().id, sent.item.id);
    }
}
