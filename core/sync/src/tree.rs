//! Tree snapshots of both sides of a sync pair.
//!
//! A tree is indexed twice: by path and by the item's stable identity
//! (inode locally, remote id in the cloud). Both indexes always describe
//! the same set of items; every mutation goes through [`Tree`] methods
//! that keep them in step.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;

use vaultsync_common::{ItemKind, SyncPath};

/// An item found on the local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalItem {
    pub path: SyncPath,
    pub kind: ItemKind,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub last_modified: i64,
    /// Milliseconds since the Unix epoch, 0 when unknown.
    pub creation_time: i64,
    pub inode: u64,
}

/// Encryption and placement metadata of a remote file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileMeta {
    pub key: String,
    pub chunks: u64,
    pub region: String,
    pub bucket: String,
}

/// An item found in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub path: SyncPath,
    pub kind: ItemKind,
    pub id: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub last_modified: i64,
    /// Present for files only.
    pub file: Option<RemoteFileMeta>,
}

/// Behaviour shared by local and remote items so one tree type serves both.
pub trait TreeItem: Clone {
    type Id: Clone + Eq + Hash + fmt::Debug;

    fn id(&self) -> Self::Id;
    fn path(&self) -> &SyncPath;
    fn set_path(&mut self, path: SyncPath);
    fn kind(&self) -> ItemKind;
    fn last_modified(&self) -> i64;

    /// Whether `other`, found under the same identity in another snapshot,
    /// is plausibly the same item.
    fn same_item(&self, other: &Self) -> bool {
        self.kind() == other.kind()
    }
}

impl TreeItem for LocalItem {
    type Id = u64;

    fn id(&self) -> u64 {
        self.inode
    }

    fn path(&self) -> &SyncPath {
        &self.path
    }

    fn set_path(&mut self, path: SyncPath) {
        self.path = path;
    }

    fn kind(&self) -> ItemKind {
        self.kind
    }

    fn last_modified(&self) -> i64 {
        self.last_modified
    }

    /// Inodes are recycled by the filesystem, so a matching inode only counts
    /// when the kind matches and, if both are known, the creation time too.
    fn same_item(&self, other: &Self) -> bool {
        if self.kind != other.kind {
            return false;
        }
        self.creation_time == 0 || other.creation_time == 0 || self.creation_time == other.creation_time
    }
}

impl TreeItem for RemoteItem {
    type Id = String;

    fn id(&self) -> String {
        self.id.clone()
    }

    fn path(&self) -> &SyncPath {
        &self.path
    }

    fn set_path(&mut self, path: SyncPath) {
        self.path = path;
    }

    fn kind(&self) -> ItemKind {
        self.kind
    }

    fn last_modified(&self) -> i64 {
        self.last_modified
    }
}

/// A snapshot indexed by path and by identity.
#[derive(Debug, Clone)]
pub struct Tree<T: TreeItem> {
    tree: BTreeMap<SyncPath, T>,
    by_id: HashMap<T::Id, SyncPath>,
}

pub type LocalTree = Tree<LocalItem>;
pub type RemoteTree = Tree<RemoteItem>;

impl<T: TreeItem> Default for Tree<T> {
    fn default() -> Self {
        Self {
            tree: BTreeMap::new(),
            by_id: HashMap::new(),
        }
    }
}

impl<T: TreeItem> PartialEq for Tree<T>
where
    T: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.tree == other.tree
    }
}

impl<T: TreeItem> Tree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from items; later items win on path or identity clashes.
    pub fn from_items(items: impl IntoIterator<Item = T>) -> Self {
        let mut tree = Self::new();
        for item in items {
            tree.insert(item);
        }
        tree
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn get(&self, path: &SyncPath) -> Option<&T> {
        self.tree.get(path)
    }

    pub fn contains(&self, path: &SyncPath) -> bool {
        self.tree.contains_key(path)
    }

    pub fn get_by_id(&self, id: &T::Id) -> Option<&T> {
        self.by_id.get(id).and_then(|path| self.tree.get(path))
    }

    /// Items in path order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.tree.values()
    }

    /// Path-ordered map view, used for persistence.
    pub fn as_map(&self) -> &BTreeMap<SyncPath, T> {
        &self.tree
    }

    /// Identity of the directory containing `path`; `None` for the root.
    pub fn parent_id(&self, path: &SyncPath) -> Option<T::Id> {
        let parent = path.parent()?;
        self.tree.get(&parent).map(|item| item.id())
    }

    /// Insert an item, evicting whatever previously held its path or its
    /// identity. Returns the item that held the path.
    pub fn insert(&mut self, item: T) -> Option<T> {
        let path = item.path().clone();
        let id = item.id();

        if let Some(old_path) = self.by_id.remove(&id) {
            if old_path != path {
                self.tree.remove(&old_path);
            }
        }
        let replaced = self.tree.insert(path.clone(), item);
        if let Some(old) = &replaced {
            if old.id() != id {
                self.by_id.remove(&old.id());
            }
        }
        self.by_id.insert(id, path);
        replaced
    }

    /// `path` and everything beneath it, in path order.
    pub fn subtree<'a>(&'a self, path: &'a SyncPath) -> impl Iterator<Item = &'a T> + 'a {
        self.tree
            .range(path.clone()..)
            .take_while(move |(p, _)| p.starts_with(path))
            .map(|(_, item)| item)
    }

    /// Remove `path` and everything beneath it.
    pub fn remove_subtree(&mut self, path: &SyncPath) -> Vec<T> {
        let doomed: Vec<SyncPath> = self.subtree(path).map(|item| item.path().clone()).collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for p in doomed {
            if let Some(item) = self.tree.remove(&p) {
                self.by_id.remove(&item.id());
                removed.push(item);
            }
        }
        removed
    }

    /// Move `from` and everything beneath it to `to`.
    ///
    /// Identities are preserved; only paths change. Items already living
    /// at a destination path are evicted.
    pub fn rename_subtree(&mut self, from: &SyncPath, to: &SyncPath) {
        self.relocate_all(&[(from.clone(), to.clone())]);
    }

    /// Apply several relocations at once.
    ///
    /// Every source subtree is lifted out before anything is put back, so
    /// two items trading places both land where they belong. Sources must
    /// not be nested in one another.
    pub fn relocate_all(&mut self, moves: &[(SyncPath, SyncPath)]) {
        let mut lifted = Vec::new();
        for (from, to) in moves {
            if from != to {
                lifted.push((from, to, self.remove_subtree(from)));
            }
        }
        for (from, to, items) in lifted {
            for mut item in items {
                if let Some(new_path) = item.path().rebase(from, to) {
                    item.set_path(new_path);
                    self.insert(item);
                }
            }
        }
    }

    /// Keep only the items whose path satisfies `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&SyncPath) -> bool) {
        let by_id = &mut self.by_id;
        self.tree.retain(|path, item| {
            let kept = keep(path);
            if !kept {
                by_id.remove(&item.id());
            }
            kept
        });
    }

    /// Whether the two indexes describe the same items.
    pub fn is_consistent(&self) -> bool {
        self.tree.len() == self.by_id.len()
            && self
                .by_id
                .iter()
                .all(|(id, path)| self.tree.get(path).is_some_and(|item| &item.id() == id))
    }
}

/// SHA-512 digest of file content, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(data);
        Self::from_digest(hasher)
    }

    pub(crate) fn from_digest(hasher: Sha512) -> Self {
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recorded content hashes of local files, keyed by path.
pub type FileHashes = BTreeMap<SyncPath, ContentHash>;

/// Re-key every hash under each `from` to live under its `to`, all
/// relocations applied at once.
pub fn rekey_hashes(hashes: &mut FileHashes, moves: &[(SyncPath, SyncPath)]) {
    let lifted: Vec<(&SyncPath, &SyncPath, Vec<(SyncPath, ContentHash)>)> = moves
        .iter()
        .map(|(from, to)| (from, to, purge_hashes(hashes, from)))
        .collect();
    for (from, to, moved) in lifted {
        for (path, hash) in moved {
            if let Some(new_path) = path.rebase(from, to) {
                hashes.insert(new_path, hash);
            }
        }
    }
}

/// Drop every hash at or beneath `path`, returning them.
pub fn purge_hashes(hashes: &mut FileHashes, path: &SyncPath) -> Vec<(SyncPath, ContentHash)> {
    let doomed: Vec<SyncPath> = hashes
        .range(path.clone()..)
        .take_while(|(p, _)| p.starts_with(path))
        .map(|(p, _)| p.clone())
        .collect();
    doomed
        .into_iter()
        .filter_map(|p| hashes.remove(&p).map(|h| (p, h)))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn p(s: &str) -> SyncPath {
        SyncPath::parse(s).unwrap()
    }

    pub fn local_file(path: &str, inode: u64, modified: i64) -> LocalItem {
        LocalItem {
            path: p(path),
            kind: ItemKind::File,
            size: 1,
            last_modified: modified,
            creation_time: 0,
            inode,
        }
    }

    pub fn local_dir(path: &str, inode: u64) -> LocalItem {
        LocalItem {
            path: p(path),
            kind: ItemKind::Directory,
            size: 0,
            last_modified: 0,
            creation_time: 0,
            inode,
        }
    }

    pub fn remote_file(path: &str, id: &str, modified: i64) -> RemoteItem {
        RemoteItem {
            path: p(path),
            kind: ItemKind::File,
            id: id.to_string(),
            size: 1,
            last_modified: modified,
            file: Some(RemoteFileMeta {
                key: "k".to_string(),
                chunks: 1,
                region: "memory".to_string(),
                bucket: "memory".to_string(),
            }),
        }
    }

    pub fn remote_dir(path: &str, id: &str) -> RemoteItem {
        RemoteItem {
            path: p(path),
            kind: ItemKind::Directory,
            id: id.to_string(),
            size: 0,
            last_modified: 0,
            file: None,
        }
    }

    #[test]
    fn test_insert_keeps_indexes_in_step() {
        let mut tree = LocalTree::new();
        tree.insert(local_file("/a.txt", 1, 0));
        tree.insert(local_file("/b.txt", 2, 0));

        // Same inode at a new path evicts the old path.
        tree.insert(local_file("/c.txt", 1, 0));
        assert!(!tree.contains(&p("/a.txt")));
        assert_eq!(tree.get_by_id(&1).unwrap().path, p("/c.txt"));

        // New inode at an existing path evicts the old identity.
        tree.insert(local_file("/b.txt", 3, 0));
        assert!(tree.get_by_id(&2).is_none());
        assert_eq!(tree.len(), 2);
        assert!(tree.is_consistent());
    }

    #[test]
    fn test_remove_subtree() {
        let mut tree = RemoteTree::from_items(vec![
            remote_dir("/a", "1"),
            remote_file("/a/x", "2", 0),
            remote_dir("/a/b", "3"),
            remote_file("/a/b/y", "4", 0),
            remote_file("/ab", "5", 0),
        ]);

        let removed = tree.remove_subtree(&p("/a"));
        assert_eq!(removed.len(), 4);
        assert_eq!(tree.len(), 1);
        assert!(tree.contains(&p("/ab")));
        assert!(tree.is_consistent());
    }

    #[test]
    fn test_rename_subtree() {
        let mut tree = LocalTree::from_items(vec![
            local_dir("/a", 1),
            local_file("/a/x", 2, 0),
            local_dir("/a/b", 3),
            local_file("/a/b/y", 4, 0),
        ]);

        tree.rename_subtree(&p("/a"), &p("/z/a"));

        assert!(tree.iter().all(|item| item.path.starts_with(&p("/z/a"))));
        assert_eq!(tree.get_by_id(&4).unwrap().path, p("/z/a/b/y"));
        assert!(tree.is_consistent());
    }

    #[test]
    fn test_relocate_all_swaps_names() {
        let mut tree = RemoteTree::from_items(vec![
            remote_file("/a", "1", 0),
            remote_dir("/b", "2"),
            remote_file("/b/inner", "3", 0),
        ]);

        tree.relocate_all(&[(p("/a"), p("/b")), (p("/b"), p("/a"))]);

        assert_eq!(tree.get(&p("/b")).unwrap().id, "1");
        assert_eq!(tree.get(&p("/a")).unwrap().id, "2");
        assert_eq!(tree.get(&p("/a/inner")).unwrap().id, "3");
        assert_eq!(tree.len(), 3);
        assert!(tree.is_consistent());
    }

    #[test]
    fn test_parent_id() {
        let tree = LocalTree::from_items(vec![local_dir("/a", 9), local_file("/a/x", 2, 0)]);
        assert_eq!(tree.parent_id(&p("/a/x")), Some(9));
        assert_eq!(tree.parent_id(&p("/a")), None);
    }

    #[test]
    fn test_same_item_checks_creation_time() {
        let mut a = local_file("/a", 1, 0);
        let mut b = local_file("/b", 1, 0);
        assert!(a.same_item(&b));

        a.creation_time = 10;
        b.creation_time = 20;
        assert!(!a.same_item(&b));

        b.creation_time = 0;
        assert!(a.same_item(&b));
        assert!(!a.same_item(&local_dir("/b", 1)));
    }

    #[test]
    fn test_content_hash() {
        let hash = ContentHash::of_bytes(b"abc");
        assert_eq!(hash.as_str().len(), 128);
        assert!(hash.as_str().starts_with("ddaf35a193617aba"));
    }

    #[test]
    fn test_rekey_and_purge_hashes() {
        let mut hashes = FileHashes::new();
        hashes.insert(p("/a/x"), ContentHash::of_bytes(b"x"));
        hashes.insert(p("/a/y"), ContentHash::of_bytes(b"y"));
        hashes.insert(p("/b"), ContentHash::of_bytes(b"b"));

        rekey_hashes(&mut hashes, &[(p("/a"), p("/c"))]);
        assert!(hashes.contains_key(&p("/c/x")));
        assert!(!hashes.contains_key(&p("/a/x")));

        let purged = purge_hashes(&mut hashes, &p("/c"));
        assert_eq!(purged.len(), 2);
        assert_eq!(hashes.len(), 1);

        hashes.insert(p("/d"), ContentHash::of_bytes(b"d"));
        rekey_hashes(&mut hashes, &[(p("/b"), p("/d")), (p("/d"), p("/b"))]);
        assert_eq!(hashes.get(&p("/d")), Some(&ContentHash::of_bytes(b"b")));
        assert_eq!(hashes.get(&p("/b")), Some(&ContentHash::of_bytes(b"d")));
    }
}
