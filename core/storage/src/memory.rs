//! In-memory cloud store for testing.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::provider::{CloudFileMeta, CloudNode, CloudStore};
use crate::seal;
use vaultsync_common::{Error, ItemKind, Result};

/// A node plus the bookkeeping the stores need but never expose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredNode {
    pub node: CloudNode,
    pub seq: u64,
    pub trashed: bool,
}

/// Parent-linked node table shared by the store implementations.
///
/// The root directory is implicit: it has an id but no entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct NodeTable {
    root_id: String,
    nodes: HashMap<String, StoredNode>,
    next_seq: u64,
}

impl NodeTable {
    pub fn new(root_id: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            nodes: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    fn live(&self, id: &str) -> Result<&StoredNode> {
        match self.nodes.get(id) {
            Some(stored) if !stored.trashed => Ok(stored),
            _ => Err(Error::NotFound(format!("Item not found: {}", id))),
        }
    }

    fn require_dir(&self, id: &str) -> Result<()> {
        if id == self.root_id {
            return Ok(());
        }
        match self.live(id)?.node.kind {
            ItemKind::Directory => Ok(()),
            ItemKind::File => Err(Error::InvalidInput(format!("Not a directory: {}", id))),
        }
    }

    fn child_named(&self, parent_id: &str, name: &str) -> Option<&StoredNode> {
        self.nodes
            .values()
            .find(|s| !s.trashed && s.node.parent == parent_id && s.node.name == name)
    }

    fn insert(&mut self, node: CloudNode) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.nodes.insert(
            node.id.clone(),
            StoredNode {
                node,
                seq,
                trashed: false,
            },
        );
    }

    /// True when the parent chain of `id` reaches `ancestor`.
    fn is_within(&self, id: &str, ancestor: &str) -> bool {
        let mut current = id;
        // Bounded by the table size so a corrupted cycle cannot hang the walk.
        for _ in 0..=self.nodes.len() {
            let Some(stored) = self.nodes.get(current) else {
                return false;
            };
            if stored.node.parent == ancestor {
                return true;
            }
            current = &stored.node.parent;
        }
        false
    }

    /// Ids of `id` and everything beneath it.
    pub fn subtree_ids(&self, id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .keys()
            .filter(|other| self.is_within(other, id))
            .cloned()
            .collect();
        ids.push(id.to_string());
        ids
    }

    pub fn list_tree(&self, root_id: &str) -> Result<Vec<CloudNode>> {
        self.require_dir(root_id)?;
        let mut found: Vec<&StoredNode> = self
            .nodes
            .values()
            .filter(|s| !s.trashed && self.is_within(&s.node.id, root_id))
            .collect();
        found.sort_by_key(|s| s.seq);
        Ok(found.into_iter().map(|s| s.node.clone()).collect())
    }

    pub fn create_dir(&mut self, parent_id: &str, name: &str, now: i64) -> Result<CloudNode> {
        self.require_dir(parent_id)?;
        if let Some(existing) = self.child_named(parent_id, name) {
            return match existing.node.kind {
                ItemKind::Directory => Ok(existing.node.clone()),
                ItemKind::File => Err(Error::AlreadyExists(format!(
                    "A file named '{}' already exists",
                    name
                ))),
            };
        }

        let node = CloudNode {
            id: Uuid::new_v4().to_string(),
            parent: parent_id.to_string(),
            name: name.to_string(),
            kind: ItemKind::Directory,
            size: 0,
            modified: now,
            file: None,
        };
        self.insert(node.clone());
        Ok(node)
    }

    /// Insert a file node; returns it together with the id it replaced.
    pub fn put_file(
        &mut self,
        id: String,
        parent_id: &str,
        name: &str,
        size: u64,
        modified: i64,
        meta: CloudFileMeta,
    ) -> Result<(CloudNode, Option<String>)> {
        self.require_dir(parent_id)?;
        let replaced = match self.child_named(parent_id, name) {
            Some(existing) if existing.node.kind.is_dir() => {
                return Err(Error::AlreadyExists(format!(
                    "A directory named '{}' already exists",
                    name
                )));
            }
            Some(existing) => Some(existing.node.id.clone()),
            None => None,
        };
        if let Some(old) = &replaced {
            self.nodes.remove(old);
        }

        let node = CloudNode {
            id,
            parent: parent_id.to_string(),
            name: name.to_string(),
            kind: ItemKind::File,
            size,
            modified,
            file: Some(meta),
        };
        self.insert(node.clone());
        Ok((node, replaced))
    }

    pub fn file_meta(&self, id: &str) -> Result<CloudFileMeta> {
        let stored = self.live(id)?;
        stored
            .node
            .file
            .clone()
            .ok_or_else(|| Error::InvalidInput("Cannot download directory".to_string()))
    }

    pub fn trash(&mut self, id: &str) -> Result<()> {
        self.live(id)?;
        for sub in self.subtree_ids(id) {
            if let Some(stored) = self.nodes.get_mut(&sub) {
                stored.trashed = true;
            }
        }
        Ok(())
    }

    /// Remove `id` and its subtree; returns the removed file ids.
    pub fn remove(&mut self, id: &str) -> Result<Vec<String>> {
        if !self.nodes.contains_key(id) {
            return Err(Error::NotFound(format!("Item not found: {}", id)));
        }
        let mut files = Vec::new();
        for sub in self.subtree_ids(id) {
            if let Some(stored) = self.nodes.remove(&sub) {
                if stored.node.kind == ItemKind::File {
                    files.push(sub);
                }
            }
        }
        Ok(files)
    }

    pub fn rename(&mut self, id: &str, name: &str) -> Result<()> {
        let parent = self.live(id)?.node.parent.clone();
        if let Some(existing) = self.child_named(&parent, name) {
            if existing.node.id != id {
                return Err(Error::AlreadyExists(format!(
                    "Destination already exists: {}",
                    name
                )));
            }
        }
        if let Some(stored) = self.nodes.get_mut(id) {
            stored.node.name = name.to_string();
        }
        Ok(())
    }

    pub fn move_to(&mut self, id: &str, parent_id: &str) -> Result<()> {
        let name = self.live(id)?.node.name.clone();
        self.require_dir(parent_id)?;
        if parent_id == id || self.is_within(parent_id, id) {
            return Err(Error::InvalidInput(
                "Cannot move a directory into itself".to_string(),
            ));
        }
        if self.child_named(parent_id, &name).is_some() {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                name
            )));
        }
        if let Some(stored) = self.nodes.get_mut(id) {
            stored.node.parent = parent_id.to_string();
        }
        Ok(())
    }
}

struct Inner {
    table: NodeTable,
    chunks: HashMap<String, Vec<Vec<u8>>>,
}

/// In-memory cloud store.
///
/// Useful for testing and dry runs. Content is sealed exactly as a real
/// store would seal it, but everything is lost on drop.
pub struct MemoryStore {
    root_id: String,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        let root_id = Uuid::new_v4().to_string();
        Self {
            inner: Mutex::new(Inner {
                table: NodeTable::new(root_id.clone()),
                chunks: HashMap::new(),
            }),
            root_id,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn root_id(&self) -> &str {
        &self.root_id
    }

    async fn list_tree(&self, root_id: &str) -> Result<Vec<CloudNode>> {
        self.lock()?.table.list_tree(root_id)
    }

    async fn create_dir(&self, parent_id: &str, name: &str) -> Result<CloudNode> {
        let now = Utc::now().timestamp_millis();
        self.lock()?.table.create_dir(parent_id, name, now)
    }

    async fn upload(
        &self,
        parent_id: &str,
        name: &str,
        data: Vec<u8>,
        modified: i64,
    ) -> Result<CloudNode> {
        let key = seal::generate_key();
        let sealed = seal::seal(&key, &data)?;
        let meta = CloudFileMeta {
            key,
            chunks: sealed.len() as u64,
            region: "memory".to_string(),
            bucket: "memory".to_string(),
        };

        let mut inner = self.lock()?;
        let (node, replaced) = inner.table.put_file(
            Uuid::new_v4().to_string(),
            parent_id,
            name,
            data.len() as u64,
            modified,
            meta,
        )?;
        if let Some(old) = replaced {
            inner.chunks.remove(&old);
        }
        inner.chunks.insert(node.id.clone(), sealed);
        Ok(node)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let inner = self.lock()?;
        let meta = inner.table.file_meta(id)?;
        let sealed = inner
            .chunks
            .get(id)
            .ok_or_else(|| Error::Storage(format!("Missing content for {}", id)))?;
        seal::open(&meta.key, sealed)
    }

    async fn trash(&self, id: &str) -> Result<()> {
        self.lock()?.table.trash(id)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        for file in inner.table.remove(id)? {
            inner.chunks.remove(&file);
        }
        Ok(())
    }

    async fn rename(&self, id: &str, name: &str) -> Result<()> {
        self.lock()?.table.rename(id, name)
    }

    async fn move_to(&self, id: &str, parent_id: &str) -> Result<()> {
        self.lock()?.table.move_to(id, parent_id)
    }
}
