//! Cloud store trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vaultsync_common::{ItemKind, Result};

/// Size of one sealed content chunk (1 MiB).
pub const CHUNK_SIZE: u64 = 1024 * 1024;

/// Number of chunks a file of `size` bytes is split into.
///
/// Empty files still occupy one (empty) chunk.
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE).max(1)
}

/// Encryption and placement metadata for a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudFileMeta {
    /// Base64 per-file content key.
    pub key: String,
    /// Number of sealed chunks.
    pub chunks: u64,
    /// Storage region holding the chunks.
    pub region: String,
    /// Bucket holding the chunks.
    pub bucket: String,
}

/// A file or directory as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudNode {
    /// Immutable identifier, stable across rename and move.
    pub id: String,
    /// Identifier of the containing directory.
    pub parent: String,
    /// Item name within its parent.
    pub name: String,
    /// File or directory.
    pub kind: ItemKind,
    /// Plaintext size in bytes (0 for directories).
    pub size: u64,
    /// Last modification time, milliseconds since the Unix epoch.
    pub modified: i64,
    /// Present for files only.
    pub file: Option<CloudFileMeta>,
}

/// Id-addressed encrypted cloud storage.
///
/// Implementations must handle their own authentication, encryption and
/// rate limiting. Trashed items are invisible to `list_tree`.
#[async_trait]
pub trait CloudStore: Send + Sync {
    /// Get the store name (e.g., "memory", "dir").
    fn name(&self) -> &str;

    /// Identifier of the store's top-level directory.
    fn root_id(&self) -> &str;

    /// List every live item below `root_id`.
    ///
    /// Items are returned in creation order. Callers must not assume the
    /// listing is restricted to the subtree; entries whose parent chain does
    /// not reach `root_id` have to be discarded by the caller.
    async fn list_tree(&self, root_id: &str) -> Result<Vec<CloudNode>>;

    /// Create a directory, or return the existing one with that name.
    ///
    /// # Errors
    /// - Parent not found or not a directory
    /// - A file with that name already exists
    async fn create_dir(&self, parent_id: &str, name: &str) -> Result<CloudNode>;

    /// Store a file, replacing any same-named file in `parent_id`.
    ///
    /// A replaced file gets a new id.
    async fn upload(
        &self,
        parent_id: &str,
        name: &str,
        data: Vec<u8>,
        modified: i64,
    ) -> Result<CloudNode>;

    /// Fetch and unseal the content of a file.
    async fn download(&self, id: &str) -> Result<Vec<u8>>;

    /// Move an item (and its subtree) to the trash.
    async fn trash(&self, id: &str) -> Result<()>;

    /// Remove an item (and its subtree) permanently.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Change the name of an item, keeping its parent.
    ///
    /// # Errors
    /// - A sibling with that name already exists
    async fn rename(&self, id: &str, name: &str) -> Result<()>;

    /// Change the parent of an item, keeping its name.
    async fn move_to(&self, id: &str, parent_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0), 1);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE), 1);
        assert_eq!(chunk_count(CHUNK_SIZE + 1), 2);
    }

    #[test]
    fn test_node_serialization() {
        let node = CloudNode {
            id: "test-id".to_string(),
            parent: "root".to_string(),
            name: "test-file.txt".to_string(),
            kind: ItemKind::File,
            size: 1024,
            modified: 1_700_000_000_000,
            file: Some(CloudFileMeta {
                key: "a2V5".to_string(),
                chunks: 1,
                region: "local".to_string(),
                bucket: "blobs".to_string(),
            }),
        };

        let json = serde_json::to_string(&node).unwrap();
        let deserialized: CloudNode = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized, node);
    }
}
