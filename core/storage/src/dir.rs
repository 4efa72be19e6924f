//! Directory-backed cloud store.
//!
//! Layout under the store root:
//!
//! ```text
//! manifest.json          node table (atomically replaced on every change)
//! blobs/<id>/<index>     sealed content chunks of file <id>
//! ```
//!
//! Trashed nodes keep their blobs until deleted.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::memory::NodeTable;
use crate::provider::{CloudFileMeta, CloudNode, CloudStore};
use crate::seal;
use vaultsync_common::{Error, Result};

const MANIFEST_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "manifest.json";
const BLOBS_DIR: &str = "blobs";

#[derive(Serialize, Deserialize)]
struct Manifest {
    version: u32,
    table: NodeTable,
}

/// Cloud store persisted in a local directory.
///
/// Behaves like a remote account: ids are opaque, content is sealed with a
/// per-file key, and nothing here mirrors the synced tree layout.
pub struct DirStore {
    root: PathBuf,
    root_id: String,
    table: Mutex<NodeTable>,
}

impl DirStore {
    /// Open the store at `root`, creating it if needed.
    ///
    /// # Errors
    /// - Root cannot be created
    /// - Existing manifest is unreadable or has an unknown version
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(BLOBS_DIR))?;

        let manifest_path = root.join(MANIFEST_FILE);
        let table = if manifest_path.exists() {
            let bytes = std::fs::read(&manifest_path)?;
            let manifest: Manifest = serde_json::from_slice(&bytes)?;
            if manifest.version != MANIFEST_VERSION {
                return Err(Error::Storage(format!(
                    "Unsupported manifest version {}",
                    manifest.version
                )));
            }
            manifest.table
        } else {
            let table = NodeTable::new(Uuid::new_v4().to_string());
            let manifest = Manifest {
                version: MANIFEST_VERSION,
                table,
            };
            std::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;
            manifest.table
        };

        debug!("Opened dir store at {:?}", root);
        Ok(Self {
            root_id: table.root_id().to_string(),
            root,
            table: Mutex::new(table),
        })
    }

    fn blob_dir(&self, id: &str) -> PathBuf {
        self.root.join(BLOBS_DIR).join(id)
    }

    async fn save(&self, table: &NodeTable) -> Result<()> {
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            table: table.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest)?;

        let tmp = self.root.join(format!("{}.tmp", MANIFEST_FILE));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, self.root.join(MANIFEST_FILE)).await?;
        Ok(())
    }

    async fn remove_blobs(&self, id: &str) {
        let dir = self.blob_dir(id);
        if let Err(e) = fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove blobs of {}: {}", id, e);
            }
        }
    }
}

#[async_trait]
impl CloudStore for DirStore {
    fn name(&self) -> &str {
        "dir"
    }

    fn root_id(&self) -> &str {
        &self.root_id
    }

    async fn list_tree(&self, root_id: &str) -> Result<Vec<CloudNode>> {
        self.table.lock().await.list_tree(root_id)
    }

    async fn create_dir(&self, parent_id: &str, name: &str) -> Result<CloudNode> {
        let mut table = self.table.lock().await;
        let now = Utc::now().timestamp_millis();
        let node = table.create_dir(parent_id, name, now)?;
        self.save(&table).await?;
        Ok(node)
    }

    async fn upload(
        &self,
        parent_id: &str,
        name: &str,
        data: Vec<u8>,
        modified: i64,
    ) -> Result<CloudNode> {
        let id = Uuid::new_v4().to_string();
        let key = seal::generate_key();
        let sealed = seal::seal(&key, &data)?;

        let dir = self.blob_dir(&id);
        fs::create_dir_all(&dir).await?;
        for (index, chunk) in sealed.iter().enumerate() {
            fs::write(dir.join(index.to_string()), chunk).await?;
        }

        let meta = CloudFileMeta {
            key,
            chunks: sealed.len() as u64,
            region: "local".to_string(),
            bucket: BLOBS_DIR.to_string(),
        };

        let mut table = self.table.lock().await;
        let (node, replaced) =
            match table.put_file(id.clone(), parent_id, name, data.len() as u64, modified, meta) {
                Ok(placed) => placed,
                Err(e) => {
                    self.remove_blobs(&id).await;
                    return Err(e);
                }
            };
        self.save(&table).await?;
        drop(table);

        if let Some(old) = replaced {
            self.remove_blobs(&old).await;
        }
        Ok(node)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let meta = self.table.lock().await.file_meta(id)?;
        let dir = self.blob_dir(id);

        let mut sealed = Vec::with_capacity(meta.chunks as usize);
        for index in 0..meta.chunks {
            let chunk = fs::read(dir.join(index.to_string())).await.map_err(|e| {
                Error::Storage(format!("Missing chunk {} of {}: {}", index, id, e))
            })?;
            sealed.push(chunk);
        }
        seal::open(&meta.key, &sealed)
    }

    async fn trash(&self, id: &str) -> Result<()> {
        let mut table = self.table.lock().await;
        table.trash(id)?;
        self.save(&table).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut table = self.table.lock().await;
        let files = table.remove(id)?;
        self.save(&table).await?;
        drop(table);

        for file in files {
            self.remove_blobs(&file).await;
        }
        Ok(())
    }

    async fn rename(&self, id: &str, name: &str) -> Result<()> {
        let mut table = self.table.lock().await;
        table.rename(id, name)?;
        self.save(&table).await
    }

    async fn move_to(&self, id: &str, parent_id: &str) -> Result<()> {
        let mut table = self.table.lock().await;
        table.move_to(id, parent_id)?;
        self.save(&table).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_download() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path()).unwrap();
        let root = store.root_id().to_string();

        let data = b"Hello, World!".to_vec();
        let node = store.upload(&root, "test.txt", data.clone(), 7).await.unwrap();

        assert_eq!(store.download(&node.id).await.unwrap(), data);
        assert!(temp.path().join("blobs").join(&node.id).join("0").exists());
    }

    #[tokio::test]
    async fn test_blobs_are_sealed() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path()).unwrap();
        let root = store.root_id().to_string();

        let data = b"plaintext marker".to_vec();
        let node = store.upload(&root, "f.txt", data.clone(), 1).await.unwrap();

        let raw = std::fs::read(temp.path().join("blobs").join(&node.id).join("0")).unwrap();
        assert!(!raw.windows(data.len()).any(|w| w == data.as_slice()));
    }

    #[tokio::test]
    async fn test_reopen_keeps_tree() {
        let temp = TempDir::new().unwrap();
        let (root, file_id) = {
            let store = DirStore::new(temp.path()).unwrap();
            let root = store.root_id().to_string();
            let dir = store.create_dir(&root, "docs").await.unwrap();
            let file = store.upload(&dir.id, "a.txt", vec![1, 2], 3).await.unwrap();
            (root, file.id)
        };

        let store = DirStore::new(temp.path()).unwrap();
        assert_eq!(store.root_id(), root);
        let listed = store.list_tree(&root).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(store.download(&file_id).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_replace_removes_old_blobs() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path()).unwrap();
        let root = store.root_id().to_string();

        let first = store.upload(&root, "a.txt", vec![1], 1).await.unwrap();
        let second = store.upload(&root, "a.txt", vec![2], 2).await.unwrap();

        assert!(!temp.path().join("blobs").join(&first.id).exists());
        assert_eq!(store.download(&second.id).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_trash_keeps_blobs_delete_removes_them() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path()).unwrap();
        let root = store.root_id().to_string();

        let trashed = store.upload(&root, "t.txt", vec![1], 1).await.unwrap();
        let deleted = store.upload(&root, "d.txt", vec![2], 1).await.unwrap();

        store.trash(&trashed.id).await.unwrap();
        store.delete(&deleted.id).await.unwrap();

        assert!(temp.path().join("blobs").join(&trashed.id).exists());
        assert!(!temp.path().join("blobs").join(&deleted.id).exists());
        assert!(store.list_tree(&root).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_into_missing_parent_fails() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path()).unwrap();

        let result = store.upload("missing", "a.txt", vec![1], 1).await;
        assert!(result.is_err());
    }
}
