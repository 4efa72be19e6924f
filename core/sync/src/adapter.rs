//! Adapter contracts the engine drives.
//!
//! The engine never touches the disk or the cloud directly; every side
//! effect goes through one of these traits so tests can substitute them.

use async_trait::async_trait;

use vaultsync_common::{ItemKind, Result, SyncPath};

use crate::tree::{ContentHash, LocalItem, LocalTree, RemoteItem, RemoteTree};

/// The authoritative record of an item after a transfer, plus the hash of
/// the bytes that were moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transferred<T> {
    pub item: T,
    pub hash: ContentHash,
}

/// Hashes local file content.
#[async_trait]
pub trait ContentHasher: Send + Sync {
    /// SHA-512 of the file at `path`.
    async fn hash(&self, path: &SyncPath) -> Result<ContentHash>;
}

/// The local side of a sync pair.
#[async_trait]
pub trait LocalAdapter: ContentHasher {
    /// Snapshot the local tree.
    ///
    /// # Errors
    /// - `Error::Scan` when the tree could not be listed completely
    async fn scan(&self) -> Result<LocalTree>;

    /// Create a directory (and any missing parents).
    async fn mkdir(&self, path: &SyncPath) -> Result<LocalItem>;

    /// Remove an item; non-permanent removal moves it to the local trash.
    async fn unlink(&self, path: &SyncPath, permanent: bool) -> Result<()>;

    /// Rename and/or move an item.
    async fn rename(&self, from: &SyncPath, to: &SyncPath) -> Result<()>;

    /// Send a local file to the remote side.
    async fn upload(&self, path: &SyncPath) -> Result<Transferred<RemoteItem>>;
}

/// The remote side of a sync pair.
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Snapshot the remote tree; `force` bypasses any cached listing.
    async fn scan(&self, force: bool) -> Result<RemoteTree>;

    async fn mkdir(&self, path: &SyncPath) -> Result<RemoteItem>;

    /// Remove an item; non-permanent removal sends it to the remote trash.
    async fn unlink(&self, path: &SyncPath, kind: ItemKind, permanent: bool) -> Result<()>;

    async fn rename(&self, from: &SyncPath, to: &SyncPath) -> Result<()>;

    /// Fetch a remote file onto the local disk.
    async fn download(&self, path: &SyncPath) -> Result<Transferred<LocalItem>>;
}
