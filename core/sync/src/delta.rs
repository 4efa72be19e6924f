//! Delta computation between two pairs of snapshots.
//!
//! Rules run in a fixed priority order. A path claimed by an earlier rule is
//! excluded from every later one, which is what keeps a rename from also
//! showing up as a delete plus an upload.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, warn};

use vaultsync_common::{ItemKind, SyncPath};

use crate::adapter::ContentHasher;
use crate::tree::{FileHashes, LocalTree, RemoteTree, Tree, TreeItem};

/// Which side of the pair a delta mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Local,
    Remote,
}

/// One operation needed to bring the two sides back in line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Delta {
    UploadFile { path: SyncPath },
    DownloadFile { path: SyncPath },
    CreateLocalDirectory { path: SyncPath },
    CreateRemoteDirectory { path: SyncPath },
    DeleteLocalFile { path: SyncPath },
    DeleteRemoteFile { path: SyncPath },
    DeleteLocalDirectory { path: SyncPath },
    DeleteRemoteDirectory { path: SyncPath },
    RenameLocalFile { from: SyncPath, to: SyncPath },
    RenameLocalDirectory { from: SyncPath, to: SyncPath },
    MoveLocalFile { from: SyncPath, to: SyncPath },
    MoveLocalDirectory { from: SyncPath, to: SyncPath },
    RenameRemoteFile { from: SyncPath, to: SyncPath },
    RenameRemoteDirectory { from: SyncPath, to: SyncPath },
    MoveRemoteFile { from: SyncPath, to: SyncPath },
    MoveRemoteDirectory { from: SyncPath, to: SyncPath },
}

impl Delta {
    pub fn delete(side: Side, kind: ItemKind, path: SyncPath) -> Self {
        match (side, kind) {
            (Side::Local, ItemKind::File) => Delta::DeleteLocalFile { path },
            (Side::Local, ItemKind::Directory) => Delta::DeleteLocalDirectory { path },
            (Side::Remote, ItemKind::File) => Delta::DeleteRemoteFile { path },
            (Side::Remote, ItemKind::Directory) => Delta::DeleteRemoteDirectory { path },
        }
    }

    /// A rename (same parent) or move (different parent) on `side`.
    pub fn relocate(side: Side, kind: ItemKind, moved: bool, from: SyncPath, to: SyncPath) -> Self {
        match (side, kind, moved) {
            (Side::Local, ItemKind::File, false) => Delta::RenameLocalFile { from, to },
            (Side::Local, ItemKind::Directory, false) => Delta::RenameLocalDirectory { from, to },
            (Side::Local, ItemKind::File, true) => Delta::MoveLocalFile { from, to },
            (Side::Local, ItemKind::Directory, true) => Delta::MoveLocalDirectory { from, to },
            (Side::Remote, ItemKind::File, false) => Delta::RenameRemoteFile { from, to },
            (Side::Remote, ItemKind::Directory, false) => Delta::RenameRemoteDirectory { from, to },
            (Side::Remote, ItemKind::File, true) => Delta::MoveRemoteFile { from, to },
            (Side::Remote, ItemKind::Directory, true) => Delta::MoveRemoteDirectory { from, to },
        }
    }

    /// The side this delta mutates.
    pub fn side(&self) -> Side {
        match self {
            Delta::DownloadFile { .. }
            | Delta::CreateLocalDirectory { .. }
            | Delta::DeleteLocalFile { .. }
            | Delta::DeleteLocalDirectory { .. }
            | Delta::RenameLocalFile { .. }
            | Delta::RenameLocalDirectory { .. }
            | Delta::MoveLocalFile { .. }
            | Delta::MoveLocalDirectory { .. } => Side::Local,
            Delta::UploadFile { .. }
            | Delta::CreateRemoteDirectory { .. }
            | Delta::DeleteRemoteFile { .. }
            | Delta::DeleteRemoteDirectory { .. }
            | Delta::RenameRemoteFile { .. }
            | Delta::RenameRemoteDirectory { .. }
            | Delta::MoveRemoteFile { .. }
            | Delta::MoveRemoteDirectory { .. } => Side::Remote,
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            Delta::UploadFile { .. }
            | Delta::DownloadFile { .. }
            | Delta::DeleteLocalFile { .. }
            | Delta::DeleteRemoteFile { .. }
            | Delta::RenameLocalFile { .. }
            | Delta::MoveLocalFile { .. }
            | Delta::RenameRemoteFile { .. }
            | Delta::MoveRemoteFile { .. } => ItemKind::File,
            _ => ItemKind::Directory,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            Delta::DeleteLocalFile { .. }
                | Delta::DeleteLocalDirectory { .. }
                | Delta::DeleteRemoteFile { .. }
                | Delta::DeleteRemoteDirectory { .. }
        )
    }

    /// `(from, to)` for renames and moves.
    pub fn relocation(&self) -> Option<(&SyncPath, &SyncPath)> {
        match self {
            Delta::RenameLocalFile { from, to }
            | Delta::RenameLocalDirectory { from, to }
            | Delta::MoveLocalFile { from, to }
            | Delta::MoveLocalDirectory { from, to }
            | Delta::RenameRemoteFile { from, to }
            | Delta::RenameRemoteDirectory { from, to }
            | Delta::MoveRemoteFile { from, to }
            | Delta::MoveRemoteDirectory { from, to } => Some((from, to)),
            _ => None,
        }
    }

    /// The path the delta acts on: the destination for renames and moves.
    pub fn path(&self) -> &SyncPath {
        match self {
            Delta::UploadFile { path }
            | Delta::DownloadFile { path }
            | Delta::CreateLocalDirectory { path }
            | Delta::CreateRemoteDirectory { path }
            | Delta::DeleteLocalFile { path }
            | Delta::DeleteRemoteFile { path }
            | Delta::DeleteLocalDirectory { path }
            | Delta::DeleteRemoteDirectory { path } => path,
            Delta::RenameLocalFile { to, .. }
            | Delta::RenameLocalDirectory { to, .. }
            | Delta::MoveLocalFile { to, .. }
            | Delta::MoveLocalDirectory { to, .. }
            | Delta::RenameRemoteFile { to, .. }
            | Delta::RenameRemoteDirectory { to, .. }
            | Delta::MoveRemoteFile { to, .. }
            | Delta::MoveRemoteDirectory { to, .. } => to,
        }
    }

    /// Rewrite the pre-change path of this delta after `from` was relocated
    /// to `to` on the same side.
    ///
    /// Only paths naming where an item used to live are rewritten: the
    /// source of a rename or move and the target of a delete. Creations
    /// already address the new layout.
    pub fn rebase_source(&self, from: &SyncPath, to: &SyncPath) -> Delta {
        let mut delta = self.clone();
        match &mut delta {
            Delta::DeleteLocalFile { path }
            | Delta::DeleteLocalDirectory { path }
            | Delta::DeleteRemoteFile { path }
            | Delta::DeleteRemoteDirectory { path } => {
                if let Some(rebased) = path.rebase(from, to) {
                    *path = rebased;
                }
            }
            Delta::RenameLocalFile { from: src, .. }
            | Delta::RenameLocalDirectory { from: src, .. }
            | Delta::MoveLocalFile { from: src, .. }
            | Delta::MoveLocalDirectory { from: src, .. }
            | Delta::RenameRemoteFile { from: src, .. }
            | Delta::RenameRemoteDirectory { from: src, .. }
            | Delta::MoveRemoteFile { from: src, .. }
            | Delta::MoveRemoteDirectory { from: src, .. } => {
                if let Some(rebased) = src.rebase(from, to) {
                    *src = rebased;
                }
            }
            _ => {}
        }
        delta
    }

    pub fn name(&self) -> &'static str {
        match self {
            Delta::UploadFile { .. } => "uploadFile",
            Delta::DownloadFile { .. } => "downloadFile",
            Delta::CreateLocalDirectory { .. } => "createLocalDirectory",
            Delta::CreateRemoteDirectory { .. } => "createRemoteDirectory",
            Delta::DeleteLocalFile { .. } => "deleteLocalFile",
            Delta::DeleteRemoteFile { .. } => "deleteRemoteFile",
            Delta::DeleteLocalDirectory { .. } => "deleteLocalDirectory",
            Delta::DeleteRemoteDirectory { .. } => "deleteRemoteDirectory",
            Delta::RenameLocalFile { .. } => "renameLocalFile",
            Delta::RenameLocalDirectory { .. } => "renameLocalDirectory",
            Delta::MoveLocalFile { .. } => "moveLocalFile",
            Delta::MoveLocalDirectory { .. } => "moveLocalDirectory",
            Delta::RenameRemoteFile { .. } => "renameRemoteFile",
            Delta::RenameRemoteDirectory { .. } => "renameRemoteDirectory",
            Delta::MoveRemoteFile { .. } => "moveRemoteFile",
            Delta::MoveRemoteDirectory { .. } => "moveRemoteDirectory",
        }
    }
}

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relocation() {
            Some((from, to)) => write!(f, "{} {} -> {}", self.name(), from, to),
            None => write!(f, "{} {}", self.name(), self.path()),
        }
    }
}

/// The four trees a cycle compares.
#[derive(Debug, Clone, Default)]
pub struct Snapshots {
    pub current_local: LocalTree,
    pub current_remote: RemoteTree,
    pub previous_local: LocalTree,
    pub previous_remote: RemoteTree,
}

/// A path holding a file on one side and a directory on the other.
///
/// Neither side is touched at such a path until one of them changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeClash {
    pub path: SyncPath,
    pub local: ItemKind,
    pub remote: ItemKind,
}

/// Result of comparing snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Comparison {
    pub deltas: Vec<Delta>,
    /// Paths skipped because the two sides disagree on their kind.
    pub clashes: Vec<TypeClash>,
}

/// Turns snapshots into an ordered list of deltas.
///
/// Never mutates its inputs: the same snapshots, hashes and file contents
/// always produce the same list.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeltaComputer;

impl DeltaComputer {
    pub fn new() -> Self {
        Self
    }

    pub async fn compute(
        &self,
        snapshots: &Snapshots,
        hashes: &FileHashes,
        hasher: &dyn ContentHasher,
    ) -> Vec<Delta> {
        self.compare(snapshots, hashes, hasher).await.deltas
    }

    /// [`compute`](Self::compute), also reporting type clashes.
    pub async fn compare(
        &self,
        snapshots: &Snapshots,
        hashes: &FileHashes,
        hasher: &dyn ContentHasher,
    ) -> Comparison {
        let Snapshots {
            current_local,
            current_remote,
            previous_local,
            previous_remote,
        } = snapshots;

        let mut claimed: HashSet<SyncPath> = HashSet::new();
        let mut deltas = Vec::new();
        let mut clashes = Vec::new();

        // 1 and 2: identity tracking. A local relocation is replayed on the
        // remote side and vice versa.
        track_identities(previous_local, current_local, Side::Remote, &mut claimed, &mut deltas);
        track_identities(previous_remote, current_remote, Side::Local, &mut claimed, &mut deltas);

        // 3: local deletions.
        for path in vanished(previous_local, current_local) {
            if claimed.contains(path) {
                continue;
            }
            if let Some(remote) = current_remote.get(path) {
                claimed.insert(path.clone());
                deltas.push(Delta::delete(Side::Remote, remote.kind, path.clone()));
            }
        }

        // 4: remote deletions.
        for path in vanished(previous_remote, current_remote) {
            if claimed.contains(path) {
                continue;
            }
            if let Some(local) = current_local.get(path) {
                claimed.insert(path.clone());
                deltas.push(Delta::delete(Side::Local, local.kind, path.clone()));
            }
        }

        // 5: local additions and content changes.
        for local in current_local.iter() {
            let path = &local.path;
            if claimed.contains(path) {
                continue;
            }
            match current_remote.get(path) {
                None => {
                    claimed.insert(path.clone());
                    deltas.push(match local.kind {
                        ItemKind::Directory => Delta::CreateRemoteDirectory { path: path.clone() },
                        ItemKind::File => Delta::UploadFile { path: path.clone() },
                    });
                }
                Some(remote) if remote.kind != local.kind => {
                    warn!(
                        path = %path,
                        local = %local.kind,
                        remote = %remote.kind,
                        "Type clash between local and remote item, skipping"
                    );
                    claimed.insert(path.clone());
                    clashes.push(TypeClash {
                        path: path.clone(),
                        local: local.kind,
                        remote: remote.kind,
                    });
                }
                Some(remote)
                    if local.kind == ItemKind::File && local.last_modified > remote.last_modified =>
                {
                    match hasher.hash(path).await {
                        Ok(hash) if hashes.get(path) == Some(&hash) => {
                            debug!(path = %path, "Modification time changed but content did not");
                        }
                        Ok(_) => {
                            claimed.insert(path.clone());
                            deltas.push(Delta::UploadFile { path: path.clone() });
                        }
                        Err(e) => {
                            warn!(path = %path, "Could not hash local file: {}", e);
                            claimed.insert(path.clone());
                        }
                    }
                }
                Some(_) => {}
            }
        }

        // 6: remote additions and content changes.
        for remote in current_remote.iter() {
            let path = &remote.path;
            if claimed.contains(path) {
                continue;
            }
            match current_local.get(path) {
                None => {
                    claimed.insert(path.clone());
                    deltas.push(match remote.kind {
                        ItemKind::Directory => Delta::CreateLocalDirectory { path: path.clone() },
                        ItemKind::File => Delta::DownloadFile { path: path.clone() },
                    });
                }
                Some(local)
                    if remote.kind == ItemKind::File
                        && local.kind == ItemKind::File
                        && remote.last_modified > local.last_modified =>
                {
                    claimed.insert(path.clone());
                    deltas.push(Delta::DownloadFile { path: path.clone() });
                }
                Some(_) => {}
            }
        }

        drop_subsumed_deletions(&mut deltas);
        deltas.sort();
        Comparison { deltas, clashes }
    }
}

/// Paths present in `previous` but gone from `current`.
fn vanished<'a, T: TreeItem>(previous: &'a Tree<T>, current: &'a Tree<T>) -> impl Iterator<Item = &'a SyncPath> {
    previous
        .iter()
        .map(|item| item.path())
        .filter(move |path| !current.contains(path))
}

struct Relocation<'a> {
    from: &'a SyncPath,
    to: &'a SyncPath,
    kind: ItemKind,
    moved: bool,
    renamed: bool,
}

fn track_identities<T: TreeItem>(
    previous: &Tree<T>,
    current: &Tree<T>,
    replay_on: Side,
    claimed: &mut HashSet<SyncPath>,
    deltas: &mut Vec<Delta>,
) {
    let mut relocations = Vec::new();
    for now in current.iter() {
        let Some(before) = previous.get_by_id(&now.id()) else {
            continue;
        };
        if before.path() == now.path() || !before.same_item(now) {
            continue;
        }
        if claimed.contains(before.path()) || claimed.contains(now.path()) {
            continue;
        }
        relocations.push(Relocation {
            from: before.path(),
            to: now.path(),
            kind: now.kind(),
            moved: previous.parent_id(before.path()) != current.parent_id(now.path()),
            renamed: before.path().name() != now.path().name(),
        });
    }

    for relocation in &relocations {
        claimed.insert(relocation.from.clone());
        claimed.insert(relocation.to.clone());

        // Same parent and same name: only an ancestor moved.
        if !relocation.moved && !relocation.renamed {
            continue;
        }
        let explained = relocations.iter().any(|ancestor| {
            ancestor.kind == ItemKind::Directory
                && relocation.from.is_descendant_of(ancestor.from)
                && relocation.from.rebase(ancestor.from, ancestor.to).as_ref() == Some(relocation.to)
        });
        if explained {
            continue;
        }
        deltas.push(Delta::relocate(
            replay_on,
            relocation.kind,
            relocation.moved,
            relocation.from.clone(),
            relocation.to.clone(),
        ));
    }
}

/// Drop deletions covered by the deletion of an ancestor on the same side.
fn drop_subsumed_deletions(deltas: &mut Vec<Delta>) {
    let deleted: Vec<(Side, SyncPath)> = deltas
        .iter()
        .filter(|d| d.is_delete())
        .map(|d| (d.side(), d.path().clone()))
        .collect();

    deltas.retain(|delta| {
        !delta.is_delete()
            || !deleted
                .iter()
                .any(|(side, path)| *side == delta.side() && delta.path().is_descendant_of(path))
    });
}
