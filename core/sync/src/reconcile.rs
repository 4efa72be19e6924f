//! Folds completed tasks into the trees scanned this cycle.

use std::cmp::Reverse;
use tracing::debug;

use crate::delta::{Delta, Side};
use crate::executor::{DoneTask, Evidence, TaskFailure};
use crate::state::SyncState;
use crate::tree::{purge_hashes, rekey_hashes, FileHashes, LocalTree, RemoteTree, Tree, TreeItem};

/// Depth a done task is folded at.
///
/// Renames and moves fold at the depth of their source so a child's own
/// rename is applied before its parent's rewrites the prefix it lives under.
fn fold_depth(delta: &Delta) -> usize {
    match delta.relocation() {
        Some((from, _)) => from.depth(),
        None => delta.path().depth(),
    }
}

/// Applies done tasks to sync state.
pub struct StateReconciler;

impl StateReconciler {
    /// Fold `done` into `state`, deepest tasks first.
    ///
    /// `state` holds the trees scanned this cycle together with the
    /// recorded hashes; the result is the baseline for the next cycle.
    /// Relocations sharing a source depth fold as one batch, which is what
    /// lets two items that traded names keep their identities.
    pub fn fold(state: SyncState, mut done: Vec<DoneTask>) -> SyncState {
        let SyncState {
            mut local,
            mut remote,
            mut hashes,
        } = state;

        done.sort_by_key(|task| {
            (
                Reverse(fold_depth(&task.delta)),
                task.delta.relocation().is_none(),
            )
        });

        let mut tasks = done.into_iter().peekable();
        while let Some(task) = tasks.next() {
            if let Some((from, _)) = task.delta.relocation() {
                let depth = from.depth();
                let mut batch = vec![task];
                while let Some(next) = tasks.next_if(|next| {
                    next.delta
                        .relocation()
                        .is_some_and(|(from, _)| from.depth() == depth)
                }) {
                    batch.push(next);
                }
                relocate(&mut local, &mut remote, &mut hashes, &batch);
                continue;
            }

            let DoneTask { delta, evidence } = task;
            if delta.is_delete() {
                let path = delta.path();
                match delta.side() {
                    Side::Local => {
                        local.remove_subtree(path);
                    }
                    Side::Remote => {
                        remote.remove_subtree(path);
                    }
                }
                purge_hashes(&mut hashes, path);
                continue;
            }
            match evidence {
                Evidence::RemoteCreated(item) => {
                    remote.insert(item);
                }
                Evidence::Uploaded(sent) => {
                    hashes.insert(sent.item.path.clone(), sent.hash);
                    remote.insert(sent.item);
                }
                Evidence::LocalCreated(item) => {
                    local.insert(item);
                }
                Evidence::Downloaded(got) => {
                    hashes.insert(got.item.path.clone(), got.hash);
                    local.insert(got.item);
                }
                Evidence::Applied => {}
            }
        }

        SyncState {
            local,
            remote,
            hashes,
        }
    }

    /// Keep the change behind each failed task visible to the next cycle.
    ///
    /// A failed delta replays a change seen on the opposite side. When the
    /// delta can still succeed, that side's baseline is put back the way it
    /// was for the affected paths, so the next comparison detects the same
    /// change again instead of reading the unsynced difference as a fresh
    /// addition.
    ///
    /// A delta that can no longer succeed (its source is gone from the side
    /// it mutates, or its destination is taken there) is not carried: both
    /// baselines stay as scanned and the next comparison settles the paths
    /// as plain additions and deletions.
    pub fn carry_failures(
        mut state: SyncState,
        failures: &[TaskFailure],
        previous_local: &LocalTree,
        previous_remote: &RemoteTree,
    ) -> SyncState {
        for failure in failures {
            let delta = &failure.delta;
            let carried = match delta.side() {
                Side::Remote => {
                    can_retry(&state.remote, delta)
                        && restore(&mut state.local, previous_local, delta)
                }
                Side::Local => {
                    can_retry(&state.local, delta)
                        && restore(&mut state.remote, previous_remote, delta)
                }
            };
            if !carried {
                debug!(task = %delta, "Not carrying failed task into the next cycle");
            }
        }
        state
    }
}

/// Fold one batch of same-depth relocations.
fn relocate(local: &mut LocalTree, remote: &mut RemoteTree, hashes: &mut FileHashes, batch: &[DoneTask]) {
    let mut local_moves = Vec::new();
    let mut remote_moves = Vec::new();
    for task in batch {
        if let Some((from, to)) = task.delta.relocation() {
            let step = (from.clone(), to.clone());
            match task.delta.side() {
                Side::Local => local_moves.push(step),
                Side::Remote => remote_moves.push(step),
            }
        }
    }
    local.relocate_all(&local_moves);
    remote.relocate_all(&remote_moves);

    local_moves.extend(remote_moves);
    rekey_hashes(hashes, &local_moves);
}

/// Whether `delta` could still succeed against `target`, the tree of the
/// side it mutates.
fn can_retry<T: TreeItem>(target: &Tree<T>, delta: &Delta) -> bool {
    match delta.relocation() {
        Some((from, to)) => target.contains(from) && !target.contains(to),
        None => delta.is_delete() && target.contains(delta.path()),
    }
}

fn restore<T: TreeItem>(baseline: &mut Tree<T>, previous: &Tree<T>, delta: &Delta) -> bool {
    if let Some((from, to)) = delta.relocation() {
        baseline.rename_subtree(to, from);
        true
    } else if delta.is_delete() {
        let path = delta.path();
        for item in previous.subtree(path) {
            baseline.insert(item.clone());
        }
        true
    } else {
        false
    }
}
