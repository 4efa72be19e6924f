//! Executes deltas against the adapters.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use vaultsync_common::{Error, ItemKind, Result, SyncPath};

use crate::adapter::{LocalAdapter, RemoteAdapter, Transferred};
use crate::delta::{Delta, Side};
use crate::tree::{LocalItem, RemoteItem};

/// What an operation left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evidence {
    /// Renames, moves and deletes: the delta itself says it all.
    Applied,
    LocalCreated(LocalItem),
    RemoteCreated(RemoteItem),
    Uploaded(Transferred<RemoteItem>),
    Downloaded(Transferred<LocalItem>),
}

/// A delta that was carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoneTask {
    /// The delta as computed, before any path rewriting.
    pub delta: Delta,
    pub evidence: Evidence,
}

/// A delta that could not be carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// The path the failing operation addressed.
    pub path: SyncPath,
    pub delta: Delta,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub done: Vec<DoneTask>,
    pub failures: Vec<TaskFailure>,
}

/// Name prefix of the temporary name an item is parked under while it
/// trades places with another.
pub const PARKING_PREFIX: &str = ".vaultsync-park-";

/// What a task waits for before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    /// The other task has finished, successfully or not.
    Settled(usize),
    /// The other task's source path is free.
    Vacated(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Pending,
    /// Moved aside under a temporary name, still to reach its destination.
    Parked,
    Settled,
}

struct Task {
    original: Delta,
    current: Delta,
    waits: Vec<Wait>,
    stage: Stage,
}

impl Task {
    fn new(delta: Delta) -> Self {
        Self {
            original: delta.clone(),
            current: delta,
            waits: Vec::new(),
            stage: Stage::Pending,
        }
    }
}

/// Work out which task waits for which, on the same side only.
///
/// - A task whose path lies beneath the path another task creates or
///   relocates to runs after it.
/// - When one relocation's source lies beneath another's, the inner one
///   runs first unless its destination also lies beneath the outer one's;
///   then it runs after, with its source rebased.
/// - A relocation onto a path another relocation moves away from runs
///   once that path is free.
fn link(tasks: &mut [Task]) {
    let targets: HashMap<(Side, SyncPath), usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, task)| ((task.current.side(), task.current.path().clone()), i))
        .collect();
    let sources: HashMap<(Side, SyncPath), usize> = tasks
        .iter()
        .enumerate()
        .filter_map(|(i, task)| {
            let (from, _) = task.current.relocation()?;
            Some(((task.current.side(), from.clone()), i))
        })
        .collect();
    let relocations: Vec<usize> = sources.values().copied().collect();

    let mut waits: Vec<Vec<Wait>> = vec![Vec::new(); tasks.len()];
    for (i, task) in tasks.iter().enumerate() {
        let side = task.current.side();
        let mut ancestor = task.current.path().parent();
        while let Some(path) = ancestor {
            if let Some(&j) = targets.get(&(side, path.clone())) {
                waits[i].push(Wait::Settled(j));
            }
            ancestor = path.parent();
        }

        let Some((from, to)) = task.current.relocation() else {
            continue;
        };
        if let Some(&j) = sources.get(&(side, to.clone())) {
            if j != i {
                waits[i].push(Wait::Vacated(j));
            }
        }
        for &j in &relocations {
            let outer = &tasks[j].current;
            let Some((outer_from, outer_to)) = outer.relocation() else {
                continue;
            };
            if outer.side() == side && from.is_descendant_of(outer_from) && !to.is_descendant_of(outer_to) {
                waits[j].push(Wait::Settled(i));
            }
        }
    }

    for (task, waits) in tasks.iter_mut().zip(waits) {
        task.waits = waits;
    }
}

fn is_ready(tasks: &[Task], i: usize) -> bool {
    tasks[i].stage != Stage::Settled
        && tasks[i].waits.iter().all(|wait| match *wait {
            Wait::Settled(j) => tasks[j].stage == Stage::Settled,
            Wait::Vacated(j) => tasks[j].stage != Stage::Pending,
        })
}

/// Runs deltas in dependency order.
///
/// Non-deleting deltas run in waves: every task whose prerequisites have
/// settled joins the next wave. Parents are created or relocated before
/// anything beneath them, and an item moved out of a directory leaves it
/// before the directory itself moves. Deletions form the last wave. All
/// deltas of a wave run concurrently and the wave settles completely
/// before the next one starts.
pub struct TaskExecutor {
    local: Arc<dyn LocalAdapter>,
    remote: Arc<dyn RemoteAdapter>,
    permanent_deletes: bool,
}

impl TaskExecutor {
    pub fn new(
        local: Arc<dyn LocalAdapter>,
        remote: Arc<dyn RemoteAdapter>,
        permanent_deletes: bool,
    ) -> Self {
        Self {
            local,
            remote,
            permanent_deletes,
        }
    }

    pub async fn execute(&self, deltas: Vec<Delta>) -> ExecutionReport {
        let (deletions, others): (Vec<Delta>, Vec<Delta>) =
            deltas.into_iter().partition(|delta| delta.is_delete());
        let mut tasks: Vec<Task> = others.into_iter().map(Task::new).collect();
        let mut deletions: Vec<Task> = deletions.into_iter().map(Task::new).collect();
        link(&mut tasks);

        let mut report = ExecutionReport::default();
        loop {
            let mut wave: Vec<usize> = (0..tasks.len()).filter(|&i| is_ready(&tasks, i)).collect();
            if wave.is_empty() {
                let open: Vec<usize> = (0..tasks.len())
                    .filter(|&i| tasks[i].stage != Stage::Settled)
                    .collect();
                if open.is_empty() {
                    break;
                }
                let blocked_on_name = open.iter().copied().find(|&i| {
                    tasks[i].stage == Stage::Pending
                        && tasks[i].current.relocation().is_some()
                        && tasks[i].waits.iter().any(|wait| matches!(wait, Wait::Vacated(_)))
                });
                if let Some(i) = blocked_on_name {
                    self.park(&mut tasks, &mut deletions, i, &mut report).await;
                    continue;
                }
                warn!("{} tasks wait on each other, running them together", open.len());
                wave = open;
            }
            self.run_wave(&mut tasks, &mut deletions, &wave, &mut report).await;
        }

        if !deletions.is_empty() {
            let wave: Vec<usize> = (0..deletions.len()).collect();
            self.run_wave(&mut deletions, &mut [], &wave, &mut report).await;
        }
        report
    }

    /// Run the tasks at `wave` concurrently and record how they ended.
    ///
    /// Completed relocations rebase the sources of every task still to run
    /// in `tasks` and `later` on the same side.
    async fn run_wave(
        &self,
        tasks: &mut [Task],
        later: &mut [Task],
        wave: &[usize],
        report: &mut ExecutionReport,
    ) {
        debug!("Running wave of {} tasks", wave.len());
        let results = join_all(wave.iter().map(|&i| self.run(&tasks[i].current))).await;

        let mut relocated: Vec<(Side, SyncPath, SyncPath)> = Vec::new();
        for (&i, result) in wave.iter().zip(results) {
            let task = &mut tasks[i];
            task.stage = Stage::Settled;
            match result {
                Ok(evidence) => {
                    if let Some((from, to)) = task.current.relocation() {
                        relocated.push((task.current.side(), from.clone(), to.clone()));
                    }
                    report.done.push(DoneTask {
                        delta: task.original.clone(),
                        evidence,
                    });
                }
                Err(e) => {
                    warn!(task = %task.current, "Task failed: {}", e);
                    report.failures.push(TaskFailure {
                        path: task.current.path().clone(),
                        delta: task.original.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        // Tasks still to run address items where they live now.
        for task in tasks.iter_mut().chain(later.iter_mut()) {
            if task.stage == Stage::Settled {
                continue;
            }
            for (side, from, to) in &relocated {
                if task.current.side() == *side {
                    task.current = task.current.rebase_source(from, to);
                }
            }
        }
    }

    /// Move the relocation at `i` aside under a temporary name in its
    /// source directory, freeing its source for the task waiting on it.
    async fn park(
        &self,
        tasks: &mut [Task],
        later: &mut [Task],
        i: usize,
        report: &mut ExecutionReport,
    ) {
        let delta = tasks[i].current.clone();
        let Some((from, to)) = delta.relocation() else {
            return;
        };
        let side = delta.side();
        let parked = from
            .name()
            .map(|name| format!("{}{}-{}", PARKING_PREFIX, Uuid::new_v4().simple(), name))
            .ok_or_else(|| Error::InvalidInput(format!("Cannot park {}", from)))
            .and_then(|name| from.with_name(&name));
        let aside = match parked {
            Ok(aside) => aside,
            Err(e) => {
                tasks[i].stage = Stage::Settled;
                report.failures.push(TaskFailure {
                    path: to.clone(),
                    delta: tasks[i].original.clone(),
                    message: e.to_string(),
                });
                return;
            }
        };

        debug!(from = %from, aside = %aside, "Parking item to free its name");
        let step = Delta::relocate(side, delta.kind(), false, from.clone(), aside.clone());
        if let Err(e) = self.run(&step).await {
            warn!(task = %delta, "Task failed: {}", e);
            tasks[i].stage = Stage::Settled;
            report.failures.push(TaskFailure {
                path: to.clone(),
                delta: tasks[i].original.clone(),
                message: e.to_string(),
            });
            return;
        }

        let moved = aside.parent() != to.parent();
        tasks[i].current = Delta::relocate(side, delta.kind(), moved, aside.clone(), to.clone());
        tasks[i].stage = Stage::Parked;
        for task in tasks.iter_mut().chain(later.iter_mut()) {
            if task.stage != Stage::Settled && task.current.side() == side {
                task.current = task.current.rebase_source(from, &aside);
            }
        }
    }

    async fn run(&self, delta: &Delta) -> Result<Evidence> {
        let permanent = self.permanent_deletes;
        match delta {
            Delta::UploadFile { path } => self.local.upload(path).await.map(Evidence::Uploaded),
            Delta::DownloadFile { path } => self.remote.download(path).await.map(Evidence::Downloaded),
            Delta::CreateLocalDirectory { path } => {
                self.local.mkdir(path).await.map(Evidence::LocalCreated)
            }
            Delta::CreateRemoteDirectory { path } => {
                self.remote.mkdir(path).await.map(Evidence::RemoteCreated)
            }
            Delta::DeleteLocalFile { path } | Delta::DeleteLocalDirectory { path } => {
                self.local.unlink(path, permanent).await?;
                Ok(Evidence::Applied)
            }
            Delta::DeleteRemoteFile { path } => {
                self.remote.unlink(path, ItemKind::File, permanent).await?;
                Ok(Evidence::Applied)
            }
            Delta::DeleteRemoteDirectory { path } => {
                self.remote.unlink(path, ItemKind::Directory, permanent).await?;
                Ok(Evidence::Applied)
            }
            Delta::RenameLocalFile { from, to }
            | Delta::RenameLocalDirectory { from, to }
            | Delta::MoveLocalFile { from, to }
            | Delta::MoveLocalDirectory { from, to } => {
                self.local.rename(from, to).await?;
                Ok(Evidence::Applied)
            }
            Delta::RenameRemoteFile { from, to }
            | Delta::RenameRemoteDirectory { from, to }
            | Delta::MoveRemoteFile { from, to }
            | Delta::MoveRemoteDirectory { from, to } => {
                self.remote.rename(from, to).await?;
                Ok(Evidence::Applied)
            }
        }
    }
}
