//! One sync pair and its reconciliation cycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use vaultsync_common::{Error, Result};
use vaultsync_storage::CloudStore;

use crate::adapter::{ContentHasher, LocalAdapter, RemoteAdapter};
use crate::config::{PairConfig, SyncConfig, SyncMode};
use crate::delta::{Delta, DeltaComputer, Snapshots, TypeClash};
use crate::executor::{TaskExecutor, TaskFailure};
use crate::ignore::IgnoreRules;
use crate::local::LocalFs;
use crate::reconcile::StateReconciler;
use crate::remote::RemoteFs;
use crate::retry::RetryConfig;
use crate::scheduler::SyncPhase;
use crate::signal::ChangeSignal;
use crate::state::{StateStore, SyncState};

/// Outcome of one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Deltas computed before the mode filter.
    pub computed: usize,
    /// Deltas dropped by the pair's mode.
    pub skipped: usize,
    /// Deltas carried out.
    pub done: usize,
    pub failures: Vec<TaskFailure>,
    /// Paths left alone because one side holds a file and the other a
    /// directory.
    pub clashes: Vec<TypeClash>,
    /// Whether the new state reached the disk.
    pub persisted: bool,
    pub duration: Duration,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.persisted
    }
}

/// Snapshot of a pair for status output.
#[derive(Debug, Clone)]
pub struct PairStatus {
    pub id: String,
    pub phase: SyncPhase,
    pub mode: SyncMode,
    pub local_items: usize,
    pub remote_items: usize,
    pub hashes: usize,
}

/// A local directory paired with a remote directory.
///
/// Owns the pair's baseline state exclusively. Cycles are serialized by the
/// state lock, so a pair never runs two at once.
pub struct SyncPair {
    id: String,
    local_root: PathBuf,
    local: Arc<dyn LocalAdapter>,
    hasher: Arc<dyn ContentHasher>,
    remote: Arc<dyn RemoteAdapter>,
    ignore: Arc<IgnoreRules>,
    signal: Arc<ChangeSignal>,
    store: StateStore,
    state: Mutex<SyncState>,
    mode: SyncMode,
    permanent_deletes: bool,
    phase: watch::Sender<SyncPhase>,
}

impl SyncPair {
    /// Open `pair` against `store` with the disk-backed adapters.
    ///
    /// Creates the local root if needed and, unless the pair names a remote
    /// directory id, resolves (and creates) `remote_path`.
    pub async fn open(
        config: &SyncConfig,
        pair: &PairConfig,
        store: Arc<dyn CloudStore>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&pair.local_path).await?;

        let signal = Arc::new(ChangeSignal::new());
        let ignore = Arc::new(IgnoreRules::new(&pair.local_path, &pair.ignore)?);
        let root_id = match &pair.remote_parent_id {
            Some(id) => id.clone(),
            None => RemoteFs::resolve_root(store.as_ref(), &pair.remote_path).await?,
        };
        debug!(pair = %pair.id, root_id = %root_id, "Resolved remote root");

        let remote = Arc::new(
            RemoteFs::new(store, root_id, &pair.local_path, signal.clone(), ignore.clone())
                .with_refresh(config.remote_refresh())
                .with_retry(RetryConfig::new(config.max_retries)),
        );
        let local = Arc::new(LocalFs::new(
            &pair.local_path,
            signal.clone(),
            ignore.clone(),
            remote.clone(),
        ));

        let state = StateStore::new(&config.db_path, &pair.id);
        Ok(Self::with_adapters(pair, state, local, remote, ignore, signal).await)
    }

    /// Assemble a pair from ready-made adapters and load its persisted state.
    pub async fn with_adapters<L, R>(
        pair: &PairConfig,
        store: StateStore,
        local: Arc<L>,
        remote: Arc<R>,
        ignore: Arc<IgnoreRules>,
        signal: Arc<ChangeSignal>,
    ) -> Self
    where
        L: LocalAdapter + 'static,
        R: RemoteAdapter + 'static,
    {
        let state = store.load().await;
        let (phase, _) = watch::channel(if pair.paused {
            SyncPhase::Paused
        } else {
            SyncPhase::Idle
        });

        Self {
            id: pair.id.clone(),
            local_root: pair.local_path.clone(),
            hasher: local.clone(),
            local,
            remote,
            ignore,
            signal,
            store,
            state: Mutex::new(state),
            mode: pair.mode,
            permanent_deletes: pair.permanent_deletes,
            phase,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// The signal local changes are reported through.
    pub fn signal(&self) -> Arc<ChangeSignal> {
        self.signal.clone()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub(crate) fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_replace(phase);
    }

    /// A copy of the current baseline.
    pub async fn state(&self) -> SyncState {
        self.state.lock().await.clone()
    }

    pub async fn status(&self) -> PairStatus {
        let state = self.state.lock().await;
        PairStatus {
            id: self.id.clone(),
            phase: self.phase(),
            mode: self.mode,
            local_items: state.local.len(),
            remote_items: state.remote.len(),
            hashes: state.hashes.len(),
        }
    }

    /// Compute what the next cycle would do without doing it.
    pub async fn plan(&self, force_remote: bool) -> Result<Vec<Delta>> {
        let state = self.state.lock().await;
        let snapshots = self.snapshots(&state, force_remote).await?;
        let deltas = DeltaComputer::new()
            .compute(&snapshots, &state.hashes, self.hasher.as_ref())
            .await;
        Ok(deltas.into_iter().filter(|d| self.mode.allows(d)).collect())
    }

    /// Run one full cycle: scan, diff, execute, reconcile and persist.
    ///
    /// # Errors
    /// - `Error::Scan` when either side could not be listed; the baseline is
    ///   left untouched
    ///
    /// Task and persistence failures do not fail the cycle; they are
    /// reported in the [`CycleReport`].
    pub async fn run_cycle(&self, force_remote: bool) -> Result<CycleReport> {
        let started = Instant::now();
        let mut state = self.state.lock().await;

        self.set_phase(SyncPhase::Scanning);
        let snapshots = self.snapshots(&state, force_remote).await?;

        self.set_phase(SyncPhase::Diffing);
        let comparison = DeltaComputer::new()
            .compare(&snapshots, &state.hashes, self.hasher.as_ref())
            .await;
        let total = comparison.deltas.len();
        let (deltas, skipped): (Vec<Delta>, Vec<Delta>) = comparison
            .deltas
            .into_iter()
            .partition(|d| self.mode.allows(d));
        if !skipped.is_empty() {
            debug!(pair = %self.id, mode = ?self.mode, "Mode skipped {} deltas", skipped.len());
        }

        self.set_phase(SyncPhase::Executing);
        let report = if deltas.is_empty() {
            Default::default()
        } else {
            info!(pair = %self.id, "Executing {} deltas", deltas.len());
            TaskExecutor::new(self.local.clone(), self.remote.clone(), self.permanent_deletes)
                .execute(deltas)
                .await
        };
        let done = report.done.len();

        self.set_phase(SyncPhase::Reconciling);
        let Snapshots {
            current_local,
            current_remote,
            previous_local,
            previous_remote,
        } = snapshots;
        let scanned = SyncState {
            local: current_local,
            remote: current_remote,
            hashes: std::mem::take(&mut state.hashes),
        };
        let folded = StateReconciler::fold(scanned, report.done);
        *state = StateReconciler::carry_failures(
            folded,
            &report.failures,
            &previous_local,
            &previous_remote,
        );

        self.set_phase(SyncPhase::Persisting);
        let persisted = match self.store.save(&state).await {
            Ok(()) => true,
            Err(e) => {
                warn!(pair = %self.id, "Failed to persist sync state: {}", e);
                false
            }
        };

        let report = CycleReport {
            computed: total,
            skipped: skipped.len(),
            done,
            failures: report.failures,
            clashes: comparison.clashes,
            persisted,
            duration: started.elapsed(),
        };
        if report.done > 0 || !report.failures.is_empty() {
            info!(
                pair = %self.id,
                done = report.done,
                failed = report.failures.len(),
                clashes = report.clashes.len(),
                "Cycle finished in {:?}",
                report.duration
            );
        } else {
            debug!(pair = %self.id, "Cycle finished, nothing to do");
        }
        Ok(report)
    }

    /// Scan both sides concurrently and pair them with the baseline.
    async fn snapshots(&self, state: &SyncState, force_remote: bool) -> Result<Snapshots> {
        if let Err(e) = self.ignore.reload().await {
            warn!(pair = %self.id, "Keeping previous ignore file rules: {}", e);
        }

        let (current_local, current_remote) =
            tokio::try_join!(self.local.scan(), self.remote.scan(force_remote)).map_err(|e| match e {
                Error::Scan(_) => e,
                other => Error::Scan(other.to_string()),
            })?;
        debug!(
            pair = %self.id,
            local = current_local.len(),
            remote = current_remote.len(),
            "Scanned both sides"
        );

        Ok(Snapshots {
            current_local,
            current_remote,
            previous_local: state.local.clone(),
            previous_remote: state.remote.clone(),
        })
    }
}
