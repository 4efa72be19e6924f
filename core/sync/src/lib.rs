//! VaultSync reconciliation engine
//!
//! Keeps a local directory and a remote encrypted store in step:
//! - Tree snapshots of both sides, indexed by path and by identity
//! - Delta computation inferring renames, moves, deletions and edits
//! - Wave-ordered task execution against local and remote adapters
//! - State folding and crash-safe persistence between cycles
//! - A debounced, self-rescheduling loop per pair

pub mod adapter;
pub mod config;
pub mod delta;
pub mod engine;
pub mod executor;
pub mod ignore;
pub mod local;
pub mod reconcile;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod signal;
pub mod state;
pub mod tree;
pub mod watcher;

// Re-export main types
pub use adapter::{ContentHasher, LocalAdapter, RemoteAdapter, Transferred};
pub use config::{PairConfig, StoreConfig, SyncConfig, SyncMode};
pub use delta::{Comparison, Delta, DeltaComputer, Side, Snapshots, TypeClash};
pub use engine::{CycleReport, PairStatus, SyncPair};
pub use executor::{
    DoneTask, Evidence, ExecutionReport, TaskExecutor, TaskFailure, PARKING_PREFIX,
};
pub use ignore::{IgnoreRules, IGNORE_FILE};
pub use local::{LocalFs, DOWNLOAD_STAGING_DIR, LOCAL_TRASH_DIR};
pub use reconcile::StateReconciler;
pub use remote::RemoteFs;
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncLoop, SyncLoopHandle, SyncPhase};
pub use signal::ChangeSignal;
pub use state::{StateStore, SyncState, STATE_VERSION};
pub use tree::{
    ContentHash, FileHashes, LocalItem, LocalTree, RemoteFileMeta, RemoteItem, RemoteTree, Tree,
    TreeItem,
};
pub use watcher::LocalWatcher;
