//! The long-lived loop driving one pair.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::engine::SyncPair;

/// Where a pair's loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Idle,
    /// Waiting for local changes to settle.
    DebounceWait,
    Scanning,
    Diffing,
    Executing,
    Reconciling,
    Persisting,
    Paused,
    Stopped,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::DebounceWait => "debounce-wait",
            SyncPhase::Scanning => "scanning",
            SyncPhase::Diffing => "diffing",
            SyncPhase::Executing => "executing",
            SyncPhase::Reconciling => "reconciling",
            SyncPhase::Persisting => "persisting",
            SyncPhase::Paused => "paused",
            SyncPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct Control {
    paused: AtomicBool,
    stopped: AtomicBool,
    force_remote: AtomicBool,
    wake: Notify,
}

/// Runs cycles for one pair until stopped.
///
/// Each iteration checks whether the pair is paused or stopped, waits until
/// local changes have been quiet for the debounce window, runs a cycle and
/// sleeps for the interval. Errors and panics inside a cycle are logged and
/// the loop carries on.
pub struct SyncLoop {
    pair: Arc<SyncPair>,
    control: Arc<Control>,
    debounce: Duration,
    interval: Duration,
}

impl SyncLoop {
    /// Start the loop on the current tokio runtime.
    pub fn spawn(pair: Arc<SyncPair>, debounce: Duration, interval: Duration) -> SyncLoopHandle {
        let control = Arc::new(Control::default());
        control
            .paused
            .store(pair.phase() == SyncPhase::Paused, Ordering::SeqCst);

        let sync_loop = SyncLoop {
            pair: pair.clone(),
            control: control.clone(),
            debounce,
            interval,
        };
        let task = tokio::spawn(sync_loop.run());

        SyncLoopHandle {
            pair,
            control,
            task,
        }
    }

    async fn run(self) {
        info!(pair = %self.pair.id(), "Sync loop started");

        loop {
            if self.control.stopped.load(Ordering::SeqCst) {
                break;
            }
            if self.control.paused.load(Ordering::SeqCst) {
                self.pair.set_phase(SyncPhase::Paused);
                self.control.wake.notified().await;
                continue;
            }
            if let Some(remaining) = self.pair.signal().remaining_quiet(self.debounce) {
                self.pair.set_phase(SyncPhase::DebounceWait);
                tokio::select! {
                    _ = sleep(remaining) => {}
                    _ = self.control.wake.notified() => {}
                }
                continue;
            }

            let force_remote = self.control.force_remote.swap(false, Ordering::SeqCst);
            match AssertUnwindSafe(self.pair.run_cycle(force_remote))
                .catch_unwind()
                .await
            {
                Ok(Ok(report)) => {
                    if !report.failures.is_empty() {
                        warn!(
                            pair = %self.pair.id(),
                            "{} tasks failed, retrying next cycle",
                            report.failures.len()
                        );
                    }
                }
                Ok(Err(e)) => error!(pair = %self.pair.id(), "Sync cycle failed: {}", e),
                Err(panic) => error!(
                    pair = %self.pair.id(),
                    "Sync cycle panicked: {}",
                    panic_message(panic.as_ref())
                ),
            }
            self.pair.set_phase(SyncPhase::Idle);

            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = self.control.wake.notified() => {
                    debug!(pair = %self.pair.id(), "Sync loop woken early");
                }
            }
        }

        self.pair.set_phase(SyncPhase::Stopped);
        info!(pair = %self.pair.id(), "Sync loop stopped");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Controls a running [`SyncLoop`].
pub struct SyncLoopHandle {
    pair: Arc<SyncPair>,
    control: Arc<Control>,
    task: JoinHandle<()>,
}

impl SyncLoopHandle {
    pub fn pair(&self) -> &Arc<SyncPair> {
        &self.pair
    }

    pub fn phase(&self) -> SyncPhase {
        self.pair.phase()
    }

    pub fn is_paused(&self) -> bool {
        self.control.paused.load(Ordering::SeqCst)
    }

    /// Stop starting new cycles; a running cycle completes.
    pub fn pause(&self) {
        self.control.paused.store(true, Ordering::SeqCst);
        self.control.wake.notify_one();
    }

    pub fn resume(&self) {
        self.control.paused.store(false, Ordering::SeqCst);
        self.control.wake.notify_one();
    }

    /// Run the next cycle without waiting for the interval, refreshing the
    /// remote listing. Local changes still have to settle first.
    pub fn trigger(&self) {
        self.control.force_remote.store(true, Ordering::SeqCst);
        self.control.wake.notify_one();
    }

    /// Stop the loop and wait for it to exit; a running cycle completes.
    pub async fn stop(self) {
        self.control.stopped.store(true, Ordering::SeqCst);
        self.control.wake.notify_one();
        if let Err(e) = self.task.await {
            error!(pair = %self.pair.id(), "Sync loop task failed: {}", e);
        }
    }
}
