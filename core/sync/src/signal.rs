//! Coalesced "something changed locally" signal.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared change notification for one sync pair.
///
/// Every watcher event and every local mutation performed by the adapters
/// collapses into two numbers: a generation counter and the time of the
/// most recent change.
#[derive(Debug, Default)]
pub struct ChangeSignal {
    generation: AtomicU64,
    last_change_ms: AtomicU64,
}

impl ChangeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change now.
    pub fn touch(&self) {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_change_ms.store(now, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Milliseconds since the Unix epoch of the last change, 0 if none.
    pub fn last_change_ms(&self) -> u64 {
        self.last_change_ms.load(Ordering::SeqCst)
    }

    /// How much longer to wait before `window` has passed without changes.
    ///
    /// Returns `None` once the signal has been quiet for the whole window.
    pub fn remaining_quiet(&self, window: Duration) -> Option<Duration> {
        let last = self.last_change_ms();
        if last == 0 {
            return None;
        }
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let elapsed = now.saturating_sub(last);
        let window_ms = window.as_millis() as u64;
        (elapsed < window_ms).then(|| Duration::from_millis(window_ms - elapsed))
    }
}
