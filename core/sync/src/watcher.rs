//! Filesystem watcher feeding the change signal.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use vaultsync_common::{Error, Result};

use crate::local::{DOWNLOAD_STAGING_DIR, LOCAL_TRASH_DIR};
use crate::signal::ChangeSignal;

/// Keeps a recursive watch on a local root alive.
///
/// Events are not interpreted; any event touching a path outside the
/// reserved directories just bumps the pair's [`ChangeSignal`].
pub struct LocalWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl LocalWatcher {
    pub fn start(root: impl AsRef<Path>, signal: Arc<ChangeSignal>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let watch_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_relevant(&watch_root, &event) {
                    signal.touch();
                }
            }
            Err(e) => warn!("Watch error: {}", e),
        })
        .map_err(watch_error)?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(watch_error)?;

        debug!("Watching {:?}", root);
        Ok(Self {
            _watcher: watcher,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn watch_error(e: notify::Error) -> Error {
    Error::Io(std::io::Error::other(e))
}

fn is_relevant(root: &Path, event: &Event) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|path| !is_reserved(root, path))
}

fn is_reserved(root: &Path, path: &Path) -> bool {
    match path.strip_prefix(root) {
        Ok(relative) => relative
            .components()
            .next()
            .is_some_and(|first| {
                first.as_os_str() == LOCAL_TRASH_DIR || first.as_os_str() == DOWNLOAD_STAGING_DIR
            }),
        Err(_) => false,
    }
}
