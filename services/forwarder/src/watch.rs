//! Rules-file change notification.
//!
//! Create, write, rename, and permission-change events on the rules
//! file are all treated uniformly as one "reconcile now" signal; the
//! reconciler's fallback timer covers anything the watcher misses.

use std::path::Path;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Start watching the rules file.
///
/// Returns the watcher handle — the watch stops when it is dropped, so
/// the caller keeps it alive for the process lifetime — and the signal
/// receiver for the reconciler.
pub fn spawn_rules_watcher(
    path: &Path,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>), notify::Error> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if event.kind.is_create() || event.kind.is_modify() {
                    let _ = tx.send(());
                }
            }
            Err(e) => error!(error = %e, "rules watch error"),
        },
        notify::Config::default(),
    )?;

    watcher.watch(path, RecursiveMode::NonRecursive)?;
    info!(path = ?path, "rules watcher started");

    Ok((watcher, rx))
}
