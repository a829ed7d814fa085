//! ConfigWatcher - hot-reloads the rule set on file changes
//!
//! Bridges the `notify` filesystem watcher into the tokio world: raw events
//! are forwarded over an mpsc channel, debounced (editors tend to produce
//! bursts of writes and renames), then the file is re-read, re-validated and
//! published as a new generation. A rejected reload keeps the previous
//! generation active.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::config;
use crate::store::ConfigStore;

/// Quiet period after the first filesystem event before reloading.
const DEBOUNCE: Duration = Duration::from_millis(250);

/// Handle that keeps the watcher alive; dropping it stops watching.
pub struct WatcherHandle {
    shutdown_tx: mpsc::Sender<()>,

    // the notify watcher stops when dropped
    _watcher: RecommendedWatcher,
}

impl WatcherHandle {
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Watch `path` and publish every valid change to `store`.
///
/// Watches the parent directory rather than the file itself so that
/// replace-by-rename (the usual editor save strategy) is observed too.
pub fn spawn(path: PathBuf, store: Arc<ConfigStore>) -> Result<WatcherHandle> {
    let (event_tx, event_rx) = mpsc::channel::<Event>(64);

    let mut watcher = RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| {
            if let Ok(event) = result {
                // blocking_send: we are on the notify worker thread here
                let _ = event_tx.blocking_send(event);
            }
        },
        notify::Config::default(),
    )
    .context("failed to create filesystem watcher")?;

    let watch_root = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    watcher
        .watch(watch_root, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", watch_root.display()))?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(watch_loop(path, store, event_rx, shutdown_rx));

    Ok(WatcherHandle { shutdown_tx, _watcher: watcher })
}

#[instrument(skip_all, fields(config = %path.display()))]
async fn watch_loop(
    path: PathBuf,
    store: Arc<ConfigStore>,
    mut event_rx: mpsc::Receiver<Event>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    debug!("starting config watcher");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                if !is_relevant(&event, &path) {
                    continue;
                }
                trace!("config file changed: {:?}", event.kind);

                // debounce: swallow the rest of the burst
                tokio::time::sleep(DEBOUNCE).await;
                while event_rx.try_recv().is_ok() {}

                reload(&path, &store);
            }

            _ = shutdown_rx.recv() => break,

            else => break,
        }
    }

    debug!("config watcher stopped");
}

fn is_relevant(event: &Event, config_path: &Path) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|p| p.file_name() == config_path.file_name())
}

/// Re-read and re-validate the config file, then swap the generation.
///
/// Every failure path leaves the previously active generation in place.
fn reload(path: &Path, store: &ConfigStore) {
    let config = match config::read_config_file(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("ignoring config change, file could not be read: {e:#}");
            return;
        }
    };

    match store.publish(&config.rules) {
        Ok(seq) => {
            info!(
                "published config generation {seq} ({} rules)",
                config.rules.len()
            );
        }
        Err(e) => {
            warn!("config reload rejected, keeping previous generation: {e}");
        }
    }
}
