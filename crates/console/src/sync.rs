// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-instance session synchronization.
//!
//! Session mutations are announced twice: on the store's in-page channel and
//! on a [`SessionBus`] shared with other instances of the same profile. The
//! sync task re-derives the login state from storage whenever either fires.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::login::LoginMachine;
use crate::session::SessionStore;

/// What happened to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    LoggedIn,
    Refreshed,
    LoggedOut,
    /// Cleared after an irrecoverable refresh failure.
    Expired,
    /// Local copy reloaded after another instance wrote storage.
    Synced,
}

/// Notification carried on the in-page channel and the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// An instance mutated the session.
    Updated { origin: String, change: ChangeKind },
    /// The backing storage changed underneath us (another process).
    StorageChanged,
}

impl SessionEvent {
    pub fn updated(origin: &str, change: ChangeKind) -> Self {
        Self::Updated { origin: origin.to_owned(), change }
    }

    /// Whether this event was emitted by `origin` itself.
    pub fn is_from(&self, origin: &str) -> bool {
        matches!(self, Self::Updated { origin: o, .. } if o == origin)
    }
}

/// Pub/sub port between console instances.
pub trait SessionBus: Send + Sync {
    fn publish(&self, event: SessionEvent);

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}

/// In-process bus. Clones share one channel.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBus for MemoryBus {
    fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

/// Bus backed by the session file: other processes are observed through
/// filesystem events on that file, with an mtime poll as fallback.
pub struct FileWatchBus {
    tx: broadcast::Sender<SessionEvent>,
    _watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl FileWatchBus {
    /// Start watching `path`. The poll task stops when `shutdown` fires.
    pub fn spawn(path: PathBuf, poll_interval: Duration, shutdown: CancellationToken) -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        let watcher = setup_notify_watcher(&path, tx.clone());
        if watcher.is_none() {
            debug!(path = %path.display(), "file watcher unavailable, polling only");
        }

        let poll_tx = tx.clone();
        tokio::spawn(async move {
            let mut last = modified_at(&path);
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let current = modified_at(&path);
                if current != last {
                    last = current;
                    let _ = poll_tx.send(SessionEvent::StorageChanged);
                }
            }
        });

        Arc::new(Self { tx, _watcher: Mutex::new(watcher) })
    }
}

impl SessionBus for FileWatchBus {
    fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

/// Watch the parent directory so creation and atomic renames are seen.
/// Returns the watcher handle (must be kept alive).
fn setup_notify_watcher(
    path: &Path,
    tx: broadcast::Sender<SessionEvent>,
) -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let file_name = path.file_name()?.to_owned();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let Ok(event) = res else { return };
        if event.kind.is_access() {
            return;
        }
        if event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
            let _ = tx.send(SessionEvent::StorageChanged);
        }
    })
    .ok()?;

    let watch_path = path.parent().filter(|p| !p.as_os_str().is_empty())?;
    std::fs::create_dir_all(watch_path).ok()?;
    watcher.watch(watch_path, RecursiveMode::NonRecursive).ok()?;

    Some(watcher)
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Keep `machine` consistent with the shared session.
///
/// In-page events only re-derive the login state; bus events from other
/// instances first reload the store from storage.
pub fn spawn_session_sync(
    store: Arc<SessionStore>,
    bus: Arc<dyn SessionBus>,
    machine: Arc<LoginMachine>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut local_rx = store.subscribe_local();
    let mut bus_rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = local_rx.recv() => match event {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => machine.resync(),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = bus_rx.recv() => match event {
                    Ok(ev) if ev.is_from(store.origin()) => {}
                    Ok(ev) => {
                        debug!(origin = %store.origin(), ?ev, "session event from peer");
                        // Resync even when the reload found nothing new.
                        store.rehydrate();
                        machine.resync();
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        store.rehydrate();
                        machine.resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

#[cfg(test)]
#[path = "sync_tests.rs"]
mod tests;
