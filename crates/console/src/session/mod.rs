// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session store: the single holder of access token, refresh token and the
//! cached user record for a profile.
//!
//! Every write replaces all three fields under one lock, persists, then
//! notifies in-page subscribers and the cross-instance bus. Storage I/O runs
//! after the swap, outside the read/write lock.

pub mod persist;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::session::persist::SessionStorage;
use crate::sync::{ChangeKind, SessionBus, SessionEvent};

/// Cached identity for display. Never used for authorization decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Long-lived credential pair issued on login, 2FA completion or refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for Tokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokens")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Persisted session. Empty when `tokens` is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Tokens>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<AuthenticatedUser>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_some()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.access_token.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.tokens.as_ref().and_then(|t| t.refresh_token.as_deref())
    }
}

/// Process-wide session holder for one console instance.
pub struct SessionStore {
    origin: String,
    inner: RwLock<Session>,
    /// Held across swap and persist so storage sees writes in commit order.
    writer: Mutex<()>,
    storage: Arc<dyn SessionStorage>,
    bus: Arc<dyn SessionBus>,
    local_tx: broadcast::Sender<SessionEvent>,
}

impl SessionStore {
    /// Create a store hydrated from `storage`.
    pub fn new(storage: Arc<dyn SessionStorage>, bus: Arc<dyn SessionBus>) -> Arc<Self> {
        let initial = load_or_empty(storage.as_ref());
        let (local_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            origin: uuid::Uuid::new_v4().to_string(),
            inner: RwLock::new(initial),
            writer: Mutex::new(()),
            storage,
            bus,
            local_tx,
        })
    }

    /// Identifier of this instance on the bus.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn snapshot(&self) -> Session {
        self.inner.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.read().access_token().map(str::to_owned)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.inner.read().refresh_token().map(str::to_owned)
    }

    pub fn user(&self) -> Option<AuthenticatedUser> {
        self.inner.read().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.read().is_authenticated()
    }

    /// Subscribe to in-page "session updated" signals.
    pub fn subscribe_local(&self) -> broadcast::Receiver<SessionEvent> {
        self.local_tx.subscribe()
    }

    /// Install a fresh session after login or 2FA completion.
    pub fn populate(&self, tokens: Tokens, user: Option<AuthenticatedUser>) {
        self.commit(ChangeKind::LoggedIn, |_| Some(Session { tokens: Some(tokens), user }));
    }

    /// Swap in refreshed tokens if the session still holds `used_refresh`,
    /// the refresh token the exchange was made with. A missing rotated
    /// refresh token keeps the current one. Returns `false` and changes
    /// nothing when the session was cleared or replaced in the meantime.
    pub fn apply_refresh(
        &self,
        used_refresh: &str,
        access_token: String,
        refresh_token: Option<String>,
    ) -> bool {
        self.commit(ChangeKind::Refreshed, |current| {
            let held = current.refresh_token()?;
            if held != used_refresh {
                return None;
            }
            let refresh_token = refresh_token.or_else(|| Some(held.to_owned()));
            Some(Session {
                tokens: Some(Tokens { access_token, refresh_token }),
                user: current.user.clone(),
            })
        })
    }

    /// Drop tokens and user together.
    pub fn clear(&self, change: ChangeKind) {
        self.commit(change, |_| Some(Session::default()));
    }

    /// Re-read storage after another instance changed it. Notifies in-page
    /// subscribers only when the session actually differs; never republishes
    /// on the bus.
    pub fn rehydrate(&self) -> bool {
        let changed = {
            let _writer = self.writer.lock();
            let loaded = load_or_empty(self.storage.as_ref());
            let mut guard = self.inner.write();
            if *guard == loaded {
                false
            } else {
                *guard = loaded;
                true
            }
        };
        if changed {
            debug!(origin = %self.origin, "session rehydrated from storage");
            let _ = self.local_tx.send(SessionEvent::updated(&self.origin, ChangeKind::Synced));
        }
        changed
    }

    /// Derive the next session from the current one and install it. Writers
    /// are serialized on `writer`; readers only wait for the swap, never for
    /// storage.
    fn commit(&self, change: ChangeKind, derive: impl FnOnce(&Session) -> Option<Session>) -> bool {
        {
            let _writer = self.writer.lock();
            let next = {
                let mut guard = self.inner.write();
                let Some(next) = derive(&*guard) else {
                    return false;
                };
                *guard = next.clone();
                next
            };
            let persisted = if next.is_authenticated() {
                self.storage.save(&next)
            } else {
                self.storage.clear()
            };
            if let Err(e) = persisted {
                warn!(err = %e, "failed to persist session");
            }
        }
        debug!(origin = %self.origin, ?change, "session updated");
        let event = SessionEvent::updated(&self.origin, change);
        let _ = self.local_tx.send(event.clone());
        self.bus.publish(event);
        true
    }
}

fn load_or_empty(storage: &dyn SessionStorage) -> Session {
    match storage.load() {
        Ok(session) => session.unwrap_or_default(),
        Err(e) => {
            warn!(err = %e, "unreadable persisted session, starting empty");
            Session::default()
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
