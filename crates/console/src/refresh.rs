// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-flight refresh-token exchange.
//!
//! At most one exchange is in flight per session. Callers that arrive while
//! it runs are queued and all receive the same outcome. The exchange runs on
//! its own task, so a caller that stops waiting cannot abort it and leave the
//! queue stranded.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::api::types::RefreshResponse;
use crate::error::{AuthError, ErrorKind};
use crate::session::SessionStore;
use crate::sync::ChangeKind;

/// Performs the refresh-token exchange. Object-safe so the coordinator does
/// not depend on a particular HTTP client.
pub trait RefreshExchange: Send + Sync + 'static {
    fn exchange<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshResponse, AuthError>> + Send + 'a>>;
}

/// Invoked once per irrecoverable refresh failure, after the session is cleared.
pub type RedirectHook = Arc<dyn Fn(&AuthError) + Send + Sync>;

type Waiter = oneshot::Sender<Result<String, AuthError>>;

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    waiters: Vec<Waiter>,
}

pub struct RefreshCoordinator {
    store: Arc<SessionStore>,
    exchange: Arc<dyn RefreshExchange>,
    state: Mutex<RefreshState>,
    redirect: Mutex<Option<RedirectHook>>,
    exchanges: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<SessionStore>, exchange: Arc<dyn RefreshExchange>) -> Arc<Self> {
        Arc::new(Self {
            store,
            exchange,
            state: Mutex::new(RefreshState::default()),
            redirect: Mutex::new(None),
            exchanges: AtomicU64::new(0),
        })
    }

    /// Register the "redirect to login" side effect.
    pub fn set_redirect_hook(&self, hook: RedirectHook) {
        *self.redirect.lock() = Some(hook);
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.lock().refreshing
    }

    /// Number of exchanges started since creation.
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    /// Return a freshly exchanged access token, joining the in-flight
    /// exchange when there is one.
    pub async fn ensure_fresh_token(self: &Arc<Self>) -> Result<String, AuthError> {
        self.join(None).await
    }

    /// Like [`Self::ensure_fresh_token`], but when no exchange is running and
    /// the stored access token is no longer `seen`, return the stored token
    /// instead of exchanging again.
    pub async fn refresh_replacing(self: &Arc<Self>, seen: &str) -> Result<String, AuthError> {
        self.join(Some(seen)).await
    }

    async fn join(self: &Arc<Self>, seen: Option<&str>) -> Result<String, AuthError> {
        let (tx, rx) = oneshot::channel();
        let lead = {
            let mut state = self.state.lock();
            if !state.refreshing {
                let current = self.store.access_token();
                if let Some(current) = current.filter(|c| seen.is_some_and(|s| s != c)) {
                    debug!("access token already replaced, skipping exchange");
                    return Ok(current);
                }
            }
            state.waiters.push(tx);
            if state.refreshing {
                debug!(waiters = state.waiters.len(), "refresh in flight, queued");
                false
            } else {
                state.refreshing = true;
                true
            }
        };

        if lead {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_exchange().await;
            });
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(AuthError::new(ErrorKind::Unexpected, "refresh ended without a result")),
        }
    }

    async fn run_exchange(&self) {
        let mut guard = ReleaseOnDrop { coordinator: self, armed: true };
        let outcome = self.exchange_once().await;
        guard.armed = false;
        self.settle(outcome);
    }

    /// Exchange the stored refresh token, returning it alongside the outcome.
    async fn exchange_once(&self) -> Result<(String, RefreshResponse), AuthError> {
        let Some(refresh_token) = self.store.refresh_token() else {
            return Err(AuthError::new(ErrorKind::RefreshExpired, "no refresh token available"));
        };
        self.exchanges.fetch_add(1, Ordering::Relaxed);
        let resp = self.exchange.exchange(&refresh_token).await?;
        Ok((refresh_token, resp))
    }

    /// Persist the outcome, then resolve or reject every waiter.
    fn settle(&self, outcome: Result<(String, RefreshResponse), AuthError>) {
        let mut redirect = false;
        let result = match outcome {
            Ok((used, resp)) => {
                let access = resp.access_token.clone();
                if self.store.apply_refresh(&used, resp.access_token, resp.refresh_token) {
                    info!("access token refreshed");
                    Ok(access)
                } else {
                    // Logged out or replaced while the exchange ran; the
                    // refreshed pair belongs to a session that no longer exists.
                    warn!("session changed during refresh, result discarded");
                    Err(AuthError::new(ErrorKind::RefreshExpired, "session ended during refresh"))
                }
            }
            Err(e) if e.kind().ends_session() => {
                warn!(err = %e, "refresh rejected, clearing session");
                self.store.clear(ChangeKind::Expired);
                redirect = true;
                Err(e)
            }
            Err(e) => {
                warn!(err = %e, "refresh failed, session kept");
                Err(e)
            }
        };

        let waiters = self.release();

        if let (true, Err(e)) = (redirect, &result) {
            let hook = self.redirect.lock().clone();
            if let Some(hook) = hook {
                hook(e);
            }
        }

        debug!(waiters = waiters.len(), ok = result.is_ok(), "refresh settled");
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Reset the in-flight flag and hand back the queue in one step.
    fn release(&self) -> Vec<Waiter> {
        let mut state = self.state.lock();
        state.refreshing = false;
        std::mem::take(&mut state.waiters)
    }
}

/// Rejects queued waiters if the exchange task unwinds before settling.
struct ReleaseOnDrop<'a> {
    coordinator: &'a RefreshCoordinator,
    armed: bool,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let err = AuthError::new(ErrorKind::Unexpected, "refresh exchange aborted");
        for waiter in self.coordinator.release() {
            let _ = waiter.send(Err(err.clone()));
        }
    }
}

#[cfg(test)]
#[path = "refresh_tests.rs"]
mod tests;
