// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::session::persist::MemoryStorage;
use crate::session::{AuthenticatedUser, Tokens};
use crate::session::persist::SessionStorage;
use crate::sync::MemoryBus;

use super::*;

/// Exchange that blocks until the test releases a permit.
struct GatedExchange {
    gate: Semaphore,
    calls: AtomicUsize,
    outcome: Result<RefreshResponse, AuthError>,
}

impl GatedExchange {
    fn new(outcome: Result<RefreshResponse, AuthError>) -> Arc<Self> {
        Arc::new(Self { gate: Semaphore::new(0), calls: AtomicUsize::new(0), outcome })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RefreshExchange for GatedExchange {
    fn exchange<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshResponse, AuthError>> + Send + 'a>> {
        Box::pin(async move {
            assert_eq!(refresh_token, "R1");
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await;
            self.outcome.clone()
        })
    }
}

fn seeded_store() -> Arc<SessionStore> {
    let store = SessionStore::new(Arc::new(MemoryStorage::new()), Arc::new(MemoryBus::new()));
    store.populate(
        Tokens { access_token: "stale".into(), refresh_token: Some("R1".into()) },
        Some(AuthenticatedUser { username: "admin".into(), ..Default::default() }),
    );
    store
}

fn fresh(access: &str, refresh: Option<&str>) -> Result<RefreshResponse, AuthError> {
    Ok(RefreshResponse { access_token: access.into(), refresh_token: refresh.map(String::from) })
}

async fn wait_until_refreshing(coordinator: &RefreshCoordinator) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !coordinator.is_refreshing() {
            tokio::task::yield_now().await;
        }
    })
    .await?;
    Ok(())
}

async fn wait_until_exchanging(exchange: &GatedExchange) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(2), async {
        while exchange.calls() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_callers_share_one_exchange() -> anyhow::Result<()> {
    let store = seeded_store();
    let exchange = GatedExchange::new(fresh("A2", Some("R2")));
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), exchange.clone());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let c = Arc::clone(&coordinator);
        handles.push(tokio::spawn(async move { c.ensure_fresh_token().await }));
    }
    wait_until_refreshing(&coordinator).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    exchange.gate.add_permits(1);

    for handle in handles {
        assert_eq!(handle.await?, Ok("A2".to_owned()));
    }
    assert_eq!(exchange.calls(), 1);
    assert_eq!(coordinator.exchange_count(), 1);
    assert!(!coordinator.is_refreshing());
    assert_eq!(store.access_token().as_deref(), Some("A2"));
    assert_eq!(store.refresh_token().as_deref(), Some("R2"));
    assert_eq!(store.user().map(|u| u.username).as_deref(), Some("admin"));
    Ok(())
}

#[tokio::test]
async fn missing_rotated_refresh_token_keeps_previous() -> anyhow::Result<()> {
    let store = seeded_store();
    let exchange = GatedExchange::new(fresh("A2", None));
    exchange.gate.add_permits(1);
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), exchange);

    assert_eq!(coordinator.ensure_fresh_token().await, Ok("A2".to_owned()));
    assert_eq!(store.refresh_token().as_deref(), Some("R1"));
    Ok(())
}

#[tokio::test]
async fn rejection_clears_session_and_redirects_once() -> anyhow::Result<()> {
    let store = seeded_store();
    let rejection = AuthError::new(ErrorKind::RefreshExpired, "refresh token revoked").with_status(401);
    let exchange = GatedExchange::new(Err(rejection.clone()));
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), exchange.clone());

    let redirects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&redirects);
    coordinator.set_redirect_hook(Arc::new(move |_: &AuthError| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let c = Arc::clone(&coordinator);
        handles.push(tokio::spawn(async move { c.ensure_fresh_token().await }));
    }
    wait_until_refreshing(&coordinator).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    exchange.gate.add_permits(1);

    for handle in handles {
        assert_eq!(handle.await?, Err(rejection.clone()));
    }
    assert_eq!(exchange.calls(), 1);
    assert_eq!(redirects.load(Ordering::SeqCst), 1);
    let session = store.snapshot();
    assert!(session.tokens.is_none());
    assert!(session.user.is_none());
    Ok(())
}

#[tokio::test]
async fn network_failure_keeps_session() -> anyhow::Result<()> {
    let store = seeded_store();
    let exchange = GatedExchange::new(Err(AuthError::new(ErrorKind::Network, "request timed out")));
    exchange.gate.add_permits(1);
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), exchange);

    let redirects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&redirects);
    coordinator.set_redirect_hook(Arc::new(move |_: &AuthError| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let err = coordinator.ensure_fresh_token().await.err();
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Network));
    assert_eq!(redirects.load(Ordering::SeqCst), 0);
    assert_eq!(store.access_token().as_deref(), Some("stale"));
    assert_eq!(store.refresh_token().as_deref(), Some("R1"));
    Ok(())
}

#[tokio::test]
async fn no_refresh_token_expires_session_without_exchange() -> anyhow::Result<()> {
    let store = SessionStore::new(Arc::new(MemoryStorage::new()), Arc::new(MemoryBus::new()));
    store.populate(Tokens { access_token: "A1".into(), refresh_token: None }, None);
    let exchange = GatedExchange::new(fresh("A2", None));
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), exchange.clone());

    let err = coordinator.ensure_fresh_token().await.err();
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::RefreshExpired));
    assert_eq!(exchange.calls(), 0);
    assert!(!store.is_authenticated());
    Ok(())
}

#[tokio::test]
async fn later_caller_starts_a_new_exchange() -> anyhow::Result<()> {
    let store = seeded_store();
    let exchange = GatedExchange::new(fresh("A2", Some("R1")));
    exchange.gate.add_permits(2);
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), exchange.clone());

    assert!(coordinator.ensure_fresh_token().await.is_ok());
    assert!(coordinator.ensure_fresh_token().await.is_ok());
    assert_eq!(exchange.calls(), 2);
    Ok(())
}

#[tokio::test]
async fn dropped_caller_does_not_strand_the_queue() -> anyhow::Result<()> {
    let store = seeded_store();
    let exchange = GatedExchange::new(fresh("A2", Some("R2")));
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), exchange.clone());

    let leader = {
        let c = Arc::clone(&coordinator);
        tokio::spawn(async move { c.ensure_fresh_token().await })
    };
    wait_until_refreshing(&coordinator).await?;
    let follower = {
        let c = Arc::clone(&coordinator);
        tokio::spawn(async move { c.ensure_fresh_token().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    leader.abort();
    exchange.gate.add_permits(1);

    assert_eq!(follower.await?, Ok("A2".to_owned()));
    assert_eq!(exchange.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn replaced_token_is_returned_without_exchange() -> anyhow::Result<()> {
    let store = seeded_store();
    let exchange = GatedExchange::new(fresh("A3", None));
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), exchange.clone());

    assert!(store.apply_refresh("R1", "A2".into(), None));

    assert_eq!(coordinator.refresh_replacing("stale").await, Ok("A2".to_owned()));
    assert_eq!(exchange.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn unchanged_token_is_exchanged() -> anyhow::Result<()> {
    let store = seeded_store();
    let exchange = GatedExchange::new(fresh("A2", None));
    exchange.gate.add_permits(1);
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), exchange.clone());

    assert_eq!(coordinator.refresh_replacing("stale").await, Ok("A2".to_owned()));
    assert_eq!(exchange.calls(), 1);
    Ok(())
}

#[yare::parameterized(
    local_logout = { false },
    peer_logout = { true },
)]
#[test_macro(tokio::test)]
async fn logout_during_refresh_is_not_undone(from_peer: bool) {
    let storage = MemoryStorage::new();
    let store = SessionStore::new(Arc::new(storage.clone()), Arc::new(MemoryBus::new()));
    store.populate(
        Tokens { access_token: "stale".into(), refresh_token: Some("R1".into()) },
        Some(AuthenticatedUser { username: "admin".into(), ..Default::default() }),
    );
    let exchange = GatedExchange::new(fresh("A2", Some("R2")));
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), exchange.clone());
    let redirects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&redirects);
    coordinator.set_redirect_hook(Arc::new(move |_: &AuthError| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let pending = {
        let c = Arc::clone(&coordinator);
        tokio::spawn(async move { c.ensure_fresh_token().await })
    };
    assert!(wait_until_exchanging(&exchange).await.is_ok());
    if from_peer {
        assert!(storage.clear().is_ok());
        assert!(store.rehydrate());
    } else {
        store.clear(ChangeKind::LoggedOut);
    }
    exchange.gate.add_permits(1);

    let result = pending.await.ok().and_then(Result::err);
    assert_eq!(result.map(|e| e.kind()), Some(ErrorKind::RefreshExpired));
    assert_eq!(exchange.calls(), 1);
    assert!(!store.is_authenticated());
    assert!(store.snapshot().user.is_none());
    assert_eq!(storage.load().ok().flatten(), None);
    assert_eq!(redirects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn login_during_refresh_keeps_the_new_session() -> anyhow::Result<()> {
    let store = seeded_store();
    let exchange = GatedExchange::new(fresh("A2", Some("R2")));
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), exchange.clone());

    let pending = {
        let c = Arc::clone(&coordinator);
        tokio::spawn(async move { c.ensure_fresh_token().await })
    };
    wait_until_exchanging(&exchange).await?;
    store.clear(ChangeKind::LoggedOut);
    store.populate(Tokens { access_token: "B1".into(), refresh_token: Some("S1".into()) }, None);
    exchange.gate.add_permits(1);

    assert!(pending.await?.is_err());
    assert_eq!(store.access_token().as_deref(), Some("B1"));
    assert_eq!(store.refresh_token().as_deref(), Some("S1"));
    Ok(())
}
