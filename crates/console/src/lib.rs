// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod login;
pub mod pipeline;
pub mod refresh;
pub mod session;
pub mod sync;
pub mod token;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::AuthApi;
use crate::config::{ConsoleConfig, ConsoleOptions};
use crate::login::LoginMachine;
use crate::pipeline::RequestPipeline;
use crate::refresh::{RedirectHook, RefreshCoordinator};
use crate::session::persist::{FileStorage, SessionStorage};
use crate::session::SessionStore;
use crate::sync::{spawn_session_sync, FileWatchBus, SessionBus};
use crate::token::TokenInspector;

/// One console instance: session store, refresh coordinator, request
/// pipeline and login machine wired to a shared storage and bus.
pub struct Console {
    pub api: Arc<AuthApi>,
    pub store: Arc<SessionStore>,
    pub coordinator: Arc<RefreshCoordinator>,
    pub pipeline: RequestPipeline,
    pub login: Arc<LoginMachine>,
    shutdown: CancellationToken,
    sync_task: JoinHandle<()>,
}

impl Console {
    /// File-backed instance for the configured state directory.
    pub fn new(config: &ConsoleConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let shutdown = shutdown.child_token();
        let storage = FileStorage::in_dir(&config.state_dir());
        let path = storage
            .path()
            .map(std::path::Path::to_path_buf)
            .ok_or_else(|| anyhow::anyhow!("file storage without a path"))?;
        let bus = FileWatchBus::spawn(path, config.sync_poll(), shutdown.clone());
        Self::with_parts(config.options(), Arc::new(storage), bus, shutdown)
    }

    /// Build from explicit ports. Instances sharing `storage` and `bus` act
    /// as tabs of one profile. [`Console::shutdown`] cancels `shutdown`.
    pub fn with_parts(
        options: ConsoleOptions,
        storage: Arc<dyn SessionStorage>,
        bus: Arc<dyn SessionBus>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let api = Arc::new(AuthApi::new(options.api_url, options.endpoints, options.timeout)?);
        let store = SessionStore::new(storage, Arc::clone(&bus));
        let coordinator = RefreshCoordinator::new(Arc::clone(&store), api.clone());
        let pipeline = RequestPipeline::new(
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&coordinator),
            TokenInspector::new(options.refresh_margin_secs),
        );
        let login = LoginMachine::new(Arc::clone(&api), Arc::clone(&store), options.enrollment_fallback);
        let sync_task = spawn_session_sync(Arc::clone(&store), bus, Arc::clone(&login), shutdown.clone());
        tracing::debug!(origin = %store.origin(), authenticated = store.is_authenticated(), "console ready");
        Ok(Self { api, store, coordinator, pipeline, login, shutdown, sync_task })
    }

    /// Register the "redirect to login" side effect.
    pub fn on_redirect(&self, hook: RedirectHook) {
        self.coordinator.set_redirect_hook(hook);
    }

    /// Stop background sync and wait for it.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.sync_task.await;
    }
}
