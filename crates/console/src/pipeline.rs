// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound request pipeline.
//!
//! Non-auth calls get a proactive refresh when the stored token is about to
//! expire, carry the current bearer token, and are replayed once after a
//! reactive refresh on 401/403. Auth endpoints pass straight through.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::api::AuthApi;
use crate::error::{AuthError, EndpointClass, ErrorKind};
use crate::refresh::RefreshCoordinator;
use crate::session::SessionStore;
use crate::token::TokenInspector;

/// An outbound call captured so it can be replayed exactly once.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    retried: bool,
}

impl PendingRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), headers: HeaderMap::new(), body: None, retried: false }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Attach a JSON body.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, AuthError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| AuthError::new(ErrorKind::Unexpected, format!("unserializable body: {e}")))?;
        self.headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    pub fn header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }
}

/// A 2xx reply.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AuthError> {
        serde_json::from_slice(&self.body).map_err(|e| AuthError::malformed(&e))
    }
}

pub struct RequestPipeline {
    api: Arc<AuthApi>,
    store: Arc<SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
    inspector: TokenInspector,
}

impl RequestPipeline {
    pub fn new(
        api: Arc<AuthApi>,
        store: Arc<SessionStore>,
        coordinator: Arc<RefreshCoordinator>,
        inspector: TokenInspector,
    ) -> Self {
        Self { api, store, coordinator, inspector }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Send `req`, refreshing and replaying as needed.
    ///
    /// Non-2xx replies come back as [`AuthError`]; a reply that never
    /// arrived is [`ErrorKind::Network`] and never triggers a refresh.
    pub async fn send(&self, mut req: PendingRequest) -> Result<ApiResponse, AuthError> {
        if self.api.endpoints().is_auth_path(&req.path) {
            let (status, headers, body) = self.dispatch(&req, None).await?;
            return into_response(status, headers, body);
        }

        let token = self.outbound_token().await;
        let (status, headers, body) = self.dispatch(&req, token.as_deref()).await?;
        if !matches!(status, 401 | 403) || req.retried {
            return into_response(status, headers, body);
        }

        req.retried = true;
        let original = AuthError::from_status(EndpointClass::Api, status, &body);
        if self.store.refresh_token().is_none() {
            return Err(original);
        }
        let recovered = match token.as_deref() {
            Some(sent) => self.coordinator.refresh_replacing(sent).await,
            None => self.coordinator.ensure_fresh_token().await,
        };
        let fresh = match recovered {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(path = %req.path, status, err = %e, "reactive refresh failed");
                return Err(original);
            }
        };

        debug!(path = %req.path, status, "replaying after refresh");
        let (status, headers, body) = self.dispatch(&req, Some(&fresh)).await?;
        into_response(status, headers, body)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuthError> {
        self.send(PendingRequest::get(path)).await?.json()
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, AuthError> {
        self.send(PendingRequest::new(Method::POST, path).json(body)?).await?.json()
    }

    pub async fn put_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, AuthError> {
        self.send(PendingRequest::new(Method::PUT, path).json(body)?).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, AuthError> {
        self.send(PendingRequest::new(Method::DELETE, path)).await
    }

    /// Token to attach, after a best-effort proactive refresh.
    async fn outbound_token(&self) -> Option<String> {
        let token = self.store.access_token();
        if !self.inspector.is_expired(token.as_deref()) || self.store.refresh_token().is_none() {
            return token;
        }
        let refreshed = match token.as_deref() {
            Some(seen) => self.coordinator.refresh_replacing(seen).await,
            None => self.coordinator.ensure_fresh_token().await,
        };
        match refreshed {
            Ok(fresh) => Some(fresh),
            Err(e) => {
                debug!(err = %e, "proactive refresh failed, sending anyway");
                self.store.access_token()
            }
        }
    }

    async fn dispatch(
        &self,
        req: &PendingRequest,
        token: Option<&str>,
    ) -> Result<(u16, HeaderMap, Bytes), AuthError> {
        let mut builder = self
            .api
            .client()
            .request(req.method.clone(), self.api.url(&req.path))
            .headers(req.headers.clone());
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = req.body {
            builder = builder.body(body.clone());
        }
        let resp = builder.send().await.map_err(|e| AuthError::network(&e))?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| AuthError::network(&e))?;
        debug!(method = %req.method, path = %req.path, status, retried = req.retried, "api replied");
        Ok((status, headers, body))
    }
}

fn into_response(status: u16, headers: HeaderMap, body: Bytes) -> Result<ApiResponse, AuthError> {
    if (200..300).contains(&status) {
        Ok(ApiResponse { status, headers, body })
    } else {
        Err(AuthError::from_status(EndpointClass::Api, status, &body))
    }
}
