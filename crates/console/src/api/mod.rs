// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP client for the authentication endpoints.
//!
//! These calls never carry the session's bearer token and never go through
//! the refresh-on-401 path.

pub mod types;

use std::future::Future;
use std::pin::Pin;
use std::sync::Once;
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::api::types::{
    EnableRequest, EnrollmentMaterial, LoginRequest, LoginResponse, RefreshRequest,
    RefreshResponse, SetupRequest, TokenResponse, VerifyRequest,
};
use crate::error::{AuthError, EndpointClass};
use crate::refresh::RefreshExchange;

/// Paths of the authentication endpoints, relative to the API base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEndpoints {
    pub login: String,
    pub verify_2fa: String,
    pub setup_2fa_temp: String,
    pub enable_2fa_temp: String,
    pub refresh: String,
    pub logout: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            login: "/auth/login".to_owned(),
            verify_2fa: "/auth/verify-2fa".to_owned(),
            setup_2fa_temp: "/auth/2fa/setup-temp".to_owned(),
            enable_2fa_temp: "/auth/2fa/enable-temp".to_owned(),
            refresh: "/auth/refresh".to_owned(),
            logout: "/auth/logout".to_owned(),
        }
    }
}

impl AuthEndpoints {
    /// Whether `path` (query string ignored) is one of the auth endpoints.
    pub fn is_auth_path(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
        [
            &self.login,
            &self.verify_2fa,
            &self.setup_2fa_temp,
            &self.enable_2fa_temp,
            &self.refresh,
            &self.logout,
        ]
        .iter()
        .any(|p| p.trim_end_matches('/') == path)
    }
}

static CRYPTO_INIT: Once = Once::new();

/// Install the rustls crypto provider (needed for reqwest even on plain HTTP).
pub fn ensure_crypto_provider() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Client for the authentication endpoints.
pub struct AuthApi {
    base_url: String,
    endpoints: AuthEndpoints,
    client: Client,
}

impl AuthApi {
    /// Every call carries the fixed `timeout`.
    pub fn new(
        base_url: impl Into<String>,
        endpoints: AuthEndpoints,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        ensure_crypto_provider();
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Ok(Self { base_url, endpoints, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }

    /// Shared HTTP client (same timeout) for the request pipeline.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Password step.
    ///
    /// A 401/403 whose body still announces `requires_2fa` is a transition,
    /// not a failure.
    pub async fn login(&self, req: &LoginRequest) -> Result<LoginResponse, AuthError> {
        let (status, body) = self.post(&self.endpoints.login, req).await?;
        if (200..300).contains(&status) {
            return serde_json::from_slice(&body).map_err(|e| AuthError::malformed(&e));
        }
        if matches!(status, 401 | 403) {
            if let Ok(resp) = serde_json::from_slice::<LoginResponse>(&body) {
                if resp.requires_2fa {
                    return Ok(resp);
                }
            }
        }
        Err(AuthError::from_status(EndpointClass::Login, status, &body))
    }

    pub async fn verify_two_factor(&self, req: &VerifyRequest) -> Result<TokenResponse, AuthError> {
        self.post_json(&self.endpoints.verify_2fa, req, EndpointClass::TwoFactor).await
    }

    /// Exchange a temp token for enrollment material.
    pub async fn setup_two_factor(&self, temp_token: &str) -> Result<EnrollmentMaterial, AuthError> {
        let req = SetupRequest { temp_token: temp_token.to_owned() };
        self.post_json(&self.endpoints.setup_2fa_temp, &req, EndpointClass::TwoFactor).await
    }

    pub async fn enable_two_factor(&self, req: &EnableRequest) -> Result<TokenResponse, AuthError> {
        self.post_json(&self.endpoints.enable_2fa_temp, req, EndpointClass::TwoFactor).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, AuthError> {
        let req = RefreshRequest { refresh_token: refresh_token.to_owned() };
        self.post_json(&self.endpoints.refresh, &req, EndpointClass::Refresh).await
    }

    /// Best-effort server-side logout. Failures are logged and ignored.
    pub async fn logout(&self, access_token: Option<&str>) {
        let mut req = self.client.post(self.url(&self.endpoints.logout));
        if let Some(token) = access_token {
            req = req.bearer_auth(token);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => debug!(status = resp.status().as_u16(), "logout rejected, ignoring"),
            Err(e) => debug!(err = %e, "logout failed, ignoring"),
        }
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        class: EndpointClass,
    ) -> Result<T, AuthError> {
        let (status, bytes) = self.post(path, body).await?;
        if !(200..300).contains(&status) {
            return Err(AuthError::from_status(class, status, &bytes));
        }
        serde_json::from_slice(&bytes).map_err(|e| AuthError::malformed(&e))
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(u16, bytes::Bytes), AuthError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| AuthError::network(&e))?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.map_err(|e| AuthError::network(&e))?;
        debug!(path, status, "auth endpoint replied");
        Ok((status, bytes))
    }
}

impl RefreshExchange for AuthApi {
    fn exchange<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshResponse, AuthError>> + Send + 'a>> {
        Box::pin(self.refresh(refresh_token))
    }
}

#[cfg(test)]
#[path = "api_tests.rs"]
mod tests;
