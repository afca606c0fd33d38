// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process admin API used by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use console_auth::config::ConsoleOptions;
use console_auth::session::persist::{MemoryStorage, SessionStorage};
use console_auth::session::{Session, Tokens};
use console_auth::sync::{MemoryBus, SessionBus};
use console_auth::Console;

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "right";
pub const LOCKED_USER: &str = "locked";
pub const TEMP_TOKEN: &str = "T1";
pub const CODE: &str = "123456";
pub const BACKUP_CODES: [&str; 2] = ["aaaa-1111", "bbbb-2222"];

/// How the password step answers a correct login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginMode {
    Direct,
    TwoFactor,
    /// 2FA required but no temp token issued.
    TwoFactorWithoutTemp,
    /// 2FA flags carried on a 401 reply.
    TwoFactorOn401,
    ForcedSetup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Rotate,
    /// Issue a new access token but no new refresh token.
    AccessOnly,
    Reject,
}

pub struct MockState {
    pub login_mode: Mutex<LoginMode>,
    pub refresh_mode: Mutex<RefreshMode>,
    pub refresh_delay: Mutex<Duration>,
    /// Applied to verify-2fa and enable-temp after the request is recorded.
    pub two_factor_delay: Mutex<Duration>,
    pub two_factor_calls: AtomicUsize,
    pub setup_fails: AtomicBool,
    pub reject_all: AtomicBool,
    pub login_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub broker_calls: AtomicUsize,
    /// Access tokens the protected routes accept.
    valid: Mutex<HashSet<String>>,
    refresh_tokens: Mutex<HashSet<String>>,
    /// `(path, bearer)` for every request seen.
    pub bearers: Mutex<Vec<(String, Option<String>)>>,
    pub last_verify: Mutex<Option<Value>>,
    pub last_enable: Mutex<Option<Value>>,
    seq: AtomicUsize,
}

impl MockState {
    fn new() -> Self {
        Self {
            login_mode: Mutex::new(LoginMode::Direct),
            refresh_mode: Mutex::new(RefreshMode::Rotate),
            refresh_delay: Mutex::new(Duration::ZERO),
            two_factor_delay: Mutex::new(Duration::ZERO),
            two_factor_calls: AtomicUsize::new(0),
            setup_fails: AtomicBool::new(false),
            reject_all: AtomicBool::new(false),
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            broker_calls: AtomicUsize::new(0),
            valid: Mutex::new(HashSet::new()),
            refresh_tokens: Mutex::new(HashSet::new()),
            bearers: Mutex::new(Vec::new()),
            last_verify: Mutex::new(None),
            last_enable: Mutex::new(None),
            seq: AtomicUsize::new(0),
        }
    }

    /// Mint an access token expiring `ttl_secs` from now. Registered as
    /// valid when `accepted`.
    pub fn issue_access(&self, ttl_secs: i64, accepted: bool) -> String {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let token = jwt(ttl_secs, n);
        if accepted {
            self.valid.lock().insert(token.clone());
        }
        token
    }

    pub fn issue_refresh(&self) -> String {
        let token = format!("R{}", self.seq.fetch_add(1, Ordering::SeqCst));
        self.refresh_tokens.lock().insert(token.clone());
        token
    }

    pub fn bearers_for(&self, path: &str) -> Vec<Option<String>> {
        self.bearers.lock().iter().filter(|(p, _)| p == path).map(|(_, b)| b.clone()).collect()
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn broker_calls(&self) -> usize {
        self.broker_calls.load(Ordering::SeqCst)
    }

    async fn two_factor_pause(&self) {
        self.two_factor_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.two_factor_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn token_reply(&self) -> Value {
        json!({
            "access_token": self.issue_access(3600, true),
            "refresh_token": self.issue_refresh(),
            "user": {"username": USERNAME, "email": "admin@example.com", "roles": ["superuser"]},
        })
    }

    fn record(&self, path: &str, headers: &HeaderMap) -> Option<String> {
        let bearer = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_owned);
        self.bearers.lock().push((path.to_owned(), bearer.clone()));
        bearer
    }
}

/// Unsigned JWT with an `exp` claim `ttl_secs` from now.
pub fn jwt(ttl_secs: i64, nonce: usize) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = json!({"sub": USERNAME, "exp": now + ttl_secs, "jti": nonce});
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2ln")
}

pub struct MockBackend {
    pub url: String,
    pub state: Arc<MockState>,
    shutdown: CancellationToken,
}

impl MockBackend {
    pub async fn start() -> anyhow::Result<Self> {
        let state = Arc::new(MockState::new());
        let api = Router::new()
            .route("/auth/login", post(login))
            .route("/auth/verify-2fa", post(verify))
            .route("/auth/2fa/setup-temp", post(setup))
            .route("/auth/2fa/enable-temp", post(enable))
            .route("/auth/refresh", post(refresh))
            .route("/auth/logout", post(logout))
            .route("/brokers", get(brokers))
            .route("/slow", get(slow));
        let router = Router::new().nest("/api", api).with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).with_graceful_shutdown(sd.cancelled_owned()).await;
        });

        Ok(Self { url: format!("http://{addr}/api"), state, shutdown })
    }

    pub fn options(&self) -> ConsoleOptions {
        let mut options = ConsoleOptions::new(self.url.clone());
        options.timeout = Duration::from_secs(2);
        options
    }

    /// A console sharing `storage` and `bus` with any sibling built from them.
    pub fn console(
        &self,
        storage: &MemoryStorage,
        bus: &MemoryBus,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<Console> {
        let storage: Arc<dyn SessionStorage> = Arc::new(storage.clone());
        let bus: Arc<dyn SessionBus> = Arc::new(bus.clone());
        Console::with_parts(self.options(), storage, bus, shutdown.child_token())
    }

    /// Seed `storage` with a session whose access token expires in
    /// `ttl_secs` and is (or is not) accepted by the server.
    pub fn seed(&self, storage: &MemoryStorage, ttl_secs: i64, accepted: bool) -> anyhow::Result<String> {
        let access = self.state.issue_access(ttl_secs, accepted);
        let refresh = self.state.issue_refresh();
        storage.save(&Session {
            tokens: Some(Tokens { access_token: access.clone(), refresh_token: Some(refresh) }),
            user: Some(console_auth::session::AuthenticatedUser {
                username: USERNAME.into(),
                ..Default::default()
            }),
        })?;
        Ok(access)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

type Shared = State<Arc<MockState>>;

fn error(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

async fn login(State(s): Shared, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    s.login_calls.fetch_add(1, Ordering::SeqCst);
    s.record("/auth/login", &headers);
    let username = body["username"].as_str().unwrap_or_default();
    let password = body["password"].as_str().unwrap_or_default();
    if username == LOCKED_USER {
        return error(StatusCode::FORBIDDEN, "Account disabled");
    }
    if username != USERNAME || password != PASSWORD {
        return error(StatusCode::UNAUTHORIZED, "Invalid credentials");
    }
    let mode = *s.login_mode.lock();
    match mode {
        LoginMode::Direct => Json(s.token_reply()).into_response(),
        LoginMode::TwoFactor => Json(json!({"requires_2fa": true, "temp_token": TEMP_TOKEN})).into_response(),
        LoginMode::TwoFactorWithoutTemp => Json(json!({"requires_2fa": true})).into_response(),
        LoginMode::TwoFactorOn401 => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"requires_2fa": true, "temp_token": TEMP_TOKEN, "detail": "2FA required"})),
        )
            .into_response(),
        LoginMode::ForcedSetup => Json(json!({
            "requires_2fa": true, "requires_2fa_setup": true, "temp_token": TEMP_TOKEN
        }))
        .into_response(),
    }
}

async fn verify(State(s): Shared, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    s.record("/auth/verify-2fa", &headers);
    *s.last_verify.lock() = Some(body.clone());
    s.two_factor_pause().await;
    let bound = body["temp_token"] == TEMP_TOKEN
        || (body["username"] == USERNAME && body["password"] == PASSWORD);
    if !bound || body["code"] != CODE {
        return error(StatusCode::UNAUTHORIZED, "Invalid 2FA code");
    }
    Json(s.token_reply()).into_response()
}

async fn setup(State(s): Shared, Json(body): Json<Value>) -> Response {
    if s.setup_fails.load(Ordering::SeqCst) || body["temp_token"] != TEMP_TOKEN {
        return error(StatusCode::BAD_REQUEST, "Temp token expired");
    }
    Json(json!({
        "secret": "JBSWY3DPEHPK3PXP",
        "qr_code_uri": "otpauth://totp/console:admin?secret=JBSWY3DPEHPK3PXP",
        "backup_codes": BACKUP_CODES,
    }))
    .into_response()
}

async fn enable(State(s): Shared, Json(body): Json<Value>) -> Response {
    *s.last_enable.lock() = Some(body.clone());
    s.two_factor_pause().await;
    if body["temp_token"] != TEMP_TOKEN || body["code"] != CODE {
        return error(StatusCode::BAD_REQUEST, "Invalid verification code");
    }
    Json(s.token_reply()).into_response()
}

async fn refresh(State(s): Shared, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    s.refresh_calls.fetch_add(1, Ordering::SeqCst);
    s.record("/auth/refresh", &headers);
    let delay = *s.refresh_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let presented = body["refresh_token"].as_str().unwrap_or_default();
    let mode = *s.refresh_mode.lock();
    if mode == RefreshMode::Reject || !s.refresh_tokens.lock().contains(presented) {
        return error(StatusCode::UNAUTHORIZED, "Refresh token revoked");
    }
    let access = s.issue_access(3600, true);
    match mode {
        RefreshMode::AccessOnly => Json(json!({ "access_token": access })).into_response(),
        _ => Json(json!({ "access_token": access, "refresh_token": s.issue_refresh() })).into_response(),
    }
}

async fn logout(State(s): Shared, headers: HeaderMap) -> Response {
    s.logout_calls.fetch_add(1, Ordering::SeqCst);
    s.record("/auth/logout", &headers);
    StatusCode::NO_CONTENT.into_response()
}

async fn brokers(State(s): Shared, headers: HeaderMap) -> Response {
    s.broker_calls.fetch_add(1, Ordering::SeqCst);
    let bearer = s.record("/brokers", &headers);
    let accepted = bearer.is_some_and(|b| s.valid.lock().contains(&b));
    if s.reject_all.load(Ordering::SeqCst) || !accepted {
        return error(StatusCode::UNAUTHORIZED, "Token expired");
    }
    Json(json!([{"id": 1, "name": "broker-a"}])).into_response()
}

async fn slow(State(s): Shared, headers: HeaderMap) -> Response {
    s.record("/slow", &headers);
    tokio::time::sleep(Duration::from_secs(5)).await;
    Json(json!({})).into_response()
}
