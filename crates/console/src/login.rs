// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Login state machine.
//!
//! ```text
//! Anonymous --submit--> Authenticated
//!           --submit--> TwoFactorRequired --verify--> Authenticated
//!           --submit--> ForcedTwoFactorSetup --enable--> Authenticated
//! ForcedTwoFactorSetup --setup failure--> TwoFactorRequired | Anonymous
//! TwoFactorRequired / ForcedTwoFactorSetup --back--> Anonymous
//! Authenticated --logout--> Anonymous
//! ```
//!
//! The temp token lives only inside the 2FA states and is dropped on every
//! exit from them. It is never written to the session store.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::types::{
    EnableRequest, EnrollmentMaterial, LoginRequest, TwoFactorProof, VerifyRequest,
};
use crate::api::AuthApi;
use crate::error::{AuthError, ErrorKind};
use crate::session::{AuthenticatedUser, SessionStore};
use crate::sync::ChangeKind;

/// Short-lived credential scoped to finishing 2FA.
#[derive(Clone, PartialEq, Eq)]
pub struct TempChallenge {
    temp_token: String,
}

impl TempChallenge {
    pub fn new(temp_token: impl Into<String>) -> Self {
        Self { temp_token: temp_token.into() }
    }

    pub fn temp_token(&self) -> &str {
        &self.temp_token
    }
}

impl std::fmt::Debug for TempChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TempChallenge(<redacted>)")
    }
}

/// What to do when the forced-enrollment exchange fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentFallback {
    /// Keep the challenge and ask for a code from an existing authenticator.
    Verify,
    /// Discard the challenge and start over.
    #[default]
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    Anonymous,
    /// `challenge` is `None` when the server asked for a code without issuing
    /// a temp token; verification then repeats the password step.
    TwoFactorRequired { username: String, challenge: Option<TempChallenge> },
    ForcedTwoFactorSetup {
        username: String,
        challenge: TempChallenge,
        enrollment: Option<EnrollmentMaterial>,
    },
    Authenticated { user: Option<AuthenticatedUser> },
}

impl LoginState {
    pub fn phase(&self) -> LoginPhase {
        match self {
            Self::Anonymous => LoginPhase::Anonymous,
            Self::TwoFactorRequired { .. } => LoginPhase::TwoFactorRequired,
            Self::ForcedTwoFactorSetup { .. } => LoginPhase::ForcedTwoFactorSetup,
            Self::Authenticated { .. } => LoginPhase::Authenticated,
        }
    }

    pub fn challenge(&self) -> Option<&TempChallenge> {
        match self {
            Self::TwoFactorRequired { challenge, .. } => challenge.as_ref(),
            Self::ForcedTwoFactorSetup { challenge, .. } => Some(challenge),
            _ => None,
        }
    }
}

/// Secret-free view of [`LoginState`] for UI subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginPhase {
    Anonymous,
    TwoFactorRequired,
    ForcedTwoFactorSetup,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthSnapshot {
    pub phase: LoginPhase,
    pub user: Option<AuthenticatedUser>,
}

impl AuthSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.phase == LoginPhase::Authenticated
    }
}

/// Outcome of a successful step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStep {
    Authenticated(Option<AuthenticatedUser>),
    TwoFactorRequired,
    EnrollmentRequired(EnrollmentMaterial),
}

/// Password kept only for the verify fallback when no temp token was issued.
#[derive(Clone)]
struct FallbackCredentials {
    username: String,
    password: String,
}

struct Flow {
    state: LoginState,
    fallback: Option<FallbackCredentials>,
    /// Bumped on every state change. A 2FA reply only applies if the flow
    /// is still at the epoch its request was built in.
    epoch: u64,
}

pub struct LoginMachine {
    api: Arc<AuthApi>,
    store: Arc<SessionStore>,
    enrollment_fallback: EnrollmentFallback,
    flow: Mutex<Flow>,
    /// Serializes steps so a slow reply cannot overwrite a newer transition.
    step: tokio::sync::Mutex<()>,
    snapshot_tx: watch::Sender<AuthSnapshot>,
}

impl LoginMachine {
    /// Start in `Authenticated` when the store already holds a session.
    pub fn new(
        api: Arc<AuthApi>,
        store: Arc<SessionStore>,
        enrollment_fallback: EnrollmentFallback,
    ) -> Arc<Self> {
        let state = if store.is_authenticated() {
            LoginState::Authenticated { user: store.user() }
        } else {
            LoginState::Anonymous
        };
        let (snapshot_tx, _) = watch::channel(snapshot_of(&state));
        Arc::new(Self {
            api,
            store,
            enrollment_fallback,
            flow: Mutex::new(Flow { state, fallback: None, epoch: 0 }),
            step: tokio::sync::Mutex::new(()),
            snapshot_tx,
        })
    }

    pub fn state(&self) -> LoginState {
        self.flow.lock().state.clone()
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Password step.
    pub async fn submit(&self, username: &str, password: &str) -> Result<LoginStep, AuthError> {
        let _step = self.step.lock().await;
        if let LoginState::Authenticated { .. } = self.state() {
            return Err(AuthError::new(ErrorKind::Unexpected, "already authenticated"));
        }
        self.transition(LoginState::Anonymous, None);

        let req = LoginRequest { username: username.to_owned(), password: password.to_owned() };
        let resp = match self.api.login(&req).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(err = %e, "login rejected");
                return Err(e);
            }
        };

        if resp.requires_2fa {
            let challenge = resp.temp_token.clone().map(TempChallenge::new);
            if resp.requires_2fa_setup {
                let Some(challenge) = challenge else {
                    return Err(AuthError::new(
                        ErrorKind::Unexpected,
                        "2FA setup required but no temp token was issued",
                    ));
                };
                info!(username, "2FA enrollment required");
                self.transition(
                    LoginState::ForcedTwoFactorSetup {
                        username: username.to_owned(),
                        challenge: challenge.clone(),
                        enrollment: None,
                    },
                    None,
                );
                return self.begin_enrollment(username, challenge).await;
            }

            info!(username, "2FA verification required");
            let fallback = challenge.is_none().then(|| FallbackCredentials {
                username: username.to_owned(),
                password: password.to_owned(),
            });
            self.transition(
                LoginState::TwoFactorRequired { username: username.to_owned(), challenge },
                fallback,
            );
            return Ok(LoginStep::TwoFactorRequired);
        }

        match resp.tokens() {
            Some(tokens) => {
                let user = resp.user.clone();
                self.authenticate(tokens, user.clone());
                Ok(LoginStep::Authenticated(user))
            }
            None => Err(AuthError::new(
                ErrorKind::Unexpected,
                "login reply carried neither tokens nor a 2FA challenge",
            )),
        }
    }

    /// Complete `TwoFactorRequired` with a code.
    pub async fn verify(&self, code: &str) -> Result<LoginStep, AuthError> {
        let _step = self.step.lock().await;
        let (proof, epoch) = {
            let flow = self.flow.lock();
            let proof = match (&flow.state, &flow.fallback) {
                (LoginState::TwoFactorRequired { challenge: Some(c), .. }, _) => {
                    TwoFactorProof::Challenge { temp_token: c.temp_token.clone() }
                }
                (LoginState::TwoFactorRequired { challenge: None, .. }, Some(creds)) => {
                    TwoFactorProof::Credentials {
                        username: creds.username.clone(),
                        password: creds.password.clone(),
                    }
                }
                _ => {
                    return Err(AuthError::new(
                        ErrorKind::Unexpected,
                        "no two-factor verification pending",
                    ))
                }
            };
            (proof, flow.epoch)
        };

        let req = VerifyRequest { proof, code: code.trim().to_owned() };
        match self.api.verify_two_factor(&req).await {
            Ok(resp) => {
                let (tokens, user) = resp.into_parts();
                self.complete_challenge(epoch, tokens, user)
            }
            Err(e) => {
                debug!(err = %e, "2FA verification rejected");
                Err(e)
            }
        }
    }

    /// Complete `ForcedTwoFactorSetup` with a code from the new authenticator.
    pub async fn enable(&self, code: &str) -> Result<LoginStep, AuthError> {
        let _step = self.step.lock().await;
        let (req, epoch) = {
            let flow = self.flow.lock();
            let req = match &flow.state {
                LoginState::ForcedTwoFactorSetup { challenge, enrollment: Some(material), .. } => {
                    EnableRequest {
                        temp_token: challenge.temp_token.clone(),
                        code: code.trim().to_owned(),
                        backup_codes: material.backup_codes.clone(),
                    }
                }
                LoginState::ForcedTwoFactorSetup { enrollment: None, .. } => {
                    return Err(AuthError::new(
                        ErrorKind::Unexpected,
                        "enrollment material not loaded",
                    ))
                }
                _ => return Err(AuthError::new(ErrorKind::Unexpected, "no 2FA enrollment pending")),
            };
            (req, flow.epoch)
        };

        match self.api.enable_two_factor(&req).await {
            Ok(resp) => {
                let (tokens, user) = resp.into_parts();
                self.complete_challenge(epoch, tokens, user)
            }
            Err(e) => {
                debug!(err = %e, "2FA enrollment code rejected");
                Err(e)
            }
        }
    }

    /// Abandon a pending 2FA step. A verification or enrollment reply still
    /// in flight is discarded when it arrives.
    pub fn back(&self) {
        let mut flow = self.flow.lock();
        if matches!(
            flow.state,
            LoginState::TwoFactorRequired { .. } | LoginState::ForcedTwoFactorSetup { .. }
        ) {
            self.enter(&mut flow, LoginState::Anonymous, None);
        }
    }

    /// Best-effort server logout, then clear and broadcast.
    pub async fn logout(&self) {
        let _step = self.step.lock().await;
        let access = self.store.access_token();
        self.api.logout(access.as_deref()).await;
        self.store.clear(ChangeKind::LoggedOut);
        self.transition(LoginState::Anonymous, None);
        info!("logged out");
    }

    /// Re-derive the state from the session store.
    ///
    /// A session appearing (another instance logged in) wins over a pending
    /// 2FA step; a session disappearing only affects `Authenticated`.
    pub fn resync(&self) {
        let session = self.store.snapshot();
        let mut flow = self.flow.lock();
        let next = match (&flow.state, session.is_authenticated()) {
            (LoginState::Authenticated { user }, true) if *user == session.user => return,
            (_, true) => LoginState::Authenticated { user: session.user },
            (LoginState::Authenticated { .. }, false) => LoginState::Anonymous,
            (_, false) => return,
        };
        debug!(phase = ?next.phase(), "login state resynced");
        self.enter(&mut flow, next, None);
    }

    async fn begin_enrollment(
        &self,
        username: &str,
        challenge: TempChallenge,
    ) -> Result<LoginStep, AuthError> {
        match self.api.setup_two_factor(challenge.temp_token()).await {
            Ok(material) => {
                self.transition(
                    LoginState::ForcedTwoFactorSetup {
                        username: username.to_owned(),
                        challenge,
                        enrollment: Some(material.clone()),
                    },
                    None,
                );
                Ok(LoginStep::EnrollmentRequired(material))
            }
            Err(e) => {
                warn!(err = %e, fallback = ?self.enrollment_fallback, "2FA enrollment exchange failed");
                let next = match self.enrollment_fallback {
                    EnrollmentFallback::Verify => LoginState::TwoFactorRequired {
                        username: username.to_owned(),
                        challenge: Some(challenge),
                    },
                    EnrollmentFallback::Restart => LoginState::Anonymous,
                };
                self.transition(next, None);
                Err(e)
            }
        }
    }

    /// Populate the session and enter `Authenticated`, dropping any challenge.
    fn authenticate(&self, tokens: crate::session::Tokens, user: Option<AuthenticatedUser>) {
        self.store.populate(tokens, user.clone());
        self.transition(LoginState::Authenticated { user }, None);
        info!("authenticated");
    }

    /// Authenticate from a 2FA reply unless the flow moved on since the
    /// request was built at `epoch`.
    fn complete_challenge(
        &self,
        epoch: u64,
        tokens: crate::session::Tokens,
        user: Option<AuthenticatedUser>,
    ) -> Result<LoginStep, AuthError> {
        let mut flow = self.flow.lock();
        if flow.epoch != epoch {
            debug!("2FA step abandoned before its reply, discarding tokens");
            return Err(AuthError::new(ErrorKind::Unexpected, "two-factor step was abandoned"));
        }
        self.store.populate(tokens, user.clone());
        self.enter(&mut flow, LoginState::Authenticated { user: user.clone() }, None);
        info!("authenticated");
        Ok(LoginStep::Authenticated(user))
    }

    fn transition(&self, state: LoginState, fallback: Option<FallbackCredentials>) {
        let mut flow = self.flow.lock();
        self.enter(&mut flow, state, fallback);
    }

    fn enter(&self, flow: &mut Flow, state: LoginState, fallback: Option<FallbackCredentials>) {
        flow.state = state;
        flow.fallback = fallback;
        flow.epoch = flow.epoch.wrapping_add(1);
        let _ = self.snapshot_tx.send(snapshot_of(&flow.state));
    }
}

fn snapshot_of(state: &LoginState) -> AuthSnapshot {
    let user = match state {
        LoginState::Authenticated { user } => user.clone(),
        _ => None,
    };
    AuthSnapshot { phase: state.phase(), user }
}
