// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire types for the authentication endpoints.

use serde::{Deserialize, Serialize};

use crate::session::{AuthenticatedUser, Tokens};

const REDACTED: &str = "<redacted>";

fn redact(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| REDACTED)
}

#[derive(Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &REDACTED)
            .finish()
    }
}

/// Reply to a password login. Either carries tokens, or 2FA flags plus a
/// temp token.
#[derive(Clone, Default, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub requires_2fa: bool,
    #[serde(default)]
    pub requires_2fa_setup: bool,
    #[serde(default)]
    pub temp_token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<AuthenticatedUser>,
}

impl std::fmt::Debug for LoginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginResponse")
            .field("requires_2fa", &self.requires_2fa)
            .field("requires_2fa_setup", &self.requires_2fa_setup)
            .field("temp_token", &redact(&self.temp_token))
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("user", &self.user)
            .finish()
    }
}

impl LoginResponse {
    /// Tokens, when the login completed without a second factor.
    pub fn tokens(&self) -> Option<Tokens> {
        self.access_token.as_ref().map(|access| Tokens {
            access_token: access.clone(),
            refresh_token: self.refresh_token.clone(),
        })
    }
}

/// How the second factor is bound to the first.
#[derive(Clone, Serialize)]
#[serde(untagged)]
pub enum TwoFactorProof {
    /// Temp token issued by the password step.
    Challenge { temp_token: String },
    /// No temp token was issued; the password step is repeated.
    Credentials { username: String, password: String },
}

impl std::fmt::Debug for TwoFactorProof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Challenge { .. } => f.write_str("Challenge(<redacted>)"),
            Self::Credentials { username, .. } => {
                f.debug_struct("Credentials").field("username", username).finish_non_exhaustive()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyRequest {
    #[serde(flatten)]
    pub proof: TwoFactorProof,
    pub code: String,
}

#[derive(Clone, Serialize)]
pub struct SetupRequest {
    pub temp_token: String,
}

impl std::fmt::Debug for SetupRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupRequest").field("temp_token", &REDACTED).finish()
    }
}

/// Enrollment material for forced 2FA setup.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentMaterial {
    pub secret: String,
    pub qr_code_uri: String,
    #[serde(default)]
    pub backup_codes: Vec<String>,
}

impl std::fmt::Debug for EnrollmentMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollmentMaterial")
            .field("secret", &REDACTED)
            .field("backup_codes", &self.backup_codes.len())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Serialize)]
pub struct EnableRequest {
    pub temp_token: String,
    pub code: String,
    pub backup_codes: Vec<String>,
}

impl std::fmt::Debug for EnableRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnableRequest")
            .field("temp_token", &REDACTED)
            .field("backup_codes", &self.backup_codes.len())
            .finish_non_exhaustive()
    }
}

/// Tokens issued on 2FA completion.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<AuthenticatedUser>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &REDACTED)
            .field("refresh_token", &redact(&self.refresh_token))
            .field("user", &self.user)
            .finish()
    }
}

impl TokenResponse {
    pub fn into_parts(self) -> (Tokens, Option<AuthenticatedUser>) {
        (
            Tokens { access_token: self.access_token, refresh_token: self.refresh_token },
            self.user,
        )
    }
}

#[derive(Clone, Serialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

impl std::fmt::Debug for RefreshRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshRequest").field("refresh_token", &REDACTED).finish()
    }
}

#[derive(Clone, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for RefreshResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshResponse")
            .field("access_token", &REDACTED)
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}
