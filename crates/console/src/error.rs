// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure classes surfaced by the auth core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Login rejected with 401.
    CredentialsInvalid,
    /// Login rejected with 403 and no 2FA flags.
    AccountLocked,
    /// A 2FA verification or enrollment code was rejected.
    TwoFactorInvalid,
    /// The refresh-token exchange was rejected; the session is gone.
    RefreshExpired,
    /// No transport-level reply (connect failure, timeout, reset).
    Network,
    /// Any other non-2xx reply or malformed body.
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CredentialsInvalid => "CREDENTIALS_INVALID",
            Self::AccountLocked => "ACCOUNT_LOCKED",
            Self::TwoFactorInvalid => "TWO_FACTOR_INVALID",
            Self::RefreshExpired => "REFRESH_EXPIRED",
            Self::Network => "NETWORK",
            Self::Unexpected => "UNEXPECTED",
        }
    }

    /// Whether a failure of this kind invalidates the stored session.
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::RefreshExpired)
    }

    fn fallback_message(&self) -> &'static str {
        match self {
            Self::CredentialsInvalid => "invalid username or password",
            Self::AccountLocked => "account is locked or disabled",
            Self::TwoFactorInvalid => "invalid verification code",
            Self::RefreshExpired => "session expired, please log in again",
            Self::Network => "no response from server",
            Self::Unexpected => "unexpected server response",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which family of endpoint produced a failed reply. Drives classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Login,
    TwoFactor,
    Refresh,
    Api,
}

/// A classified failure, cheap to clone so one refresh outcome can be fanned
/// out to every queued caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    kind: ErrorKind,
    status: Option<u16>,
    message: String,
}

impl AuthError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, status: None, message: message.into() }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Map a transport failure (no reply at all) to [`ErrorKind::Network`].
    pub fn network(err: &reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "request timed out".to_owned()
        } else if err.is_connect() {
            "could not connect to server".to_owned()
        } else {
            format!("transport error: {err}")
        };
        Self::new(ErrorKind::Network, message)
    }

    /// Classify a non-2xx reply.
    pub fn from_status(class: EndpointClass, status: u16, body: &[u8]) -> Self {
        let kind = match (class, status) {
            (EndpointClass::Login, 401) => ErrorKind::CredentialsInvalid,
            (EndpointClass::Login, 403) => ErrorKind::AccountLocked,
            (EndpointClass::TwoFactor, 400 | 401 | 403) => ErrorKind::TwoFactorInvalid,
            (EndpointClass::Refresh, 400..=599) => ErrorKind::RefreshExpired,
            _ => ErrorKind::Unexpected,
        };
        let message = server_message(body).unwrap_or_else(|| match kind {
            ErrorKind::Unexpected => format!("{} ({status})", kind.fallback_message()),
            _ => kind.fallback_message().to_owned(),
        });
        Self::new(kind, message).with_status(status)
    }

    /// A 2xx reply whose body did not decode.
    pub fn malformed(err: &serde_json::Error) -> Self {
        Self::new(ErrorKind::Unexpected, format!("malformed response: {err}"))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} [{status}]: {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for AuthError {}

/// Pull a human-readable message out of a JSON error body.
///
/// Understands `{"detail": "..."}`, `{"detail": [{"msg": "..."}]}`,
/// `{"message": "..."}`, `{"error": "..."}` and `{"error": {"message": "..."}}`.
pub fn server_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let text = match value.get("detail") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Array(items)) => {
            let msgs: Vec<&str> =
                items.iter().filter_map(|i| i.get("msg").and_then(|m| m.as_str())).collect();
            (!msgs.is_empty()).then(|| msgs.join("; "))
        }
        _ => None,
    };
    text.or_else(|| value.get("message").and_then(|m| m.as_str()).map(String::from))
        .or_else(|| match value.get("error") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(obj) => obj.get("message").and_then(|m| m.as_str()).map(String::from),
            None => None,
        })
        .filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
