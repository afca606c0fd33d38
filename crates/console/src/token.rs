// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Access-token expiry inspection.
//!
//! Claims are decoded without verifying the signature. The result is only a
//! hint used to refresh ahead of time; the server's 401 stays authoritative.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Default safety margin before the embedded expiry.
pub const DEFAULT_MARGIN_SECS: u64 = 30;

/// Derives expiry state from access tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInspector {
    margin_secs: u64,
}

impl TokenInspector {
    pub fn new(margin_secs: u64) -> Self {
        Self { margin_secs }
    }

    pub fn margin_secs(&self) -> u64 {
        self.margin_secs
    }

    /// True when the token is absent, undecodable, has no usable `exp`, or
    /// expires within the margin.
    pub fn is_expired(&self, token: Option<&str>) -> bool {
        self.is_expired_at(token, epoch_secs())
    }

    pub fn is_expired_at(&self, token: Option<&str>, now: u64) -> bool {
        match token.and_then(expires_at) {
            Some(exp) => exp <= now.saturating_add(self.margin_secs),
            None => true,
        }
    }
}

impl Default for TokenInspector {
    fn default() -> Self {
        Self::new(DEFAULT_MARGIN_SECS)
    }
}

/// Shorthand for [`TokenInspector::is_expired`] with the default margin.
pub fn is_expired(token: Option<&str>) -> bool {
    TokenInspector::default().is_expired(token)
}

/// Read the `exp` claim (epoch seconds) from a JWT-shaped token.
///
/// Returns `None` unless the token has three dot-separated segments, the
/// middle one is base64url JSON, and `exp` is a non-negative number.
pub fn expires_at(token: &str) -> Option<u64> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    match claims.get("exp")? {
        serde_json::Value::Number(n) => {
            n.as_u64().or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
        }
        _ => None,
    }
}

pub fn epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
