// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::api::AuthEndpoints;
use crate::login::EnrollmentFallback;
use crate::token::DEFAULT_MARGIN_SECS;

/// Authenticated console client for the admin API.
#[derive(Debug, Parser)]
#[command(name = "console-auth", version, about)]
pub struct ConsoleConfig {
    /// Base URL of the API (auth endpoints are relative to it).
    #[arg(long, env = "CONSOLE_API_URL", default_value = "http://127.0.0.1:8000/api")]
    pub api_url: String,

    /// Per-call HTTP timeout in milliseconds.
    #[arg(long, env = "CONSOLE_TIMEOUT_MS", default_value = "15000")]
    pub timeout_ms: u64,

    /// Treat access tokens expiring within this many seconds as expired.
    #[arg(long, env = "CONSOLE_REFRESH_MARGIN_SECS", default_value_t = DEFAULT_MARGIN_SECS)]
    pub refresh_margin_secs: u64,

    /// Directory holding the persisted session.
    #[arg(long, env = "CONSOLE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// What to do when the 2FA enrollment exchange fails (verify, restart).
    #[arg(long, env = "CONSOLE_ENROLLMENT_FALLBACK", value_enum, default_value_t)]
    pub enrollment_fallback: EnrollmentFallback,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CONSOLE_LOG", default_value = "info")]
    pub log_level: String,

    /// Log format (json or text).
    #[arg(long, env = "CONSOLE_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    // -- Duration overrides (skip from CLI; set in tests) -----------------
    /// Session file poll interval in ms.
    #[clap(skip)]
    pub sync_poll_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Log in, completing 2FA or forced enrollment when asked.
    Login {
        #[arg(long, short)]
        username: String,
        /// Password (prompted when absent).
        #[arg(long, env = "CONSOLE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// 2FA code (prompted when needed and absent).
        #[arg(long)]
        code: Option<String>,
    },
    /// End the session here and in every other instance.
    Logout,
    /// Show the cached user.
    Whoami,
    /// GET an API path through the authenticated pipeline.
    Get { path: String },
    /// Print session events until interrupted.
    Watch,
}

impl ConsoleConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = self.api_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("--api-url must be an http(s) URL: {url}");
        }
        if self.timeout_ms == 0 {
            anyhow::bail!("--timeout-ms must be positive");
        }
        if !matches!(self.log_format.as_str(), "json" | "text") {
            anyhow::bail!("invalid log format: {}", self.log_format);
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sync_poll(&self) -> Duration {
        Duration::from_millis(self.sync_poll_ms.unwrap_or(500))
    }

    /// Resolved session directory.
    pub fn state_dir(&self) -> PathBuf {
        match self.state_dir {
            Some(ref dir) => dir.clone(),
            None => default_state_dir(),
        }
    }

    /// Runtime options for [`crate::Console`].
    pub fn options(&self) -> ConsoleOptions {
        ConsoleOptions {
            api_url: self.api_url.trim().to_owned(),
            endpoints: AuthEndpoints::default(),
            timeout: self.timeout(),
            refresh_margin_secs: self.refresh_margin_secs,
            enrollment_fallback: self.enrollment_fallback,
        }
    }
}

/// Resolved settings the console core runs with.
#[derive(Debug, Clone)]
pub struct ConsoleOptions {
    pub api_url: String,
    pub endpoints: AuthEndpoints,
    pub timeout: Duration,
    pub refresh_margin_secs: u64,
    pub enrollment_fallback: EnrollmentFallback,
}

impl ConsoleOptions {
    /// Defaults pointed at `api_url`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            endpoints: AuthEndpoints::default(),
            timeout: Duration::from_secs(15),
            refresh_margin_secs: DEFAULT_MARGIN_SECS,
            enrollment_fallback: EnrollmentFallback::default(),
        }
    }
}

/// Checks `$XDG_STATE_HOME/console-auth`, then
/// `$HOME/.local/state/console-auth`.
pub fn default_state_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("console-auth");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/console-auth");
    }
    PathBuf::from(".console-auth")
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
