// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `console-auth` subcommands.

use std::io::{BufRead, Write};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::config::Command;
use crate::error::AuthError;
use crate::login::{LoginPhase, LoginStep};
use crate::Console;

/// Run one subcommand. Returns a process exit code.
pub async fn run(console: &Console, command: Command) -> i32 {
    console.on_redirect(Arc::new(|err: &AuthError| {
        eprintln!("{err}; run `console-auth login` to sign in again");
    }));

    let result = match command {
        Command::Login { username, password, code } => login(console, &username, password, code).await,
        Command::Logout => {
            console.login.logout().await;
            println!("logged out");
            Ok(())
        }
        Command::Whoami => whoami(console),
        Command::Get { path } => get(console, &path).await,
        Command::Watch => watch(console).await,
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    }
}

async fn login(
    console: &Console,
    username: &str,
    password: Option<String>,
    code: Option<String>,
) -> anyhow::Result<()> {
    let password = match password {
        Some(p) => p,
        None => prompt("password").await?,
    };

    let step = match console.login.submit(username, &password).await {
        Ok(step) => step,
        // Enrollment fell back to verifying an existing authenticator.
        Err(e) if console.login.state().phase() == LoginPhase::TwoFactorRequired => {
            eprintln!("{e}; falling back to code verification");
            LoginStep::TwoFactorRequired
        }
        Err(e) => return Err(e.into()),
    };

    let step = match step {
        LoginStep::TwoFactorRequired => {
            let code = code_or_prompt(code, "2FA code").await?;
            console.login.verify(&code).await?
        }
        LoginStep::EnrollmentRequired(material) => {
            println!("Two-factor enrollment is required.");
            println!("secret: {}", material.secret);
            println!("otpauth: {}", material.qr_code_uri);
            if !material.backup_codes.is_empty() {
                println!("backup codes (store them safely):");
                for c in &material.backup_codes {
                    println!("  {c}");
                }
            }
            let code = code_or_prompt(code, "code from your authenticator").await?;
            console.login.enable(&code).await?
        }
        step => step,
    };

    if let LoginStep::Authenticated(user) = step {
        match user {
            Some(user) => println!("logged in as {}", user.username),
            None => println!("logged in"),
        }
    }
    Ok(())
}

fn whoami(console: &Console) -> anyhow::Result<()> {
    if !console.store.is_authenticated() {
        anyhow::bail!("not logged in");
    }
    match console.store.user() {
        Some(user) => println!("{}", serde_json::to_string_pretty(&user)?),
        None => println!("authenticated (no cached user record)"),
    }
    Ok(())
}

async fn get(console: &Console, path: &str) -> anyhow::Result<()> {
    let resp = console.pipeline.get_json::<serde_json::Value>(path).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

async fn watch(console: &Console) -> anyhow::Result<()> {
    let mut events = console.store.subscribe_local();
    let mut snapshots = console.login.subscribe();
    println!("{}", serde_json::to_string(&*snapshots.borrow_and_update())?);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "watch lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                println!("{}", serde_json::to_string(&snapshot)?);
            }
        }
    }
    Ok(())
}

async fn code_or_prompt(code: Option<String>, label: &'static str) -> anyhow::Result<String> {
    match code {
        Some(code) => Ok(code),
        None => prompt(label).await,
    }
}

/// Read one line from stdin off the runtime threads.
async fn prompt(label: &'static str) -> anyhow::Result<String> {
    let line = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        eprint!("{label}: ");
        std::io::stderr().flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    })
    .await??;
    let line = line.trim_end_matches(['\r', '\n']).to_owned();
    if line.is_empty() {
        anyhow::bail!("no {label} given");
    }
    Ok(line)
}
