// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use console_auth::config::ConsoleConfig;
use console_auth::Console;

#[tokio::main]
async fn main() {
    let config = ConsoleConfig::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    init_tracing(&config);

    let shutdown = CancellationToken::new();
    let console = match Console::new(&config, shutdown.clone()) {
        Ok(console) => console,
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    };

    let code = console_auth::cli::run(&console, config.command.clone()).await;
    console.shutdown().await;
    shutdown.cancel();
    std::process::exit(code);
}

fn init_tracing(config: &ConsoleConfig) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr so command output stays parseable.
    let _ = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init(),
    };
}
