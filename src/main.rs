// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn};
use std::process::exit;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use maily::cache::{CacheConfig, CacheService};
use maily::config::Settings;
use maily::error::{MailyError, Result};
use maily::imap::TlsSessionFactory;
use maily::server::control::ControlClient;
use maily::server::pidfile::{process_alive, read_pid_file};
use maily::server::{Request, ResponseType, Server, ServerConfig};
use maily::state::{StateManager, StateOptions};

#[derive(Parser, Debug)]
#[command(name = "maily-server", version, about = "Background mail sync daemon")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "MAILY_CONFIG")]
    config: Option<String>,

    /// Log level; overrides the configured value (RUST_LOG wins over both)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the daemon in the foreground (default)
    Run,
    /// Report whether a daemon is running
    Status,
    /// Ask a running daemon to shut down
    Stop,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::new(cli.config.as_deref()).unwrap_or_else(|err| {
        eprintln!("Failed to load configuration: {}", err);
        exit(1);
    });

    let level = cli.log_level.clone().unwrap_or_else(|| settings.log.level.clone());
    env_logger::Builder::from_env(Env::new().default_filter_or(level)).init();

    let outcome = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(settings).await,
        Command::Status => status(&settings).await,
        Command::Stop => stop(&settings).await,
    };

    if let Err(e) = outcome {
        error!("{}", e);
        eprintln!("Error: {}", e);
        exit(1);
    }
}

async fn run(settings: Settings) -> Result<()> {
    if settings.accounts.is_empty() {
        warn!("No accounts configured; the daemon will only serve the socket");
    }

    let mut cache = CacheService::new(CacheConfig {
        database_url: settings.database_url(),
        max_memory_items: settings.cache.memory_items,
    });
    cache.initialize().await?;

    let factory = Arc::new(TlsSessionFactory::new()?);
    let state = Arc::new(StateManager::new(
        &settings.accounts,
        Arc::new(cache),
        factory,
        StateOptions::from_settings(&settings),
    ));

    let server = Server::new(state, ServerConfig::from_settings(&settings));
    let listener = server.bind().await?;
    tokio::spawn(watch_signals(server.shutdown_token()));

    info!("Serving {} account(s)", settings.accounts.len());
    server.serve(listener).await
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = term.recv() => info!("Received SIGTERM"),
            _ = shutdown.cancelled() => return,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
            _ = shutdown.cancelled() => return,
        }
    }
    shutdown.cancel();
}

async fn status(settings: &Settings) -> Result<()> {
    let record = read_pid_file(&settings.pid_path());
    let mut client = match ControlClient::connect(&settings.socket_path()).await {
        Ok(client) => client,
        Err(_) => {
            match record {
                Some(record) if process_alive(record.pid) => {
                    println!("Process {} is alive but not answering on {}", record.pid, settings.socket_path().display())
                }
                _ => println!("Server is not running"),
            }
            return Ok(());
        }
    };

    let response = client.call(Request::GetAccounts).await?;
    match record {
        Some(record) => println!("Server running (PID {}, version {})", record.pid, record.version),
        None => println!("Server running"),
    }
    for account in response.accounts.unwrap_or_default() {
        let last_sync = account
            .last_sync
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {} ({} cached, last sync {}{})",
            account.email,
            account.email_count,
            last_sync,
            if account.syncing { ", syncing" } else { "" }
        );
    }
    Ok(())
}

async fn stop(settings: &Settings) -> Result<()> {
    let mut client = match ControlClient::connect(&settings.socket_path()).await {
        Ok(client) => client,
        Err(_) => {
            println!("Server is not running");
            return Ok(());
        }
    };
    let response = client.call(Request::Shutdown).await?;
    if response.kind == ResponseType::Ok {
        println!("Shutdown requested");
        Ok(())
    } else {
        Err(MailyError::InvalidRequest(response.error.unwrap_or_default()))
    }
}
