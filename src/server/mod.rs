// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Unix socket front end of the daemon.

pub mod control;
pub mod events;
pub mod handlers;
pub mod pidfile;
pub mod poller;
pub mod protocol;

pub use events::EventBus;
pub use handlers::ServerContext;
pub use poller::PollerConfig;
pub use protocol::{Event, EventType, Request, RequestFrame, Response, ResponseType};

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{MailyError, Result};
use crate::state::StateManager;
use protocol::{parse_request, Outbound};

/// Upper bound on one frame.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

const RESPONSE_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub poller: PollerConfig,
    /// Disabled in tests that drive syncs by hand.
    pub run_poller: bool,
}

impl ServerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            socket_path: settings.socket_path(),
            pid_path: settings.pid_path(),
            poller: PollerConfig {
                sync_interval: settings.sync.interval(),
                ops_interval: settings.sync.ops_interval(),
            },
            run_poller: true,
        }
    }
}

pub struct Server {
    ctx: ServerContext,
    config: ServerConfig,
}

impl Server {
    pub fn new(state: Arc<StateManager>, config: ServerConfig) -> Self {
        let ctx = ServerContext {
            state,
            events: Arc::new(EventBus::new()),
            shutdown: CancellationToken::new(),
        };
        Self { ctx, config }
    }

    /// Cancelling this token stops the server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.ctx.events)
    }

    /// Claims the socket path, binds with owner-only permissions and writes
    /// the PID file.
    pub async fn bind(&self) -> Result<UnixListener> {
        let socket_path = &self.config.socket_path;
        pidfile::claim(socket_path, &self.config.pid_path).await?;

        if let Some(dir) = socket_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        let listener = UnixListener::bind(socket_path)?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        pidfile::write_pid_file(&self.config.pid_path, &pidfile::PidRecord::current(protocol::VERSION))?;

        info!("Server started (PID {}, socket {})", std::process::id(), socket_path.display());
        Ok(listener)
    }

    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts clients until the shutdown token is cancelled, then tears
    /// everything down.
    pub async fn serve(self, listener: UnixListener) -> Result<()> {
        let shutdown = self.ctx.shutdown.clone();

        let poller = if self.config.run_poller {
            Some(tokio::spawn(poller::run(
                Arc::clone(&self.ctx.state),
                Arc::clone(&self.ctx.events),
                self.config.poller,
                shutdown.clone(),
            )))
        } else {
            None
        };

        let clients_token = CancellationToken::new();
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!("Client connected");
                        clients.spawn(serve_client(self.ctx.clone(), stream, clients_token.clone()));
                    }
                    Err(e) => warn!("Accept error: {}", e),
                },
                Some(finished) = clients.join_next(), if !clients.is_empty() => {
                    if let Err(e) = finished {
                        error!("Client task failed: {}", e);
                    }
                }
            }
        }

        info!("Shutting down");
        drop(listener);
        clients_token.cancel();
        while let Some(finished) = clients.join_next().await {
            if let Err(e) = finished {
                error!("Client task failed: {}", e);
            }
        }
        if let Some(poller) = poller {
            if let Err(e) = poller.await {
                error!("Poller task failed: {}", e);
            }
        }

        self.ctx.state.shutdown().await;
        pidfile::remove_file_if_exists(&self.config.pid_path)?;
        pidfile::remove_file_if_exists(&self.config.socket_path)?;
        info!("Server stopped");
        Ok(())
    }
}

async fn serve_client(ctx: ServerContext, stream: UnixStream, closing: CancellationToken) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let writer = FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    let subscription = ctx.events.subscribe();
    let subscription_id = subscription.id;
    let (responses, response_rx) = mpsc::channel(RESPONSE_QUEUE_CAPACITY);
    let writer_task = tokio::spawn(write_frames(writer, response_rx, subscription.receiver, closing.clone()));

    loop {
        let line = tokio::select! {
            _ = closing.cancelled() => break,
            line = reader.next() => line,
        };
        let response = match line {
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => match parse_request(&line) {
                Ok(frame) => handlers::handle(&ctx, frame).await,
                Err(e) => {
                    debug!("Rejected frame: {}", e.message);
                    Response::error(e.message).with_id(e.id)
                }
            },
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!("Client sent a frame over {} bytes", MAX_LINE_LENGTH);
                Response::error("invalid request: frame too large")
            }
            Some(Err(LinesCodecError::Io(e))) => {
                debug!("Client read error: {}", e);
                break;
            }
            None => break,
        };
        if responses.send(response).await.is_err() {
            break;
        }
    }

    ctx.events.unsubscribe(&subscription_id);
    drop(responses);
    if let Err(e) = writer_task.await {
        error!("Client writer failed: {}", e);
    }
    debug!("Client disconnected");
}

/// Owns the write half. Responses and events share the stream; each frame
/// is written whole.
async fn write_frames(
    mut writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
    mut responses: mpsc::Receiver<Response>,
    mut events: mpsc::Receiver<Event>,
    closing: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = closing.cancelled() => break,
            response = responses.recv() => match response {
                Some(response) => Outbound::Response(response),
                None => break,
            },
            Some(event) = events.recv() => Outbound::Event(event),
        };

        let line = match serde_json::to_string(&frame) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize frame: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.send(line).await {
            debug!("Client write failed: {}", e);
            break;
        }
    }

    if let Err(e) = SinkExt::<String>::close(&mut writer).await {
        debug!("Client writer close failed: {}", e);
    }
}

impl From<LinesCodecError> for MailyError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(e) => MailyError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => MailyError::InvalidRequest("frame too large".to_string()),
        }
    }
}
