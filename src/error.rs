// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::cache::CacheError;
use crate::config::SettingsError;
use crate::imap::ImapError;

/// Errors surfaced by the state manager and the protocol server.
///
/// The `Display` text is what a client sees in an `error` response.
#[derive(Debug, Error)]
pub enum MailyError {
    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("sync already in progress")]
    SyncInProgress,

    #[error("email not found")]
    EmailNotFound,

    #[error("email was deleted on another device")]
    DeletedElsewhere,

    #[error("{0}")]
    Imap(#[from] ImapError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(#[from] SettingsError),

    #[error("server already running")]
    AlreadyRunning,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("attachment error: {0}")]
    Attachment(String),
}

impl MailyError {
    /// True when the underlying failure is a broken IMAP transport.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, MailyError::Imap(e) if e.is_connection_error())
    }
}

pub type Result<T> = std::result::Result<T, MailyError>;
