// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Substrings that identify a dead transport in error text coming back from
/// the IMAP stack.
const CONNECTION_SYMPTOMS: [&str; 5] = [
    "closed network connection",
    "connection reset",
    "broken pipe",
    "connection lost",
    "eof",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImapError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Invalid mailbox: {0}")]
    Mailbox(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ImapError {
    /// Transport-level failures are recoverable by reconnecting; everything
    /// else is reported to the caller as-is.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ImapError::Connection(_) | ImapError::Io(_) => true,
            ImapError::Tls(msg) | ImapError::Command(msg) | ImapError::Fetch(msg) => {
                let msg = msg.to_lowercase();
                CONNECTION_SYMPTOMS.iter().any(|s| msg.contains(s))
            }
            _ => false,
        }
    }
}

impl From<async_imap::error::Error> for ImapError {
    fn from(err: async_imap::error::Error) -> Self {
        match err {
            async_imap::error::Error::Io(e) => ImapError::Io(e.to_string()),
            async_imap::error::Error::ConnectionLost => {
                ImapError::Connection("connection lost".to_string())
            }
            async_imap::error::Error::Parse(e) => ImapError::Parse(e.to_string()),
            async_imap::error::Error::No(msg) => ImapError::Command(msg),
            async_imap::error::Error::Bad(msg) => ImapError::Command(msg),
            async_imap::error::Error::Validate(e) => ImapError::Command(e.to_string()),
            other => ImapError::Command(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ImapError {
    fn from(err: std::io::Error) -> Self {
        ImapError::Io(err.to_string())
    }
}
