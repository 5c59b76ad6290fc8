// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Newline-delimited JSON frames exchanged over the daemon socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CachedEmail;
use crate::state::{AccountInfo, SyncStatus, INBOX};

/// Daemon protocol version; major.minor must match the client's.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn default_mailbox() -> String {
    INBOX.to_string()
}

/// Every request kind the daemon understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Hello {
        version: String,
    },
    Ping,
    GetAccounts,
    GetEmails {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        #[serde(default)]
        limit: usize,
    },
    GetEmail {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uid: u32,
    },
    GetLabels {
        account: String,
    },
    GetSyncStatus {
        account: String,
    },
    Sync {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
    },
    MarkRead {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uid: u32,
    },
    MarkUnread {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uid: u32,
    },
    MarkMultiRead {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        #[serde(default)]
        uids: Vec<u32>,
    },
    DeleteEmail {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uid: u32,
    },
    DeleteMulti {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        #[serde(default)]
        uids: Vec<u32>,
    },
    MoveToTrash {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uid: u32,
    },
    MoveMultiTrash {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        #[serde(default)]
        uids: Vec<u32>,
    },
    QueueDelete {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uid: u32,
    },
    QueueDeleteMulti {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        #[serde(default)]
        uids: Vec<u32>,
    },
    QueueMoveTrash {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uid: u32,
    },
    QueueMoveMultiTrash {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        #[serde(default)]
        uids: Vec<u32>,
    },
    Search {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        query: String,
    },
    SaveDraft {
        account: String,
        #[serde(default)]
        to: String,
        #[serde(default)]
        subject: String,
        #[serde(default)]
        body: String,
    },
    DownloadAttachment {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uid: u32,
        part_id: String,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        encoding: Option<String>,
    },
    Shutdown,
}

/// Wire names of [`Request`] variants.
pub const REQUEST_TYPES: &[&str] = &[
    "hello",
    "ping",
    "get_accounts",
    "get_emails",
    "get_email",
    "get_labels",
    "get_sync_status",
    "sync",
    "mark_read",
    "mark_unread",
    "mark_multi_read",
    "delete_email",
    "delete_multi",
    "move_to_trash",
    "move_multi_trash",
    "queue_delete",
    "queue_delete_multi",
    "queue_move_trash",
    "queue_move_multi_trash",
    "search",
    "save_draft",
    "download_attachment",
    "shutdown",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub request: Request,
}

/// A line that could not be turned into a [`RequestFrame`]. Carries the id
/// when one could still be read so the error response stays correlated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    pub id: Option<String>,
    pub message: String,
}

/// Parses one request line.
pub fn parse_request(line: &str) -> Result<RequestFrame, FrameError> {
    let value: Value = serde_json::from_str(line).map_err(|_| FrameError {
        id: None,
        message: "invalid request".to_string(),
    })?;

    let id = value.get("id").and_then(Value::as_str).map(str::to_string);
    let fail = |message: String| FrameError { id: id.clone(), message };

    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind,
        None => return Err(fail("invalid request: missing type".to_string())),
    };
    if !REQUEST_TYPES.contains(&kind) {
        return Err(fail(format!("unknown request type: {}", kind)));
    }

    serde_json::from_value(value.clone()).map_err(|e| fail(format!("invalid request: {}", e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Ok,
    Error,
    Hello,
    Pong,
    Accounts,
    Emails,
    Email,
    Labels,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emails: Option<Vec<CachedEmail>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<Box<CachedEmail>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accounts: Option<Vec<AccountInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SyncStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl Response {
    fn new(kind: ResponseType) -> Self {
        Self {
            kind,
            id: None,
            version: None,
            error: None,
            emails: None,
            email: None,
            labels: None,
            accounts: None,
            status: None,
            file_path: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(ResponseType::Ok)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { error: Some(message.into()), ..Self::new(ResponseType::Error) }
    }

    pub fn hello() -> Self {
        Self { version: Some(VERSION.to_string()), ..Self::new(ResponseType::Hello) }
    }

    /// Error answer to a `hello` from an incompatible client, carrying the
    /// server version.
    pub fn version_mismatch(client: &str) -> Self {
        Self {
            version: Some(VERSION.to_string()),
            ..Self::error(format!("version mismatch: server={}, client={} - please restart", VERSION, client))
        }
    }

    pub fn pong() -> Self {
        Self::new(ResponseType::Pong)
    }

    pub fn accounts(accounts: Vec<AccountInfo>) -> Self {
        Self { accounts: Some(accounts), ..Self::new(ResponseType::Accounts) }
    }

    pub fn emails(emails: Vec<CachedEmail>) -> Self {
        Self { emails: Some(emails), ..Self::new(ResponseType::Emails) }
    }

    pub fn email(email: CachedEmail) -> Self {
        Self { email: Some(Box::new(email)), ..Self::new(ResponseType::Email) }
    }

    pub fn labels(labels: Vec<String>) -> Self {
        Self { labels: Some(labels), ..Self::new(ResponseType::Labels) }
    }

    pub fn status(status: SyncStatus) -> Self {
        Self { status: Some(status), ..Self::new(ResponseType::Status) }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self { file_path: Some(path.into()), ..Self::new(ResponseType::Ok) }
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SyncStarted,
    SyncCompleted,
    SyncError,
    NewEmails,
    EmailUpdated,
}

/// Unsolicited push frame. Never carries a request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub account: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailbox: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    pub fn new(kind: EventType, account: impl Into<String>) -> Self {
        Self { kind, account: account.into(), mailbox: None, uids: Vec::new(), error: None }
    }

    pub fn mailbox(mut self, mailbox: impl Into<String>) -> Self {
        self.mailbox = Some(mailbox.into());
        self
    }

    pub fn uids(mut self, uids: Vec<u32>) -> Self {
        self.uids = uids;
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// A frame written to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Response(Response),
    Event(Event),
}

fn major_minor(version: &str) -> Option<(u64, u64)> {
    let version = version.trim().trim_start_matches('v');
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor))
}

/// Patch differences are ignored. Unparseable versions only match if
/// identical.
pub fn version_compatible(server: &str, client: &str) -> bool {
    match (major_minor(server), major_minor(client)) {
        (Some(s), Some(c)) => s == c,
        _ => server.trim() == client.trim(),
    }
}
