// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cache::CacheError;
use crate::imap::types::{Attachment, MessageMeta};

pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// One cached message. `body_html` stays empty until the body is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEmail {
    pub uid: u32,
    pub message_id: String,
    pub internal_date: DateTime<Utc>,
    pub from: String,
    pub reply_to: String,
    pub to: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub snippet: String,
    pub body_html: String,
    pub unread: bool,
    pub references: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl CachedEmail {
    pub fn from_meta(meta: &MessageMeta) -> Self {
        let internal_date = meta.internal_date.unwrap_or_default();
        Self {
            uid: meta.uid,
            message_id: meta.message_id.clone(),
            internal_date,
            from: meta.from.clone(),
            reply_to: meta.reply_to.clone(),
            to: meta.to.clone(),
            subject: meta.subject.clone(),
            date: meta.date.unwrap_or(internal_date),
            snippet: String::new(),
            body_html: String::new(),
            unread: meta.unread,
            references: meta.references.clone(),
            attachments: meta.attachments.clone(),
        }
    }

    pub fn has_body(&self) -> bool {
        !self.body_html.is_empty()
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct EmailRow {
    pub uid: i64,
    pub message_id: String,
    pub internal_date: i64,
    pub from_addr: String,
    pub reply_to: String,
    pub to_addr: String,
    pub subject: String,
    pub date: i64,
    pub snippet: String,
    pub body_html: String,
    pub unread: bool,
    pub references_hdr: String,
}

impl EmailRow {
    pub fn into_email(self, attachments: Vec<Attachment>) -> CachedEmail {
        CachedEmail {
            uid: self.uid as u32,
            message_id: self.message_id,
            internal_date: from_unix(self.internal_date),
            from: self.from_addr,
            reply_to: self.reply_to,
            to: self.to_addr,
            subject: self.subject,
            date: from_unix(self.date),
            snippet: self.snippet,
            body_html: self.body_html,
            unread: self.unread,
            references: self.references_hdr,
            attachments,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct AttachmentRow {
    pub email_uid: i64,
    pub part_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub encoding: String,
}

impl From<AttachmentRow> for Attachment {
    fn from(row: AttachmentRow) -> Self {
        Attachment {
            part_id: row.part_id,
            filename: row.filename,
            content_type: row.content_type,
            size: row.size as u32,
            encoding: row.encoding,
        }
    }
}

/// Sync bookkeeping for one (account, mailbox).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub uid_validity: u32,
    pub last_sync: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Delete,
    MoveTrash,
    MarkRead,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Delete => "delete",
            OpKind::MoveTrash => "move_trash",
            OpKind::MarkRead => "mark_read",
        }
    }

    /// Whether success removes the message from its mailbox.
    pub fn removes_message(&self) -> bool {
        matches!(self, OpKind::Delete | OpKind::MoveTrash)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delete" => Ok(OpKind::Delete),
            "move_trash" => Ok(OpKind::MoveTrash),
            "mark_read" => Ok(OpKind::MarkRead),
            other => Err(CacheError::InvalidData(format!("unknown operation {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Success,
    Failed,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Success => "success",
            OpStatus::Failed => "failed",
        }
    }
}

/// A queued outbound mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOp {
    pub id: i64,
    pub account: String,
    pub mailbox: String,
    pub kind: OpKind,
    pub uid: u32,
    pub created_at: DateTime<Utc>,
    pub retries: i64,
    pub last_error: Option<String>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct PendingOpRow {
    pub id: i64,
    pub account: String,
    pub mailbox: String,
    pub operation: String,
    pub uid: i64,
    pub created_at: i64,
    pub retries: i64,
    pub last_error: Option<String>,
}

impl TryFrom<PendingOpRow> for PendingOp {
    type Error = CacheError;

    fn try_from(row: PendingOpRow) -> Result<Self, Self::Error> {
        Ok(PendingOp {
            id: row.id,
            account: row.account,
            mailbox: row.mailbox,
            kind: row.operation.parse()?,
            uid: row.uid as u32,
            created_at: from_unix(row.created_at),
            retries: row.retries,
            last_error: row.last_error,
        })
    }
}

/// One audited attempt at applying a pending op.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OpLogEntry {
    pub id: i64,
    pub account: String,
    pub mailbox: String,
    pub operation: String,
    pub uid: i64,
    pub status: String,
    pub error: Option<String>,
    pub created_at: i64,
}
