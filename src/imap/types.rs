// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a mailbox right after SELECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxInfo {
    pub name: String,
    pub exists: u32,
    pub uid_validity: Option<u32>,
}

/// Attachment metadata. Content is fetched on demand by `part_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub part_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: u32,
    pub encoding: String,
}

/// Envelope-level view of a message; no body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMeta {
    pub uid: u32,
    pub message_id: String,
    pub internal_date: Option<DateTime<Utc>>,
    pub from: String,
    pub reply_to: String,
    pub to: String,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub unread: bool,
    pub references: String,
    pub attachments: Vec<Attachment>,
}

/// Rendered body of a fully fetched message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBody {
    pub html: String,
    pub snippet: String,
}

/// A LIST entry. Attributes keep their IMAP spelling, e.g. `\Trash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub name: String,
    pub attributes: Vec<String>,
}

impl Folder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), attributes: Vec::new() }
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attributes.push(attribute.into());
        self
    }

    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.attributes.iter().any(|a| a.eq_ignore_ascii_case(attribute))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOperation {
    Add,
    Remove,
}

impl FlagOperation {
    pub fn store_command(self) -> &'static str {
        match self {
            FlagOperation::Add => "+FLAGS",
            FlagOperation::Remove => "-FLAGS",
        }
    }
}

/// Comma-separated UID set, e.g. `3,7,12`.
pub fn uid_set(uids: &[u32]) -> String {
    uids.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(",")
}
