// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::config::AccountConfig;
use crate::imap::error::ImapError;
use crate::imap::types::{FlagOperation, Folder, MailboxInfo, MessageMeta};

pub const SEEN_FLAG: &str = "\\Seen";
pub const DELETED_FLAG: &str = "\\Deleted";

const TRASH_CANDIDATES: [&str; 4] = ["Trash", "Deleted", "Deleted Items", "Deleted Messages"];
const DRAFT_CANDIDATES: [&str; 2] = ["Drafts", "Draft"];

pub type BoxedSession = Box<dyn MailSession>;

/// A logged-in IMAP session.
///
/// UID-based calls act on the currently selected mailbox, so callers select
/// first. Implementations are not shared: the connection pool hands out
/// exclusive access per account.
#[async_trait]
pub trait MailSession: Send {
    async fn select(&mut self, mailbox: &str) -> Result<MailboxInfo, ImapError>;

    /// Metadata for sequence numbers `start..=end`.
    async fn fetch_sequence_range(&mut self, start: u32, end: u32) -> Result<Vec<MessageMeta>, ImapError>;

    async fn fetch_metadata(&mut self, uids: &[u32]) -> Result<Vec<MessageMeta>, ImapError>;

    /// UIDs of messages with an internal date on or after `since`.
    async fn search_since(&mut self, since: NaiveDate) -> Result<Vec<u32>, ImapError>;

    async fn search_text(&mut self, query: &str) -> Result<Vec<u32>, ImapError>;

    /// Full RFC 822 message, or `None` if the UID no longer exists.
    async fn fetch_raw(&mut self, uid: u32) -> Result<Option<Vec<u8>>, ImapError>;

    /// Raw (still transfer-encoded) content of one body part.
    async fn fetch_part(&mut self, uid: u32, part_id: &str) -> Result<Option<Vec<u8>>, ImapError>;

    async fn store_flags(&mut self, uids: &[u32], op: FlagOperation, flag: &str) -> Result<(), ImapError>;

    async fn expunge(&mut self) -> Result<(), ImapError>;

    async fn move_uids(&mut self, uids: &[u32], target: &str) -> Result<(), ImapError>;

    async fn list_folders(&mut self) -> Result<Vec<Folder>, ImapError>;

    async fn append(&mut self, mailbox: &str, content: &[u8]) -> Result<(), ImapError>;

    async fn logout(&mut self) -> Result<(), ImapError>;

    async fn trash_folder(&mut self) -> Result<String, ImapError> {
        let folders = self.list_folders().await?;
        pick_special_folder(&folders, "[Gmail]/Trash", "\\Trash", &TRASH_CANDIDATES)
            .ok_or_else(|| ImapError::FolderNotFound("trash".to_string()))
    }

    async fn drafts_folder(&mut self) -> Result<String, ImapError> {
        let folders = self.list_folders().await?;
        pick_special_folder(&folders, "[Gmail]/Drafts", "\\Drafts", &DRAFT_CANDIDATES)
            .ok_or_else(|| ImapError::FolderNotFound("drafts".to_string()))
    }

    /// Flags the UIDs `\Deleted` and expunges the selected mailbox.
    async fn delete_uids(&mut self, uids: &[u32]) -> Result<(), ImapError> {
        self.store_flags(uids, FlagOperation::Add, DELETED_FLAG).await?;
        self.expunge().await
    }

    /// Moves UIDs out of `mailbox` into the trash folder.
    ///
    /// Folder discovery issues a LIST, so the source mailbox is selected
    /// again before the MOVE.
    async fn move_to_trash(&mut self, mailbox: &str, uids: &[u32]) -> Result<(), ImapError> {
        let trash = self.trash_folder().await?;
        self.select(mailbox).await?;
        self.move_uids(uids, &trash).await
    }
}

/// Connects and logs in to an account's IMAP server.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, account: &AccountConfig) -> Result<BoxedSession, ImapError>;
}

/// Provider-specific name first, then the special-use attribute, then the
/// conventional names in order.
pub fn pick_special_folder(
    folders: &[Folder],
    preferred: &str,
    attribute: &str,
    fallbacks: &[&str],
) -> Option<String> {
    if let Some(f) = folders.iter().find(|f| f.name == preferred) {
        return Some(f.name.clone());
    }
    if let Some(f) = folders.iter().find(|f| f.has_attribute(attribute)) {
        return Some(f.name.clone());
    }
    fallbacks
        .iter()
        .find_map(|name| folders.iter().find(|f| f.name.eq_ignore_ascii_case(name)))
        .map(|f| f.name.clone())
}
