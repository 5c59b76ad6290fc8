// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory IMAP server for tests.
//!
//! [`FakeMailServer`] implements [`SessionFactory`]; every session it hands
//! out shares the same mailboxes. Flip [`FakeMailServer::set_broken`] to make
//! connects and every command fail with a transport error.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::AccountConfig;
use crate::imap::session::{DELETED_FLAG, SEEN_FLAG};
use crate::imap::{
    Attachment, BoxedSession, FlagOperation, Folder, ImapError, MailSession, MailboxInfo, MessageMeta,
    SessionFactory,
};

/// Account config pointing nowhere, for building a state manager.
pub fn test_account(email: &str) -> AccountConfig {
    AccountConfig {
        email: email.to_string(),
        provider: "test".to_string(),
        imap_host: "imap.invalid".to_string(),
        imap_port: 993,
        username: None,
        password: "secret".to_string(),
        smtp_host: None,
        smtp_port: None,
    }
}

/// Message to seed into a fake mailbox.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub subject: String,
    pub from: String,
    pub body: String,
    pub received: DateTime<Utc>,
    pub seen: bool,
    pub attachment: Option<(String, Vec<u8>)>,
}

impl NewMessage {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            from: "sender@example.com".to_string(),
            body: "Hello there".to_string(),
            received: Utc::now(),
            seen: false,
            attachment: None,
        }
    }

    pub fn received(mut self, at: DateTime<Utc>) -> Self {
        self.received = at;
        self
    }

    pub fn days_old(self, days: i64) -> Self {
        self.received(Utc::now() - chrono::Duration::days(days))
    }

    pub fn seen(mut self) -> Self {
        self.seen = true;
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_attachment(mut self, filename: impl Into<String>, content: &[u8]) -> Self {
        self.attachment = Some((filename.into(), content.to_vec()));
        self
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    uid: u32,
    message: NewMessage,
    flags: Vec<String>,
    raw: Vec<u8>,
}

impl StoredMessage {
    fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }

    fn meta(&self) -> MessageMeta {
        let attachments = self
            .message
            .attachment
            .as_ref()
            .map(|(filename, content)| Attachment {
                part_id: "2".to_string(),
                filename: filename.clone(),
                content_type: "application/octet-stream".to_string(),
                size: content.len() as u32,
                encoding: "base64".to_string(),
            })
            .into_iter()
            .collect();
        MessageMeta {
            uid: self.uid,
            message_id: format!("<{}@fake.invalid>", self.uid),
            internal_date: Some(self.message.received),
            from: self.message.from.clone(),
            reply_to: self.message.from.clone(),
            to: "me@example.com".to_string(),
            subject: self.message.subject.clone(),
            date: Some(self.message.received),
            unread: !self.has_flag(SEEN_FLAG),
            references: String::new(),
            attachments,
        }
    }
}

#[derive(Debug)]
struct FakeMailbox {
    uid_validity: u32,
    next_uid: u32,
    messages: Vec<StoredMessage>,
}

impl FakeMailbox {
    fn new(uid_validity: u32) -> Self {
        Self { uid_validity, next_uid: 1, messages: Vec::new() }
    }

    fn push(&mut self, message: NewMessage, raw: Vec<u8>, flags: Vec<String>) -> u32 {
        let uid = self.next_uid;
        self.next_uid += 1;
        self.messages.push(StoredMessage { uid, message, flags, raw });
        uid
    }

    fn find(&self, uid: u32) -> Option<&StoredMessage> {
        self.messages.iter().find(|m| m.uid == uid)
    }
}

/// Counters of what clients did to the fake server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeStats {
    pub connects: usize,
    pub commands: usize,
    pub body_fetches: usize,
    pub stores: usize,
    pub deletes: usize,
    pub moves: usize,
    pub appends: usize,
}

#[derive(Debug, Default)]
struct Inner {
    mailboxes: BTreeMap<String, FakeMailbox>,
    attributes: HashMap<String, Vec<String>>,
    broken: bool,
    failures: usize,
    latency: Option<Duration>,
    stats: FakeStats,
}

#[derive(Debug, Clone, Default)]
pub struct FakeMailServer {
    inner: Arc<Mutex<Inner>>,
}

fn render_raw(message: &NewMessage) -> Vec<u8> {
    format!(
        "From: {}\r\nTo: me@example.com\r\nSubject: {}\r\nDate: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
        message.from,
        message.subject,
        message.received.to_rfc2822(),
        message.body
    )
    .into_bytes()
}

impl FakeMailServer {
    /// A server with `INBOX` and a `Trash` folder marked `\Trash`.
    pub fn new() -> Self {
        let server = Self::default();
        server.add_mailbox("INBOX");
        server.add_folder("Trash", Some("\\Trash"));
        server
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_mailbox(&self, name: &str) {
        self.lock().mailboxes.entry(name.to_string()).or_insert_with(|| FakeMailbox::new(1));
    }

    pub fn add_folder(&self, name: &str, attribute: Option<&str>) {
        let mut inner = self.lock();
        inner.mailboxes.entry(name.to_string()).or_insert_with(|| FakeMailbox::new(1));
        if let Some(attribute) = attribute {
            inner.attributes.entry(name.to_string()).or_default().push(attribute.to_string());
        }
    }

    pub fn add_message(&self, mailbox: &str, message: NewMessage) -> u32 {
        let raw = render_raw(&message);
        let flags = if message.seen { vec![SEEN_FLAG.to_string()] } else { Vec::new() };
        let mut inner = self.lock();
        inner
            .mailboxes
            .entry(mailbox.to_string())
            .or_insert_with(|| FakeMailbox::new(1))
            .push(message, raw, flags)
    }

    /// Seeds `count` messages, the newest last, one hour apart.
    pub fn populate(&self, mailbox: &str, count: usize) -> Vec<u32> {
        let now = Utc::now();
        (0..count)
            .map(|i| {
                let age = chrono::Duration::hours((count - i) as i64);
                self.add_message(mailbox, NewMessage::new(format!("Message {}", i + 1)).received(now - age))
            })
            .collect()
    }

    /// Removes a message as another client would.
    pub fn remove_message(&self, mailbox: &str, uid: u32) {
        if let Some(mbox) = self.lock().mailboxes.get_mut(mailbox) {
            mbox.messages.retain(|m| m.uid != uid);
        }
    }

    pub fn set_uid_validity(&self, mailbox: &str, uid_validity: u32) {
        if let Some(mbox) = self.lock().mailboxes.get_mut(mailbox) {
            mbox.uid_validity = uid_validity;
        }
    }

    /// While broken, connects and commands fail with a transport error.
    pub fn set_broken(&self, broken: bool) {
        self.lock().broken = broken;
    }

    /// The next `count` session commands fail with a transport error.
    /// Connects are unaffected.
    pub fn fail_next_commands(&self, count: usize) {
        self.lock().failures = count;
    }

    /// Delay added to every SELECT.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    pub fn stats(&self) -> FakeStats {
        self.lock().stats
    }

    pub fn uids(&self, mailbox: &str) -> Vec<u32> {
        self.lock()
            .mailboxes
            .get(mailbox)
            .map(|m| m.messages.iter().map(|msg| msg.uid).collect())
            .unwrap_or_default()
    }

    pub fn subjects(&self, mailbox: &str) -> Vec<String> {
        self.lock()
            .mailboxes
            .get(mailbox)
            .map(|m| m.messages.iter().map(|msg| msg.message.subject.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_seen(&self, mailbox: &str, uid: u32) -> bool {
        self.lock()
            .mailboxes
            .get(mailbox)
            .and_then(|m| m.find(uid))
            .map(|msg| msg.has_flag(SEEN_FLAG))
            .unwrap_or(false)
    }

    pub fn raw_message(&self, mailbox: &str, uid: u32) -> Option<Vec<u8>> {
        self.lock().mailboxes.get(mailbox).and_then(|m| m.find(uid)).map(|msg| msg.raw.clone())
    }

    /// A session without going through [`SessionFactory::connect`].
    pub fn session(&self) -> BoxedSession {
        Box::new(FakeSession { server: self.clone(), selected: None })
    }
}

#[async_trait]
impl SessionFactory for FakeMailServer {
    async fn connect(&self, _account: &AccountConfig) -> Result<BoxedSession, ImapError> {
        let mut inner = self.lock();
        if inner.broken {
            return Err(ImapError::Io("connection refused".to_string()));
        }
        inner.stats.connects += 1;
        Ok(Box::new(FakeSession { server: self.clone(), selected: None }))
    }
}

/// One logged-in session against a [`FakeMailServer`].
pub struct FakeSession {
    server: FakeMailServer,
    selected: Option<String>,
}

impl FakeSession {
    /// Counts the command and fails it if the server is broken.
    fn begin(&self) -> Result<MutexGuard<'_, Inner>, ImapError> {
        let mut inner = self.server.lock();
        if inner.broken {
            return Err(ImapError::Io("broken pipe".to_string()));
        }
        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(ImapError::Io("broken pipe".to_string()));
        }
        inner.stats.commands += 1;
        Ok(inner)
    }

    fn selected(&self) -> Result<String, ImapError> {
        self.selected
            .clone()
            .ok_or_else(|| ImapError::Command("no mailbox selected".to_string()))
    }
}

fn mailbox_mut<'a>(inner: &'a mut Inner, name: &str) -> Result<&'a mut FakeMailbox, ImapError> {
    inner
        .mailboxes
        .get_mut(name)
        .ok_or_else(|| ImapError::Mailbox(format!("no such mailbox: {}", name)))
}

#[async_trait]
impl MailSession for FakeSession {
    async fn select(&mut self, mailbox: &str) -> Result<MailboxInfo, ImapError> {
        let latency = self.server.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let info = {
            let mut inner = self.begin()?;
            let mbox = mailbox_mut(&mut inner, mailbox)?;
            MailboxInfo {
                name: mailbox.to_string(),
                exists: mbox.messages.len() as u32,
                uid_validity: Some(mbox.uid_validity),
            }
        };
        self.selected = Some(mailbox.to_string());
        Ok(info)
    }

    async fn fetch_sequence_range(&mut self, start: u32, end: u32) -> Result<Vec<MessageMeta>, ImapError> {
        let selected = self.selected()?;
        let mut inner = self.begin()?;
        let mbox = mailbox_mut(&mut inner, &selected)?;
        let from = start.max(1) as usize - 1;
        let to = (end as usize).min(mbox.messages.len());
        Ok(mbox.messages.get(from..to).unwrap_or_default().iter().map(StoredMessage::meta).collect())
    }

    async fn fetch_metadata(&mut self, uids: &[u32]) -> Result<Vec<MessageMeta>, ImapError> {
        let selected = self.selected()?;
        let mut inner = self.begin()?;
        let mbox = mailbox_mut(&mut inner, &selected)?;
        Ok(mbox
            .messages
            .iter()
            .filter(|m| uids.contains(&m.uid))
            .map(StoredMessage::meta)
            .collect())
    }

    async fn search_since(&mut self, since: NaiveDate) -> Result<Vec<u32>, ImapError> {
        let selected = self.selected()?;
        let mut inner = self.begin()?;
        let mbox = mailbox_mut(&mut inner, &selected)?;
        Ok(mbox
            .messages
            .iter()
            .filter(|m| m.message.received.date_naive() >= since)
            .map(|m| m.uid)
            .collect())
    }

    async fn search_text(&mut self, query: &str) -> Result<Vec<u32>, ImapError> {
        let selected = self.selected()?;
        let needle = query.to_lowercase();
        let mut inner = self.begin()?;
        let mbox = mailbox_mut(&mut inner, &selected)?;
        Ok(mbox
            .messages
            .iter()
            .filter(|m| {
                m.message.subject.to_lowercase().contains(&needle) || m.message.body.to_lowercase().contains(&needle)
            })
            .map(|m| m.uid)
            .collect())
    }

    async fn fetch_raw(&mut self, uid: u32) -> Result<Option<Vec<u8>>, ImapError> {
        let selected = self.selected()?;
        let mut inner = self.begin()?;
        inner.stats.body_fetches += 1;
        let mbox = mailbox_mut(&mut inner, &selected)?;
        Ok(mbox.find(uid).map(|m| m.raw.clone()))
    }

    async fn fetch_part(&mut self, uid: u32, part_id: &str) -> Result<Option<Vec<u8>>, ImapError> {
        let selected = self.selected()?;
        let mut inner = self.begin()?;
        let mbox = mailbox_mut(&mut inner, &selected)?;
        Ok(mbox.find(uid).and_then(|m| match (&m.message.attachment, part_id) {
            (Some((_, content)), "2") => Some(STANDARD.encode(content).into_bytes()),
            _ => None,
        }))
    }

    async fn store_flags(&mut self, uids: &[u32], op: FlagOperation, flag: &str) -> Result<(), ImapError> {
        let selected = self.selected()?;
        let mut inner = self.begin()?;
        inner.stats.stores += 1;
        let mbox = mailbox_mut(&mut inner, &selected)?;
        for message in mbox.messages.iter_mut().filter(|m| uids.contains(&m.uid)) {
            match op {
                FlagOperation::Add if !message.has_flag(flag) => message.flags.push(flag.to_string()),
                FlagOperation::Remove => message.flags.retain(|f| !f.eq_ignore_ascii_case(flag)),
                _ => {}
            }
        }
        Ok(())
    }

    async fn expunge(&mut self) -> Result<(), ImapError> {
        let selected = self.selected()?;
        let mut inner = self.begin()?;
        let mbox = mailbox_mut(&mut inner, &selected)?;
        let before = mbox.messages.len();
        mbox.messages.retain(|m| !m.has_flag(DELETED_FLAG));
        let removed = before - mbox.messages.len();
        inner.stats.deletes += removed;
        Ok(())
    }

    async fn move_uids(&mut self, uids: &[u32], target: &str) -> Result<(), ImapError> {
        let selected = self.selected()?;
        let mut inner = self.begin()?;
        if !inner.mailboxes.contains_key(target) {
            return Err(ImapError::Mailbox(format!("no such mailbox: {}", target)));
        }
        let source = mailbox_mut(&mut inner, &selected)?;
        let (moving, staying): (Vec<_>, Vec<_>) = source.messages.drain(..).partition(|m| uids.contains(&m.uid));
        source.messages = staying;
        let moved = moving.len();

        let destination = mailbox_mut(&mut inner, target)?;
        for message in moving {
            destination.push(message.message, message.raw, message.flags);
        }
        inner.stats.moves += moved;
        Ok(())
    }

    async fn list_folders(&mut self) -> Result<Vec<Folder>, ImapError> {
        let inner = self.begin()?;
        Ok(inner
            .mailboxes
            .keys()
            .map(|name| {
                let mut folder = Folder::new(name.clone());
                for attribute in inner.attributes.get(name).into_iter().flatten() {
                    folder = folder.with_attribute(attribute.clone());
                }
                folder
            })
            .collect())
    }

    async fn append(&mut self, mailbox: &str, content: &[u8]) -> Result<(), ImapError> {
        let mut inner = self.begin()?;
        inner.stats.appends += 1;
        let text = String::from_utf8_lossy(content);
        let subject = text
            .lines()
            .find_map(|line| line.strip_prefix("Subject: "))
            .unwrap_or_default()
            .to_string();
        let mbox = mailbox_mut(&mut inner, mailbox)?;
        mbox.push(NewMessage::new(subject), content.to_vec(), vec!["\\Draft".to_string()]);
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), ImapError> {
        self.begin()?;
        Ok(())
    }
}
