// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-account runtime state and every cache-backed read and write the
//! protocol server exposes.

mod pending;
mod sync;

pub use pending::ProcessReport;
pub use sync::SyncReport;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{CacheService, CachedEmail, OpKind};
use crate::config::{AccountConfig, Settings};
use crate::connection_pool::ConnectionPool;
use crate::error::{MailyError, Result};
use crate::imap::parse::{build_draft, decode_transfer, parse_body, sanitize_filename};
use crate::imap::session::SEEN_FLAG;
use crate::imap::{FlagOperation, SessionFactory};

pub const INBOX: &str = "INBOX";

/// Tunables for sync and downloads.
#[derive(Debug, Clone)]
pub struct StateOptions {
    pub sync_days: i64,
    pub min_sync_emails: u32,
    pub prefetch_bodies: usize,
    /// A mailbox synced more recently than this is fresh.
    pub fresh_for: Duration,
    pub download_dir: PathBuf,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            sync_days: 14,
            min_sync_emails: 100,
            prefetch_bodies: 10,
            fresh_for: Duration::from_secs(600),
            download_dir: PathBuf::from("."),
        }
    }
}

impl StateOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            sync_days: settings.sync.days,
            min_sync_emails: settings.sync.min_emails,
            prefetch_bodies: settings.sync.prefetch_bodies,
            fresh_for: settings.sync.interval(),
            download_dir: settings.download_dir(),
        }
    }
}

#[derive(Debug, Default)]
struct SyncFlags {
    syncing: bool,
    last_sync: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Runtime record for one account. The pooled connection lives in the
/// [`ConnectionPool`] slot of the same account.
#[derive(Debug)]
pub struct AccountState {
    pub config: AccountConfig,
    flags: Mutex<SyncFlags>,
}

impl AccountState {
    fn new(config: AccountConfig) -> Self {
        Self { config, flags: Mutex::new(SyncFlags::default()) }
    }

    fn flags(&self) -> std::sync::MutexGuard<'_, SyncFlags> {
        self.flags.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims the account's sync slot, or fails if a sync is running.
    pub fn try_start_sync(self: &Arc<Self>) -> Result<SyncGuard> {
        let mut flags = self.flags();
        if flags.syncing {
            return Err(MailyError::SyncInProgress);
        }
        flags.syncing = true;
        Ok(SyncGuard { state: Arc::clone(self), ended: false })
    }

    fn end_sync(&self, error: Option<String>) {
        let mut flags = self.flags();
        flags.syncing = false;
        flags.last_sync = Some(Utc::now());
        flags.last_error = error;
    }

    pub fn is_syncing(&self) -> bool {
        self.flags().syncing
    }
}

/// Held for the duration of one sync. Ending it, explicitly or by drop,
/// records `last_sync` and `last_error`.
pub struct SyncGuard {
    state: Arc<AccountState>,
    ended: bool,
}

impl SyncGuard {
    pub fn end(mut self, error: Option<String>) {
        self.state.end_sync(error);
        self.ended = true;
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        if !self.ended {
            self.state.end_sync(Some("sync aborted".to_string()));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub email: String,
    pub provider: String,
    pub syncing: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub email_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub account: String,
    pub syncing: bool,
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Central registry of accounts. Built once at startup; per-account state
/// is guarded by that account's own locks only.
pub struct StateManager {
    accounts: HashMap<String, Arc<AccountState>>,
    order: Vec<String>,
    cache: Arc<CacheService>,
    pool: Arc<ConnectionPool>,
    options: StateOptions,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("accounts", &self.order)
            .field("options", &self.options)
            .finish()
    }
}

impl StateManager {
    pub fn new(
        accounts: &[AccountConfig],
        cache: Arc<CacheService>,
        factory: Arc<dyn SessionFactory>,
        options: StateOptions,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(factory, accounts));
        let order = accounts.iter().map(|a| a.email.clone()).collect();
        let accounts = accounts
            .iter()
            .map(|a| (a.email.clone(), Arc::new(AccountState::new(a.clone()))))
            .collect();
        Self { accounts, order, cache, pool, options }
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn options(&self) -> &StateOptions {
        &self.options
    }

    pub fn account_names(&self) -> &[String] {
        &self.order
    }

    pub fn account(&self, account: &str) -> Result<&Arc<AccountState>> {
        self.accounts
            .get(account)
            .ok_or_else(|| MailyError::AccountNotFound(account.to_string()))
    }

    pub async fn accounts(&self) -> Result<Vec<AccountInfo>> {
        let mut infos = Vec::with_capacity(self.order.len());
        for email in &self.order {
            let state = self.account(email)?;
            let email_count = self.cache.count_emails(email, INBOX).await?;
            let (syncing, last_sync) = {
                let flags = state.flags();
                (flags.syncing, flags.last_sync)
            };
            infos.push(AccountInfo {
                email: email.clone(),
                provider: state.config.provider.clone(),
                syncing,
                last_sync,
                email_count,
            });
        }
        Ok(infos)
    }

    pub fn sync_status(&self, account: &str) -> Result<SyncStatus> {
        let state = self.account(account)?;
        let flags = state.flags();
        Ok(SyncStatus {
            account: account.to_string(),
            syncing: flags.syncing,
            last_sync: flags.last_sync,
            last_error: flags.last_error.clone(),
        })
    }

    pub async fn get_emails(&self, account: &str, mailbox: &str, limit: usize) -> Result<Vec<CachedEmail>> {
        self.account(account)?;
        Ok(self.cache.load_emails(account, mailbox, limit).await?)
    }

    pub async fn get_email(&self, account: &str, mailbox: &str, uid: u32) -> Result<CachedEmail> {
        self.account(account)?;
        self.cache
            .get_email(account, mailbox, uid)
            .await?
            .ok_or(MailyError::EmailNotFound)
    }

    /// Cached row with its body, fetching and persisting the body first if
    /// it was never downloaded.
    ///
    /// A message gone from the server is evicted and reported as
    /// [`MailyError::DeletedElsewhere`].
    pub async fn get_email_with_body(&self, account: &str, mailbox: &str, uid: u32) -> Result<CachedEmail> {
        let mut email = self.get_email(account, mailbox, uid).await?;
        if email.has_body() {
            return Ok(email);
        }

        let mbox = mailbox.to_string();
        let raw = self
            .pool
            .with_session(account, move |session| {
                Box::pin(async move {
                    session.select(&mbox).await?;
                    session.fetch_raw(uid).await
                })
            })
            .await?;

        let Some(raw) = raw else {
            info!("Email {}/{}/{} is gone from the server; evicting", account, mailbox, uid);
            self.cache.delete_email(account, mailbox, uid).await?;
            return Err(MailyError::DeletedElsewhere);
        };

        let body = parse_body(&raw);
        self.cache
            .update_email_body(account, mailbox, uid, &body.html, &body.snippet)
            .await?;
        email.body_html = body.html;
        email.snippet = body.snippet;
        Ok(email)
    }

    /// Sets or clears `\Seen` on the server, then mirrors it in the cache.
    pub async fn mark_read(&self, account: &str, mailbox: &str, uids: &[u32], read: bool) -> Result<()> {
        self.account(account)?;
        if uids.is_empty() {
            return Ok(());
        }

        let mbox = mailbox.to_string();
        let targets = uids.to_vec();
        let op = if read { FlagOperation::Add } else { FlagOperation::Remove };
        self.pool
            .with_session(account, move |session| {
                Box::pin(async move {
                    session.select(&mbox).await?;
                    session.store_flags(&targets, op, SEEN_FLAG).await
                })
            })
            .await?;

        for &uid in uids {
            self.cache.update_email_flags(account, mailbox, uid, !read).await?;
        }
        debug!("Marked {} email(s) in {}/{} read={}", uids.len(), account, mailbox, read);
        Ok(())
    }

    /// Deletes on the server (flag + expunge), then drops the cached rows.
    pub async fn delete_emails(&self, account: &str, mailbox: &str, uids: &[u32]) -> Result<()> {
        self.account(account)?;
        if uids.is_empty() {
            return Ok(());
        }

        let mbox = mailbox.to_string();
        let targets = uids.to_vec();
        self.pool
            .with_session(account, move |session| {
                Box::pin(async move {
                    session.select(&mbox).await?;
                    session.delete_uids(&targets).await
                })
            })
            .await?;

        for &uid in uids {
            self.cache.delete_email(account, mailbox, uid).await?;
        }
        info!("Deleted {} email(s) from {}/{}", uids.len(), account, mailbox);
        Ok(())
    }

    /// Moves to the account's trash folder, then drops the cached rows.
    pub async fn move_to_trash(&self, account: &str, mailbox: &str, uids: &[u32]) -> Result<()> {
        self.account(account)?;
        if uids.is_empty() {
            return Ok(());
        }

        let mbox = mailbox.to_string();
        let targets = uids.to_vec();
        self.pool
            .with_session(account, move |session| {
                Box::pin(async move {
                    session.select(&mbox).await?;
                    session.move_to_trash(&mbox, &targets).await
                })
            })
            .await?;

        for &uid in uids {
            self.cache.delete_email(account, mailbox, uid).await?;
        }
        info!("Moved {} email(s) from {}/{} to trash", uids.len(), account, mailbox);
        Ok(())
    }

    pub async fn queue_op(&self, account: &str, mailbox: &str, kind: OpKind, uid: u32) -> Result<()> {
        self.queue_ops(account, mailbox, kind, &[uid]).await
    }

    /// Records one durable op per UID and drops the cached rows.
    /// The server is not contacted; the pending-op processor applies them.
    pub async fn queue_ops(&self, account: &str, mailbox: &str, kind: OpKind, uids: &[u32]) -> Result<()> {
        self.account(account)?;
        if uids.is_empty() {
            return Ok(());
        }
        self.cache.enqueue_ops(account, mailbox, kind, uids).await?;
        Ok(())
    }

    /// Folder names from LIST, sorted.
    pub async fn get_labels(&self, account: &str) -> Result<Vec<String>> {
        self.account(account)?;
        let folders = self
            .pool
            .with_session(account, |session| Box::pin(async move { session.list_folders().await }))
            .await?;
        let mut names: Vec<String> = folders
            .into_iter()
            .filter(|f| !f.has_attribute("\\NoSelect"))
            .map(|f| f.name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Server-side full-text search. Results are not cached.
    pub async fn search(&self, account: &str, mailbox: &str, query: &str) -> Result<Vec<CachedEmail>> {
        self.account(account)?;
        if query.trim().is_empty() {
            return Err(MailyError::InvalidRequest("empty search query".to_string()));
        }

        let mbox = mailbox.to_string();
        let query = query.to_string();
        let metas = self
            .pool
            .with_session(account, move |session| {
                Box::pin(async move {
                    session.select(&mbox).await?;
                    let uids = session.search_text(&query).await?;
                    session.fetch_metadata(&uids).await
                })
            })
            .await?;

        let mut emails: Vec<CachedEmail> = metas.iter().map(CachedEmail::from_meta).collect();
        emails.sort_by(|a, b| b.internal_date.cmp(&a.internal_date).then(b.uid.cmp(&a.uid)));
        Ok(emails)
    }

    /// Appends a plain-text draft to the account's drafts folder.
    pub async fn save_draft(&self, account: &str, to: &str, subject: &str, body: &str) -> Result<()> {
        let from = self.account(account)?.config.email.clone();
        let message = build_draft(&from, to, subject, body, Utc::now());
        self.pool
            .with_session(account, move |session| {
                Box::pin(async move {
                    let drafts = session.drafts_folder().await?;
                    session.append(&drafts, &message).await
                })
            })
            .await?;
        info!("Saved draft for {} to {}", account, to);
        Ok(())
    }

    /// Fetches one attachment part, decodes it and writes it to the download
    /// directory. Returns the written path.
    pub async fn download_attachment(
        &self,
        account: &str,
        mailbox: &str,
        uid: u32,
        part_id: &str,
        filename: Option<&str>,
        encoding: Option<&str>,
    ) -> Result<PathBuf> {
        self.account(account)?;
        if part_id.is_empty() {
            return Err(MailyError::InvalidRequest("part_id is required".to_string()));
        }

        let known = self
            .cache
            .get_email(account, mailbox, uid)
            .await?
            .and_then(|email| email.attachments.into_iter().find(|a| a.part_id == part_id));
        let encoding = encoding
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .or_else(|| known.as_ref().map(|a| a.encoding.clone()))
            .unwrap_or_default();
        let filename = filename
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .or_else(|| known.as_ref().map(|a| a.filename.clone()).filter(|f| !f.is_empty()))
            .unwrap_or_else(|| format!("attachment-{}-{}", uid, part_id));

        let mbox = mailbox.to_string();
        let part = part_id.to_string();
        let data = self
            .pool
            .with_session(account, move |session| {
                Box::pin(async move {
                    session.select(&mbox).await?;
                    session.fetch_part(uid, &part).await
                })
            })
            .await?
            .ok_or_else(|| MailyError::Attachment(format!("part {} of message {} not found", part_id, uid)))?;

        let content = decode_transfer(&data, &encoding);
        let path = write_unique(&self.options.download_dir, &sanitize_filename(&filename), &content).await?;
        info!("Saved attachment {} ({} bytes) to {}", part_id, content.len(), path.display());
        Ok(path)
    }

    /// Accounts the poller should sync; with `only_stale`, accounts whose
    /// INBOX is still fresh are skipped.
    pub async fn accounts_to_sync(&self, only_stale: bool) -> Vec<String> {
        let mut due = Vec::new();
        for email in &self.order {
            if only_stale {
                match self.cache.is_fresh(email, INBOX, self.options.fresh_for).await {
                    Ok(true) => {
                        debug!("Cache for {} is fresh; skipping initial sync", email);
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Freshness check for {} failed: {}", email, e),
                }
            }
            due.push(email.clone());
        }
        due
    }

    /// Closes every pooled IMAP connection.
    pub async fn shutdown(&self) {
        self.pool.close_all().await;
    }
}

/// Writes `content` under `dir`, adding ` (n)` before the extension if the
/// name is taken.
async fn write_unique(dir: &Path, filename: &str, content: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let (stem, ext) = match filename.rfind('.') {
        Some(idx) if idx > 0 => (&filename[..idx], &filename[idx..]),
        _ => (filename, ""),
    };

    let mut candidate = dir.join(filename);
    let mut n = 1;
    loop {
        match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&candidate).await {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(content).await?;
                file.flush().await?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                candidate = dir.join(format!("{} ({}){}", stem, n, ext));
                n += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
