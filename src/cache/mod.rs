// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Durable SQLite store for email rows, sync metadata and the pending-op
//! queue.
//!
//! SQLite is the source of truth. The LRU only short-circuits single-row
//! lookups and every write to a row evicts its entry before returning.

mod models;
mod pending;

pub use models::{CachedEmail, Metadata, OpKind, OpLogEntry, OpStatus, PendingOp};

use chrono::Utc;
use log::{debug, info};
use lru::LruCache;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::imap::types::Attachment;
use models::{from_unix, AttachmentRow, EmailRow};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
    #[error("Cache not initialized")]
    NotInitialized,
    #[error("Invalid cached data: {0}")]
    InvalidData(String),
    #[error("Cache operation failed: {0}")]
    OperationFailed(String),
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub database_url: String,
    pub max_memory_items: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:data/cache.db".to_string(),
            max_memory_items: 1000,
        }
    }
}

pub struct CacheService {
    db_pool: Option<SqlitePool>,
    memory_cache: Arc<RwLock<LruCache<String, CachedEmail>>>,
    config: CacheConfig,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("db_pool", &self.db_pool.is_some())
            .field("memory_cache", &"<LruCache>")
            .field("config", &self.config)
            .finish()
    }
}

fn memory_key(account: &str, mailbox: &str, uid: u32) -> String {
    format!("{}/{}/{}", account, mailbox, uid)
}

const EMAIL_COLUMNS: &str = "uid, message_id, internal_date, from_addr, reply_to, to_addr, subject, date, snippet, body_html, unread, references_hdr";

impl CacheService {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_memory_items).unwrap_or(NonZeroUsize::MIN);
        Self {
            db_pool: None,
            memory_cache: Arc::new(RwLock::new(LruCache::new(capacity))),
            config,
        }
    }

    /// Opens the database, creating it and its directory if needed, and
    /// applies pending migrations.
    pub async fn initialize(&mut self) -> Result<(), CacheError> {
        info!("Initializing cache service with database: {}", self.config.database_url);

        let url = self.config.database_url.as_str();
        if !url.contains(":memory:") {
            let db_path = url.trim_start_matches("sqlite://").trim_start_matches("sqlite:");
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        CacheError::OperationFailed(format!("Failed to create data directory: {}", e))
                    })?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        self.db_pool = Some(pool);
        info!("Cache service initialized successfully");
        Ok(())
    }

    pub(crate) fn pool(&self) -> Result<&SqlitePool, CacheError> {
        self.db_pool.as_ref().ok_or(CacheError::NotInitialized)
    }

    async fn forget(&self, account: &str, mailbox: &str, uid: u32) {
        self.memory_cache.write().await.pop(&memory_key(account, mailbox, uid));
    }

    /// Rows of one mailbox, newest first. `limit == 0` means all.
    pub async fn load_emails(
        &self,
        account: &str,
        mailbox: &str,
        limit: usize,
    ) -> Result<Vec<CachedEmail>, CacheError> {
        let pool = self.pool()?;
        let limit = if limit == 0 { -1 } else { limit as i64 };

        let rows = sqlx::query_as::<_, EmailRow>(&format!(
            "SELECT {} FROM emails WHERE account = ? AND mailbox = ? ORDER BY internal_date DESC, uid DESC LIMIT ?",
            EMAIL_COLUMNS
        ))
        .bind(account)
        .bind(mailbox)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        let attachment_rows = sqlx::query_as::<_, AttachmentRow>(
            "SELECT email_uid, part_id, filename, content_type, size, encoding FROM attachments WHERE account = ? AND mailbox = ? ORDER BY part_id",
        )
        .bind(account)
        .bind(mailbox)
        .fetch_all(pool)
        .await?;

        let mut attachments: HashMap<i64, Vec<Attachment>> = HashMap::new();
        for row in attachment_rows {
            attachments.entry(row.email_uid).or_default().push(row.into());
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let list = attachments.remove(&row.uid).unwrap_or_default();
                row.into_email(list)
            })
            .collect())
    }

    pub async fn get_email(
        &self,
        account: &str,
        mailbox: &str,
        uid: u32,
    ) -> Result<Option<CachedEmail>, CacheError> {
        let key = memory_key(account, mailbox, uid);
        // Held across the read so a concurrent write's eviction cannot be
        // overtaken by a stale insert.
        let mut memory = self.memory_cache.write().await;
        if let Some(email) = memory.get(&key) {
            return Ok(Some(email.clone()));
        }

        let pool = self.pool()?;
        let row = sqlx::query_as::<_, EmailRow>(&format!(
            "SELECT {} FROM emails WHERE account = ? AND mailbox = ? AND uid = ?",
            EMAIL_COLUMNS
        ))
        .bind(account)
        .bind(mailbox)
        .bind(uid as i64)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let attachments: Vec<Attachment> = sqlx::query_as::<_, AttachmentRow>(
            "SELECT email_uid, part_id, filename, content_type, size, encoding FROM attachments WHERE account = ? AND mailbox = ? AND email_uid = ? ORDER BY part_id",
        )
        .bind(account)
        .bind(mailbox)
        .bind(uid as i64)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(Attachment::from)
        .collect();

        let email = row.into_email(attachments);
        memory.put(key, email.clone());
        Ok(Some(email))
    }

    /// Inserts or fully replaces a row and its attachment list.
    pub async fn save_email(&self, account: &str, mailbox: &str, email: &CachedEmail) -> Result<(), CacheError> {
        let mut tx = self.pool()?.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO emails (account, mailbox, uid, message_id, internal_date, from_addr, reply_to, to_addr, subject, date, snippet, body_html, unread, references_hdr) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(account)
        .bind(mailbox)
        .bind(email.uid as i64)
        .bind(&email.message_id)
        .bind(email.internal_date.timestamp())
        .bind(&email.from)
        .bind(&email.reply_to)
        .bind(&email.to)
        .bind(&email.subject)
        .bind(email.date.timestamp())
        .bind(&email.snippet)
        .bind(&email.body_html)
        .bind(email.unread)
        .bind(&email.references)
        .execute(&mut *tx)
        .await?;

        replace_attachments(&mut tx, account, mailbox, email.uid, &email.attachments).await?;
        tx.commit().await?;

        self.forget(account, mailbox, email.uid).await;
        Ok(())
    }

    /// Inserts a metadata-only row unless one exists. An existing row keeps
    /// its body and only has its unread flag refreshed.
    ///
    /// Returns `true` when a new row was created.
    pub async fn insert_email_metadata_if_missing(
        &self,
        account: &str,
        mailbox: &str,
        email: &CachedEmail,
    ) -> Result<bool, CacheError> {
        let mut tx = self.pool()?.begin().await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO emails (account, mailbox, uid, message_id, internal_date, from_addr, reply_to, to_addr, subject, date, snippet, body_html, unread, references_hdr) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '', '', ?, ?)",
        )
        .bind(account)
        .bind(mailbox)
        .bind(email.uid as i64)
        .bind(&email.message_id)
        .bind(email.internal_date.timestamp())
        .bind(&email.from)
        .bind(&email.reply_to)
        .bind(&email.to)
        .bind(&email.subject)
        .bind(email.date.timestamp())
        .bind(email.unread)
        .bind(&email.references)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            replace_attachments(&mut tx, account, mailbox, email.uid, &email.attachments).await?;
        } else {
            sqlx::query("UPDATE emails SET unread = ? WHERE account = ? AND mailbox = ? AND uid = ?")
                .bind(email.unread)
                .bind(account)
                .bind(mailbox)
                .bind(email.uid as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.forget(account, mailbox, email.uid).await;
        Ok(inserted)
    }

    pub async fn update_email_flags(&self, account: &str, mailbox: &str, uid: u32, unread: bool) -> Result<(), CacheError> {
        sqlx::query("UPDATE emails SET unread = ? WHERE account = ? AND mailbox = ? AND uid = ?")
            .bind(unread)
            .bind(account)
            .bind(mailbox)
            .bind(uid as i64)
            .execute(self.pool()?)
            .await?;
        self.forget(account, mailbox, uid).await;
        Ok(())
    }

    pub async fn update_email_body(
        &self,
        account: &str,
        mailbox: &str,
        uid: u32,
        body_html: &str,
        snippet: &str,
    ) -> Result<(), CacheError> {
        sqlx::query("UPDATE emails SET body_html = ?, snippet = ? WHERE account = ? AND mailbox = ? AND uid = ?")
            .bind(body_html)
            .bind(snippet)
            .bind(account)
            .bind(mailbox)
            .bind(uid as i64)
            .execute(self.pool()?)
            .await?;
        self.forget(account, mailbox, uid).await;
        Ok(())
    }

    pub async fn delete_email(&self, account: &str, mailbox: &str, uid: u32) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM emails WHERE account = ? AND mailbox = ? AND uid = ?")
            .bind(account)
            .bind(mailbox)
            .bind(uid as i64)
            .execute(self.pool()?)
            .await?;
        self.forget(account, mailbox, uid).await;
        Ok(())
    }

    /// Drops every row of a mailbox, e.g. after a UIDVALIDITY change.
    pub async fn delete_mailbox(&self, account: &str, mailbox: &str) -> Result<u64, CacheError> {
        let removed = sqlx::query("DELETE FROM emails WHERE account = ? AND mailbox = ?")
            .bind(account)
            .bind(mailbox)
            .execute(self.pool()?)
            .await?
            .rows_affected();
        self.memory_cache.write().await.clear();
        debug!("Purged {} cached rows of {}/{}", removed, account, mailbox);
        Ok(removed)
    }

    pub async fn get_cached_uids(&self, account: &str, mailbox: &str) -> Result<HashSet<u32>, CacheError> {
        let uids: Vec<i64> = sqlx::query_scalar("SELECT uid FROM emails WHERE account = ? AND mailbox = ?")
            .bind(account)
            .bind(mailbox)
            .fetch_all(self.pool()?)
            .await?;
        Ok(uids.into_iter().map(|u| u as u32).collect())
    }

    pub async fn count_emails(&self, account: &str, mailbox: &str) -> Result<i64, CacheError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM emails WHERE account = ? AND mailbox = ?")
            .bind(account)
            .bind(mailbox)
            .fetch_one(self.pool()?)
            .await?;
        Ok(count)
    }

    /// UIDs of the most recent rows whose body has not been fetched yet.
    pub async fn uids_missing_body(&self, account: &str, mailbox: &str, limit: usize) -> Result<Vec<u32>, CacheError> {
        let uids: Vec<i64> = sqlx::query_scalar(
            "SELECT uid FROM emails WHERE account = ? AND mailbox = ? AND body_html = '' ORDER BY internal_date DESC, uid DESC LIMIT ?",
        )
        .bind(account)
        .bind(mailbox)
        .bind(limit as i64)
        .fetch_all(self.pool()?)
        .await?;
        Ok(uids.into_iter().map(|u| u as u32).collect())
    }

    pub async fn save_metadata(&self, account: &str, mailbox: &str, metadata: &Metadata) -> Result<(), CacheError> {
        sqlx::query("INSERT OR REPLACE INTO mailbox_metadata (account, mailbox, uid_validity, last_sync) VALUES (?, ?, ?, ?)")
            .bind(account)
            .bind(mailbox)
            .bind(metadata.uid_validity as i64)
            .bind(metadata.last_sync.timestamp())
            .execute(self.pool()?)
            .await?;
        Ok(())
    }

    pub async fn load_metadata(&self, account: &str, mailbox: &str) -> Result<Option<Metadata>, CacheError> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT uid_validity, last_sync FROM mailbox_metadata WHERE account = ? AND mailbox = ?",
        )
        .bind(account)
        .bind(mailbox)
        .fetch_optional(self.pool()?)
        .await?;
        Ok(row.map(|(uid_validity, last_sync)| Metadata {
            uid_validity: uid_validity as u32,
            last_sync: from_unix(last_sync),
        }))
    }

    /// True when the mailbox was synced less than `max_age` ago.
    pub async fn is_fresh(&self, account: &str, mailbox: &str, max_age: Duration) -> Result<bool, CacheError> {
        let Some(metadata) = self.load_metadata(account, mailbox).await? else {
            return Ok(false);
        };
        let age = Utc::now().signed_duration_since(metadata.last_sync);
        Ok(age.num_seconds() >= 0 && (age.num_seconds() as u64) < max_age.as_secs())
    }
}

async fn replace_attachments(
    tx: &mut Transaction<'_, Sqlite>,
    account: &str,
    mailbox: &str,
    uid: u32,
    attachments: &[Attachment],
) -> Result<(), CacheError> {
    sqlx::query("DELETE FROM attachments WHERE account = ? AND mailbox = ? AND email_uid = ?")
        .bind(account)
        .bind(mailbox)
        .bind(uid as i64)
        .execute(&mut **tx)
        .await?;

    for attachment in attachments {
        sqlx::query(
            "INSERT OR REPLACE INTO attachments (account, mailbox, email_uid, part_id, filename, content_type, size, encoding) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(account)
        .bind(mailbox)
        .bind(uid as i64)
        .bind(&attachment.part_id)
        .bind(&attachment.filename)
        .bind(&attachment.content_type)
        .bind(attachment.size as i64)
        .bind(&attachment.encoding)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}
