// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::StateManager;
use crate::cache::{CachedEmail, Metadata};
use crate::error::Result;
use crate::imap::{ImapError, MailboxInfo, MessageMeta};

/// Outcome of one sync pass over one mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub mailbox: String,
    /// Metadata records received from the server.
    pub fetched: usize,
    /// UIDs that had no cached row before this pass. Empty on the first
    /// sync of a mailbox.
    pub new_uids: Vec<u32>,
    pub evicted: usize,
    pub prefetched: usize,
}

struct RemoteSnapshot {
    info: MailboxInfo,
    messages: Vec<MessageMeta>,
    server_uids: HashSet<u32>,
}

impl StateManager {
    /// Runs one sync of `mailbox` for `account`. Fails with
    /// `SyncInProgress` if the account is already syncing.
    pub async fn sync(&self, account: &str, mailbox: &str) -> Result<SyncReport> {
        let guard = self.account(account)?.try_start_sync()?;
        info!("Sync started for {}/{}", account, mailbox);

        let result = self.run_sync(account, mailbox).await;
        match &result {
            Ok(report) => info!(
                "Sync finished for {}/{}: {} fetched, {} new, {} evicted, {} bodies prefetched",
                account,
                mailbox,
                report.fetched,
                report.new_uids.len(),
                report.evicted,
                report.prefetched
            ),
            Err(e) => warn!("Sync failed for {}/{}: {}", account, mailbox, e),
        }
        guard.end(result.as_ref().err().map(|e| e.to_string()));
        result
    }

    /// Runs [`StateManager::sync`] on its own task.
    pub fn spawn_sync(self: &Arc<Self>, account: &str, mailbox: &str) -> JoinHandle<Result<SyncReport>> {
        let state = Arc::clone(self);
        let account = account.to_string();
        let mailbox = mailbox.to_string();
        tokio::spawn(async move { state.sync(&account, &mailbox).await })
    }

    async fn run_sync(&self, account: &str, mailbox: &str) -> Result<SyncReport> {
        let stored = self.cache.load_metadata(account, mailbox).await?;
        let snapshot = self.fetch_remote(account, mailbox).await?;

        let uid_validity = snapshot
            .info
            .uid_validity
            .or_else(|| stored.as_ref().map(|m| m.uid_validity))
            .unwrap_or(0);
        if let Some(previous) = &stored {
            if previous.uid_validity != 0 && uid_validity != 0 && previous.uid_validity != uid_validity {
                let purged = self.cache.delete_mailbox(account, mailbox).await?;
                let dropped = self
                    .cache
                    .discard_pending_ops(account, mailbox, "uid validity changed")
                    .await?;
                info!(
                    "UIDVALIDITY of {}/{} changed {} -> {}; purged {} cached row(s), dropped {} pending op(s)",
                    account,
                    mailbox,
                    previous.uid_validity,
                    uid_validity,
                    purged,
                    dropped.len()
                );
            }
        }

        // Queued UIDs stay out of the cache until their op is processed.
        let pending = self.cache.pending_uids(account, mailbox).await?;
        let mut new_uids = Vec::new();
        for meta in &snapshot.messages {
            if pending.contains(&meta.uid) {
                debug!("Skipping {}/{} uid {} with a queued op", account, mailbox, meta.uid);
                continue;
            }
            let email = CachedEmail::from_meta(meta);
            if self.cache.insert_email_metadata_if_missing(account, mailbox, &email).await? {
                new_uids.push(meta.uid);
            }
        }
        if stored.is_none() {
            new_uids.clear();
        }
        new_uids.sort_unstable();

        let mut evicted = 0;
        for uid in self.cache.get_cached_uids(account, mailbox).await? {
            if !snapshot.server_uids.contains(&uid) {
                self.cache.delete_email(account, mailbox, uid).await?;
                evicted += 1;
            }
        }

        self.cache
            .save_metadata(account, mailbox, &Metadata { uid_validity, last_sync: Utc::now() })
            .await?;

        let prefetched = self.prefetch_bodies(account, mailbox).await;

        Ok(SyncReport {
            mailbox: mailbox.to_string(),
            fetched: snapshot.messages.len(),
            new_uids,
            evicted,
            prefetched,
        })
    }

    /// The newest `min_sync_emails` messages plus everything received in the
    /// last `sync_days` days, fetched under one lease.
    async fn fetch_remote(&self, account: &str, mailbox: &str) -> Result<RemoteSnapshot> {
        let mbox = mailbox.to_string();
        let min_emails = self.options.min_sync_emails.max(1);
        let since = (Utc::now() - chrono::Duration::days(self.options.sync_days)).date_naive();

        let snapshot = self
            .pool
            .with_session(account, move |session| {
                Box::pin(async move {
                    let info = session.select(&mbox).await?;
                    if info.exists == 0 {
                        return Ok::<_, ImapError>(RemoteSnapshot {
                            info,
                            messages: Vec::new(),
                            server_uids: HashSet::new(),
                        });
                    }

                    let start = info.exists.saturating_sub(min_emails).saturating_add(1);
                    let mut messages = session.fetch_sequence_range(start, info.exists).await?;
                    let mut server_uids: HashSet<u32> = messages.iter().map(|m| m.uid).collect();

                    let recent = session.search_since(since).await?;
                    let missing: Vec<u32> = recent.iter().copied().filter(|uid| !server_uids.contains(uid)).collect();
                    server_uids.extend(recent);
                    if !missing.is_empty() {
                        debug!("Fetching {} message(s) older than the newest {}", missing.len(), min_emails);
                        messages.extend(session.fetch_metadata(&missing).await?);
                    }

                    Ok::<_, ImapError>(RemoteSnapshot { info, messages, server_uids })
                })
            })
            .await?;
        Ok(snapshot)
    }

    /// Downloads bodies for the newest rows still missing one. Errors are
    /// logged and stop the prefetch without failing the sync.
    async fn prefetch_bodies(&self, account: &str, mailbox: &str) -> usize {
        if self.options.prefetch_bodies == 0 {
            return 0;
        }
        let uids = match self.cache.uids_missing_body(account, mailbox, self.options.prefetch_bodies).await {
            Ok(uids) if !uids.is_empty() => uids,
            Ok(_) => return 0,
            Err(e) => {
                warn!("Prefetch for {}/{} skipped: {}", account, mailbox, e);
                return 0;
            }
        };

        let mbox = mailbox.to_string();
        let fetched = self
            .pool
            .with_session(account, move |session| {
                Box::pin(async move {
                    session.select(&mbox).await?;
                    let mut bodies = Vec::with_capacity(uids.len());
                    for uid in uids {
                        if let Some(raw) = session.fetch_raw(uid).await? {
                            bodies.push((uid, raw));
                        }
                    }
                    Ok::<_, ImapError>(bodies)
                })
            })
            .await;

        let bodies = match fetched {
            Ok(bodies) => bodies,
            Err(e) => {
                warn!("Prefetch for {}/{} failed: {}", account, mailbox, e);
                return 0;
            }
        };

        let mut stored = 0;
        for (uid, raw) in bodies {
            let body = crate::imap::parse::parse_body(&raw);
            match self.cache.update_email_body(account, mailbox, uid, &body.html, &body.snippet).await {
                Ok(()) => stored += 1,
                Err(e) => warn!("Could not store prefetched body {}/{}/{}: {}", account, mailbox, uid, e),
            }
        }
        stored
    }
}
