// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use chrono::Utc;
use log::{info, warn};
use std::collections::HashSet;

use super::models::PendingOpRow;
use super::{memory_key, CacheError, CacheService, OpKind, OpLogEntry, OpStatus, PendingOp};

impl CacheService {
    /// Appends one op to the durable queue.
    pub async fn add_pending_op(&self, account: &str, mailbox: &str, kind: OpKind, uid: u32) -> Result<i64, CacheError> {
        let result = sqlx::query(
            "INSERT INTO pending_ops (account, mailbox, operation, uid, created_at, retries) VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(account)
        .bind(mailbox)
        .bind(kind.as_str())
        .bind(uid as i64)
        .bind(Utc::now().timestamp())
        .execute(self.pool()?)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Removes the target rows and queues one op per UID in a single
    /// transaction. Returns the new op ids in UID order.
    pub async fn enqueue_ops(&self, account: &str, mailbox: &str, kind: OpKind, uids: &[u32]) -> Result<Vec<i64>, CacheError> {
        let mut tx = self.pool()?.begin().await?;
        let now = Utc::now().timestamp();
        let mut ids = Vec::with_capacity(uids.len());

        for &uid in uids {
            sqlx::query("DELETE FROM emails WHERE account = ? AND mailbox = ? AND uid = ?")
                .bind(account)
                .bind(mailbox)
                .bind(uid as i64)
                .execute(&mut *tx)
                .await?;

            let result = sqlx::query(
                "INSERT INTO pending_ops (account, mailbox, operation, uid, created_at, retries) VALUES (?, ?, ?, ?, ?, 0)",
            )
            .bind(account)
            .bind(mailbox)
            .bind(kind.as_str())
            .bind(uid as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }
        tx.commit().await?;

        let mut memory = self.memory_cache.write().await;
        for &uid in uids {
            memory.pop(&memory_key(account, mailbox, uid));
        }
        info!("Queued {} {} op(s) for {}/{}", ids.len(), kind, account, mailbox);
        Ok(ids)
    }

    /// Every queued op, oldest first.
    pub async fn get_pending_ops(&self) -> Result<Vec<PendingOp>, CacheError> {
        let rows = sqlx::query_as::<_, PendingOpRow>(
            "SELECT id, account, mailbox, operation, uid, created_at, retries, last_error FROM pending_ops ORDER BY id",
        )
        .fetch_all(self.pool()?)
        .await?;

        let mut ops = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match PendingOp::try_from(row) {
                Ok(op) => ops.push(op),
                Err(e) => warn!("Skipping unreadable pending op {}: {}", id, e),
            }
        }
        Ok(ops)
    }

    /// UIDs of one mailbox with at least one queued op.
    pub async fn pending_uids(&self, account: &str, mailbox: &str) -> Result<HashSet<u32>, CacheError> {
        let uids = sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT uid FROM pending_ops WHERE account = ? AND mailbox = ?",
        )
        .bind(account)
        .bind(mailbox)
        .fetch_all(self.pool()?)
        .await?;
        Ok(uids.into_iter().map(|uid| uid as u32).collect())
    }

    /// Drops every queued op of one mailbox, logging each as failed with
    /// `reason`. Returns the dropped ops.
    pub async fn discard_pending_ops(&self, account: &str, mailbox: &str, reason: &str) -> Result<Vec<PendingOp>, CacheError> {
        let mut tx = self.pool()?.begin().await?;
        let rows = sqlx::query_as::<_, PendingOpRow>(
            "SELECT id, account, mailbox, operation, uid, created_at, retries, last_error FROM pending_ops WHERE account = ? AND mailbox = ? ORDER BY id",
        )
        .bind(account)
        .bind(mailbox)
        .fetch_all(&mut *tx)
        .await?;

        let now = Utc::now().timestamp();
        let mut dropped = Vec::with_capacity(rows.len());
        for row in rows {
            sqlx::query(
                "INSERT INTO op_logs (account, mailbox, operation, uid, status, error, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&row.account)
            .bind(&row.mailbox)
            .bind(&row.operation)
            .bind(row.uid)
            .bind(OpStatus::Failed.as_str())
            .bind(reason)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let id = row.id;
            match PendingOp::try_from(row) {
                Ok(op) => dropped.push(op),
                Err(e) => warn!("Dropping unreadable pending op {}: {}", id, e),
            }
        }

        sqlx::query("DELETE FROM pending_ops WHERE account = ? AND mailbox = ?")
            .bind(account)
            .bind(mailbox)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(dropped)
    }

    pub async fn remove_pending_op(&self, id: i64) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM pending_ops WHERE id = ?")
            .bind(id)
            .execute(self.pool()?)
            .await?;
        Ok(())
    }

    /// Records a failed attempt; the op stays queued.
    pub async fn update_pending_op_error(&self, id: i64, error: &str) -> Result<(), CacheError> {
        sqlx::query("UPDATE pending_ops SET retries = retries + 1, last_error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(self.pool()?)
            .await?;
        Ok(())
    }

    pub async fn log_op(
        &self,
        account: &str,
        mailbox: &str,
        kind: OpKind,
        uid: u32,
        status: OpStatus,
        error: Option<&str>,
    ) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT INTO op_logs (account, mailbox, operation, uid, status, error, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(account)
        .bind(mailbox)
        .bind(kind.as_str())
        .bind(uid as i64)
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now().timestamp())
        .execute(self.pool()?)
        .await?;
        Ok(())
    }

    /// Most recent audit entries first.
    pub async fn recent_op_logs(&self, limit: usize) -> Result<Vec<OpLogEntry>, CacheError> {
        let entries = sqlx::query_as::<_, OpLogEntry>(
            "SELECT id, account, mailbox, operation, uid, status, error, created_at FROM op_logs ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(self.pool()?)
        .await?;
        Ok(entries)
    }
}
