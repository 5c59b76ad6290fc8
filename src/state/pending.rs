// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Drains the durable pending-op queue against IMAP.

use futures::future::join_all;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::ops::AddAssign;

use super::StateManager;
use crate::cache::{OpKind, OpStatus, PendingOp};
use crate::connection_pool::SessionLease;
use crate::error::Result;
use crate::imap::session::SEEN_FLAG;
use crate::imap::{FlagOperation, ImapError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub processed: usize,
    pub failed: usize,
}

impl AddAssign for ProcessReport {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.failed += other.failed;
    }
}

async fn apply_op(lease: &mut SessionLease, op: &PendingOp) -> std::result::Result<(), ImapError> {
    let session = lease.session().await?;
    session.select(&op.mailbox).await?;
    match op.kind {
        OpKind::Delete => session.delete_uids(&[op.uid]).await,
        OpKind::MoveTrash => session.move_to_trash(&op.mailbox, &[op.uid]).await,
        OpKind::MarkRead => session.store_flags(&[op.uid], FlagOperation::Add, SEEN_FLAG).await,
    }
}

impl StateManager {
    /// One pass over the queue. Accounts are drained concurrently, each
    /// batch in op id order over a single lease.
    pub async fn process_pending_ops(&self) -> Result<ProcessReport> {
        let ops = self.cache.get_pending_ops().await?;
        if ops.is_empty() {
            return Ok(ProcessReport::default());
        }

        let mut batches: HashMap<String, Vec<PendingOp>> = HashMap::new();
        for op in ops {
            batches.entry(op.account.clone()).or_default().push(op);
        }

        let mut report = ProcessReport::default();
        for batch in join_all(batches.into_iter().map(|(account, ops)| self.process_batch(account, ops))).await {
            report += batch;
        }
        if report.processed > 0 || report.failed > 0 {
            info!("Pending ops: {} processed, {} failed", report.processed, report.failed);
        }
        Ok(report)
    }

    async fn process_batch(&self, account: String, ops: Vec<PendingOp>) -> ProcessReport {
        let mut report = ProcessReport::default();

        let mut lease = match self.pool.lease(&account).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Failing {} pending op(s) for {}: {}", ops.len(), account, e);
                for op in &ops {
                    self.record_failure(op, "account not found").await;
                    report.failed += 1;
                }
                return report;
            }
        };

        let mut abandon: Option<String> = None;

        for op in &ops {
            if let Some(reason) = &abandon {
                self.record_failure(op, reason).await;
                report.failed += 1;
                continue;
            }

            let result = apply_op(&mut lease, op).await;
            match result {
                Ok(()) => {
                    self.record_success(op).await;
                    report.processed += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.record_failure(op, &message).await;
                    report.failed += 1;

                    if !e.is_connection_error() {
                        continue;
                    }
                    lease.invalidate();
                    warn!("Connection for {} lost while applying op {}; reconnecting", account, op.id);
                    if let Err(reconnect_error) = lease.reconnect().await {
                        error!("Reconnect for {} failed: {}", account, reconnect_error);
                        abandon = Some(reconnect_error.to_string());
                    }
                }
            }
        }
        report
    }

    async fn record_success(&self, op: &PendingOp) {
        debug!("Applied {} for {}/{}/{}", op.kind, op.account, op.mailbox, op.uid);
        if let Err(e) = self.cache.remove_pending_op(op.id).await {
            error!("Could not remove applied op {}: {}", op.id, e);
        }
        if let Err(e) = self.cache.log_op(&op.account, &op.mailbox, op.kind, op.uid, OpStatus::Success, None).await {
            warn!("Could not log op {}: {}", op.id, e);
        }

        // A sync already in flight at enqueue time may have put the row back.
        let cleanup = if op.kind.removes_message() {
            self.cache.delete_email(&op.account, &op.mailbox, op.uid).await
        } else {
            self.cache.update_email_flags(&op.account, &op.mailbox, op.uid, false).await
        };
        if let Err(e) = cleanup {
            warn!("Cache cleanup after op {} failed: {}", op.id, e);
        }
    }

    async fn record_failure(&self, op: &PendingOp, reason: &str) {
        debug!("Op {} ({} {}/{}) failed: {}", op.id, op.kind, op.account, op.uid, reason);
        if let Err(e) = self.cache.update_pending_op_error(op.id, reason).await {
            error!("Could not record failure of op {}: {}", op.id, e);
        }
        if let Err(e) = self
            .cache
            .log_op(&op.account, &op.mailbox, op.kind, op.uid, OpStatus::Failed, Some(reason))
            .await
        {
            warn!("Could not log op {}: {}", op.id, e);
        }
    }
}
