// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#[cfg(test)]
mod pending_ops_tests {
    use crate::common::{open_cache, Harness, ACCOUNT, INBOX, OTHER_ACCOUNT};
    use maily::cache::OpKind;
    use maily::state::ProcessReport;

    async fn synced(count: usize) -> (Harness, Vec<u32>) {
        let harness = Harness::without_prefetch().await;
        let uids = harness.server.populate(INBOX, count);
        harness.state.sync(ACCOUNT, INBOX).await.unwrap();
        (harness, uids)
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_no_op() {
        let harness = Harness::new().await;
        let report = harness.state.process_pending_ops().await.unwrap();
        assert_eq!(report, ProcessReport::default());
        assert_eq!(harness.server.stats().connects, 0);
    }

    #[tokio::test]
    async fn test_queued_delete_survives_an_outage() {
        let (harness, uids) = synced(3).await;
        harness.server.set_broken(true);

        harness.state.queue_op(ACCOUNT, INBOX, OpKind::Delete, uids[0]).await.unwrap();
        assert!(harness.cache.get_email(ACCOUNT, INBOX, uids[0]).await.unwrap().is_none());

        let report = harness.state.process_pending_ops().await.unwrap();
        assert_eq!(report, ProcessReport { processed: 0, failed: 1 });
        let ops = harness.cache.get_pending_ops().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].retries, 1);
        assert!(ops[0].last_error.is_some());

        harness.server.set_broken(false);
        let report = harness.state.process_pending_ops().await.unwrap();
        assert_eq!(report, ProcessReport { processed: 1, failed: 0 });
        assert!(harness.cache.get_pending_ops().await.unwrap().is_empty());
        assert_eq!(harness.server.stats().deletes, 1);
        assert_eq!(harness.server.uids(INBOX), vec![uids[1], uids[2]]);
    }

    #[tokio::test]
    async fn test_queue_is_durable_across_restarts() {
        let (harness, uids) = synced(2).await;
        harness.state.queue_ops(ACCOUNT, INBOX, OpKind::Delete, &uids).await.unwrap();

        let reopened = open_cache(harness.dir.path()).await;
        let queued: Vec<u32> = reopened.get_pending_ops().await.unwrap().iter().map(|op| op.uid).collect();
        assert_eq!(queued, uids);
        assert_eq!(reopened.count_emails(ACCOUNT, INBOX).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_op_recorded_before_row_removal_still_cleans_cache() {
        let (harness, uids) = synced(2).await;
        // Op present while the cached row is still there.
        harness.cache.add_pending_op(ACCOUNT, INBOX, OpKind::Delete, uids[1]).await.unwrap();

        let report = harness.state.process_pending_ops().await.unwrap();
        assert_eq!(report.processed, 1);
        assert!(harness.cache.get_email(ACCOUNT, INBOX, uids[1]).await.unwrap().is_none());
        assert_eq!(harness.server.uids(INBOX), vec![uids[0]]);
    }

    #[tokio::test]
    async fn test_unknown_account_does_not_block_others() {
        let (harness, uids) = synced(1).await;
        let ghost = harness.cache.add_pending_op("ghost@example.com", INBOX, OpKind::Delete, 1).await.unwrap();
        harness.state.queue_op(ACCOUNT, INBOX, OpKind::Delete, uids[0]).await.unwrap();

        let report = harness.state.process_pending_ops().await.unwrap();
        assert_eq!(report, ProcessReport { processed: 1, failed: 1 });

        let ops = harness.cache.get_pending_ops().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id, ghost);
        assert_eq!(ops[0].last_error.as_deref(), Some("account not found"));
    }

    #[tokio::test]
    async fn test_queued_move_lands_in_trash() {
        let (harness, uids) = synced(2).await;
        harness.state.queue_op(ACCOUNT, INBOX, OpKind::MoveTrash, uids[0]).await.unwrap();

        let report = harness.state.process_pending_ops().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(harness.server.uids(INBOX), vec![uids[1]]);
        assert_eq!(harness.server.subjects("Trash"), vec!["Message 1".to_string()]);
        assert_eq!(harness.server.stats().moves, 1);
    }

    #[tokio::test]
    async fn test_queued_mark_read_drops_the_row_until_applied() {
        let (harness, uids) = synced(1).await;
        harness.state.queue_op(ACCOUNT, INBOX, OpKind::MarkRead, uids[0]).await.unwrap();
        assert!(harness.cache.get_email(ACCOUNT, INBOX, uids[0]).await.unwrap().is_none());
        assert!(harness.state.get_emails(ACCOUNT, INBOX, 0).await.unwrap().is_empty());

        let report = harness.state.process_pending_ops().await.unwrap();
        assert_eq!(report, ProcessReport { processed: 1, failed: 0 });
        assert!(harness.server.is_seen(INBOX, uids[0]));
        assert!(harness.cache.get_email(ACCOUNT, INBOX, uids[0]).await.unwrap().is_none());

        harness.state.sync(ACCOUNT, INBOX).await.unwrap();
        let row = harness.cache.get_email(ACCOUNT, INBOX, uids[0]).await.unwrap().unwrap();
        assert!(!row.unread);
    }

    #[tokio::test]
    async fn test_each_transport_error_gets_a_fresh_connection() {
        let (harness, uids) = synced(3).await;
        harness.state.queue_ops(ACCOUNT, INBOX, OpKind::Delete, &uids).await.unwrap();
        let connects = harness.server.stats().connects;
        harness.server.fail_next_commands(2);

        let report = harness.state.process_pending_ops().await.unwrap();
        assert_eq!(report, ProcessReport { processed: 1, failed: 2 });
        assert_eq!(harness.server.stats().connects, connects + 2);
        assert_eq!(harness.server.uids(INBOX), vec![uids[0], uids[1]]);

        let ops = harness.cache.get_pending_ops().await.unwrap();
        let failed: Vec<u32> = ops.iter().map(|op| op.uid).collect();
        assert_eq!(failed, vec![uids[0], uids[1]]);
        for op in &ops {
            assert!(op.last_error.as_deref().unwrap().contains("broken pipe"));
        }
    }

    #[tokio::test]
    async fn test_failed_reconnect_fails_the_rest_of_the_batch() {
        let (harness, uids) = synced(3).await;
        harness.state.queue_ops(ACCOUNT, INBOX, OpKind::Delete, &uids).await.unwrap();
        harness.server.set_broken(true);

        let report = harness.state.process_pending_ops().await.unwrap();
        assert_eq!(report, ProcessReport { processed: 0, failed: 3 });

        let ops = harness.cache.get_pending_ops().await.unwrap();
        assert_eq!(ops.len(), 3);
        assert!(ops[0].last_error.as_deref().unwrap().contains("broken pipe"));
        for op in &ops[1..] {
            assert!(op.last_error.as_deref().unwrap().contains("connection refused"));
        }
    }

    #[tokio::test]
    async fn test_accounts_drain_independently() {
        let harness = Harness::build(&[ACCOUNT, OTHER_ACCOUNT], |o| o.prefetch_bodies = 0).await;
        let uids = harness.server.populate(INBOX, 2);
        harness.state.sync(ACCOUNT, INBOX).await.unwrap();

        harness.state.queue_op(ACCOUNT, INBOX, OpKind::Delete, uids[0]).await.unwrap();
        harness.state.queue_op(OTHER_ACCOUNT, INBOX, OpKind::Delete, uids[1]).await.unwrap();

        let report = harness.state.process_pending_ops().await.unwrap();
        assert_eq!(report, ProcessReport { processed: 2, failed: 0 });
        assert!(harness.server.uids(INBOX).is_empty());
    }

    #[tokio::test]
    async fn test_every_attempt_is_logged() {
        let (harness, uids) = synced(1).await;
        harness.server.set_broken(true);
        harness.state.queue_op(ACCOUNT, INBOX, OpKind::Delete, uids[0]).await.unwrap();
        harness.state.process_pending_ops().await.unwrap();
        harness.server.set_broken(false);
        harness.state.process_pending_ops().await.unwrap();

        let logs = harness.cache.recent_op_logs(10).await.unwrap();
        let statuses: Vec<&str> = logs.iter().map(|l| l.status.as_str()).collect();
        assert_eq!(statuses, vec!["success", "failed"]);
    }
}
