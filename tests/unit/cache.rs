// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#[cfg(test)]
mod cache_service_tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    use crate::common::{open_cache, ACCOUNT, INBOX, OTHER_ACCOUNT};
    use maily::cache::{CachedEmail, Metadata, OpKind, OpStatus};
    use maily::imap::{Attachment, MessageMeta};

    fn email(uid: u32, minutes_ago: i64) -> CachedEmail {
        CachedEmail::from_meta(&MessageMeta {
            uid,
            message_id: format!("<{}@test>", uid),
            internal_date: Some(Utc::now() - ChronoDuration::minutes(minutes_ago)),
            from: "Alice <alice@example.com>".to_string(),
            subject: format!("Subject {}", uid),
            unread: true,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_load_emails_newest_first_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path()).await;
        for (uid, age) in [(1, 30), (2, 10), (3, 20)] {
            cache.save_email(ACCOUNT, INBOX, &email(uid, age)).await.unwrap();
        }

        let all: Vec<u32> = cache.load_emails(ACCOUNT, INBOX, 0).await.unwrap().iter().map(|e| e.uid).collect();
        assert_eq!(all, vec![2, 3, 1]);

        let limited = cache.load_emails(ACCOUNT, INBOX, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].uid, 2);

        assert!(cache.load_emails(OTHER_ACCOUNT, INBOX, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_if_missing_keeps_cached_body() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path()).await;

        let mut full = email(5, 1);
        full.body_html = "<p>kept</p>".to_string();
        full.snippet = "kept".to_string();
        cache.save_email(ACCOUNT, INBOX, &full).await.unwrap();

        let mut refreshed = email(5, 1);
        refreshed.unread = false;
        let inserted = cache.insert_email_metadata_if_missing(ACCOUNT, INBOX, &refreshed).await.unwrap();
        assert!(!inserted);

        let row = cache.get_email(ACCOUNT, INBOX, 5).await.unwrap().unwrap();
        assert_eq!(row.body_html, "<p>kept</p>");
        assert!(!row.unread);

        assert!(cache.insert_email_metadata_if_missing(ACCOUNT, INBOX, &email(6, 1)).await.unwrap());
        assert_eq!(cache.count_emails(ACCOUNT, INBOX).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_writes_invalidate_memory_copy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path()).await;
        cache.save_email(ACCOUNT, INBOX, &email(9, 1)).await.unwrap();

        // Populate the LRU.
        assert!(cache.get_email(ACCOUNT, INBOX, 9).await.unwrap().unwrap().unread);

        cache.update_email_flags(ACCOUNT, INBOX, 9, false).await.unwrap();
        assert!(!cache.get_email(ACCOUNT, INBOX, 9).await.unwrap().unwrap().unread);

        cache.update_email_body(ACCOUNT, INBOX, 9, "<b>hi</b>", "hi").await.unwrap();
        let row = cache.get_email(ACCOUNT, INBOX, 9).await.unwrap().unwrap();
        assert!(row.has_body());
        assert_eq!(row.snippet, "hi");

        cache.delete_email(ACCOUNT, INBOX, 9).await.unwrap();
        assert!(cache.get_email(ACCOUNT, INBOX, 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attachments_follow_their_email() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path()).await;
        let mut row = email(3, 1);
        row.attachments = vec![Attachment {
            part_id: "2".to_string(),
            filename: "report.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size: 1234,
            encoding: "base64".to_string(),
        }];
        cache.save_email(ACCOUNT, INBOX, &row).await.unwrap();

        let loaded = cache.load_emails(ACCOUNT, INBOX, 0).await.unwrap();
        assert_eq!(loaded[0].attachments, row.attachments);

        cache.delete_email(ACCOUNT, INBOX, 3).await.unwrap();
        cache.save_email(ACCOUNT, INBOX, &email(3, 1)).await.unwrap();
        let reloaded = cache.get_email(ACCOUNT, INBOX, 3).await.unwrap().unwrap();
        assert!(reloaded.attachments.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_and_freshness() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path()).await;
        assert!(cache.load_metadata(ACCOUNT, INBOX).await.unwrap().is_none());
        assert!(!cache.is_fresh(ACCOUNT, INBOX, Duration::from_secs(600)).await.unwrap());

        cache
            .save_metadata(ACCOUNT, INBOX, &Metadata { uid_validity: 77, last_sync: Utc::now() })
            .await
            .unwrap();
        assert_eq!(cache.load_metadata(ACCOUNT, INBOX).await.unwrap().unwrap().uid_validity, 77);
        assert!(cache.is_fresh(ACCOUNT, INBOX, Duration::from_secs(600)).await.unwrap());

        cache
            .save_metadata(
                ACCOUNT,
                INBOX,
                &Metadata { uid_validity: 77, last_sync: Utc::now() - ChronoDuration::hours(1) },
            )
            .await
            .unwrap();
        assert!(!cache.is_fresh(ACCOUNT, INBOX, Duration::from_secs(600)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_mailbox_only_touches_that_mailbox() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path()).await;
        cache.save_email(ACCOUNT, INBOX, &email(1, 1)).await.unwrap();
        cache.save_email(ACCOUNT, INBOX, &email(2, 1)).await.unwrap();
        cache.save_email(ACCOUNT, "Archive", &email(1, 1)).await.unwrap();

        assert_eq!(cache.delete_mailbox(ACCOUNT, INBOX).await.unwrap(), 2);
        assert_eq!(cache.count_emails(ACCOUNT, INBOX).await.unwrap(), 0);
        assert_eq!(cache.count_emails(ACCOUNT, "Archive").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_uids_missing_body_prefers_recent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path()).await;
        for uid in 1..=5 {
            cache.save_email(ACCOUNT, INBOX, &email(uid, 100 - uid as i64)).await.unwrap();
        }
        cache.update_email_body(ACCOUNT, INBOX, 5, "<p>x</p>", "x").await.unwrap();

        assert_eq!(cache.uids_missing_body(ACCOUNT, INBOX, 2).await.unwrap(), vec![4, 3]);
    }

    #[tokio::test]
    async fn test_enqueue_removes_rows_and_records_ops() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path()).await;
        for uid in [7, 8, 9] {
            cache.save_email(ACCOUNT, INBOX, &email(uid, 1)).await.unwrap();
        }
        // Cached in memory before the enqueue.
        cache.get_email(ACCOUNT, INBOX, 7).await.unwrap();

        let ids = cache.enqueue_ops(ACCOUNT, INBOX, OpKind::Delete, &[7, 8]).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(cache.get_email(ACCOUNT, INBOX, 7).await.unwrap().is_none());
        assert_eq!(cache.count_emails(ACCOUNT, INBOX).await.unwrap(), 1);

        let ops = cache.get_pending_ops().await.unwrap();
        assert_eq!(ops.iter().map(|op| op.uid).collect::<Vec<_>>(), vec![7, 8]);
        assert!(ops.iter().all(|op| op.kind == OpKind::Delete && op.retries == 0 && op.last_error.is_none()));
    }

    #[tokio::test]
    async fn test_enqueue_mark_read_removes_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path()).await;
        cache.save_email(ACCOUNT, INBOX, &email(3, 1)).await.unwrap();

        cache.enqueue_ops(ACCOUNT, INBOX, OpKind::MarkRead, &[3]).await.unwrap();
        assert!(cache.get_email(ACCOUNT, INBOX, 3).await.unwrap().is_none());
        assert_eq!(cache.pending_uids(ACCOUNT, INBOX).await.unwrap().into_iter().collect::<Vec<_>>(), vec![3]);
        assert!(cache.pending_uids(OTHER_ACCOUNT, INBOX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discard_pending_ops_is_scoped_to_the_mailbox() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path()).await;
        cache.enqueue_ops(ACCOUNT, INBOX, OpKind::Delete, &[1, 2]).await.unwrap();
        cache.enqueue_ops(ACCOUNT, "Archive", OpKind::Delete, &[1]).await.unwrap();

        let dropped = cache.discard_pending_ops(ACCOUNT, INBOX, "uid validity changed").await.unwrap();
        assert_eq!(dropped.iter().map(|op| op.uid).collect::<Vec<_>>(), vec![1, 2]);

        let left = cache.get_pending_ops().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].mailbox, "Archive");

        let logs = cache.recent_op_logs(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.status == "failed" && l.error.as_deref() == Some("uid validity changed")));
    }

    #[tokio::test]
    async fn test_pending_op_errors_and_audit_log() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path()).await;
        let id = cache.add_pending_op(ACCOUNT, INBOX, OpKind::MoveTrash, 4).await.unwrap();

        cache.update_pending_op_error(id, "broken pipe").await.unwrap();
        cache.update_pending_op_error(id, "broken pipe").await.unwrap();
        let op = cache.get_pending_ops().await.unwrap().remove(0);
        assert_eq!(op.retries, 2);
        assert_eq!(op.last_error.as_deref(), Some("broken pipe"));

        cache
            .log_op(ACCOUNT, INBOX, OpKind::MoveTrash, 4, OpStatus::Failed, Some("broken pipe"))
            .await
            .unwrap();
        cache.log_op(ACCOUNT, INBOX, OpKind::MoveTrash, 4, OpStatus::Success, None).await.unwrap();
        cache.remove_pending_op(id).await.unwrap();

        assert!(cache.get_pending_ops().await.unwrap().is_empty());
        let logs = cache.recent_op_logs(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].status, "success");
        assert_eq!(logs[1].error.as_deref(), Some("broken pipe"));
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = open_cache(dir.path()).await;
            cache.add_pending_op(ACCOUNT, INBOX, OpKind::Delete, 11).await.unwrap();
        }
        let reopened = open_cache(dir.path()).await;
        let ops = reopened.get_pending_ops().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].uid, 11);
    }
}
