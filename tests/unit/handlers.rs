// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#[cfg(test)]
mod handler_tests {
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    use crate::common::{Harness, ACCOUNT, INBOX};
    use maily::cache::OpKind;
    use maily::state::ProcessReport;
    use maily::server::handlers::{handle, SHUTDOWN_DELAY};
    use maily::server::protocol::{parse_request, VERSION};
    use maily::server::{EventBus, EventType, Request, RequestFrame, ResponseType, ServerContext};

    fn context(harness: &Harness) -> ServerContext {
        ServerContext {
            state: Arc::clone(&harness.state),
            events: Arc::new(EventBus::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn frame(id: &str, request: Request) -> RequestFrame {
        RequestFrame { id: Some(id.to_string()), request }
    }

    #[tokio::test]
    async fn test_hello_accepts_same_minor_version() {
        let harness = Harness::new().await;
        let ctx = context(&harness);

        let response = handle(&ctx, frame("1", Request::Hello { version: VERSION.to_string() })).await;
        assert_eq!(response.kind, ResponseType::Hello);
        assert_eq!(response.version.as_deref(), Some(VERSION));
        assert_eq!(response.id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_hello_rejects_other_major_version() {
        let harness = Harness::new().await;
        let ctx = context(&harness);

        let response = handle(&ctx, frame("2", Request::Hello { version: "99.0.0".to_string() })).await;
        assert_eq!(response.kind, ResponseType::Error);
        assert_eq!(response.version.as_deref(), Some(VERSION));
        assert_eq!(response.id.as_deref(), Some("2"));
        let message = response.error.unwrap();
        assert!(message.starts_with("version mismatch: server="), "{}", message);
        assert!(message.contains("client=99.0.0"));
    }

    #[tokio::test]
    async fn test_errors_carry_the_request_id() {
        let harness = Harness::new().await;
        let ctx = context(&harness);

        let response = handle(
            &ctx,
            frame(
                "abc",
                Request::GetEmails { account: "nobody@example.com".to_string(), mailbox: INBOX.to_string(), limit: 0 },
            ),
        )
        .await;
        assert_eq!(response.kind, ResponseType::Error);
        assert_eq!(response.id.as_deref(), Some("abc"));
        assert_eq!(response.error.as_deref(), Some("account not found: nobody@example.com"));
    }

    #[tokio::test]
    async fn test_get_emails_reads_the_cache_only() {
        let harness = Harness::new().await;
        harness.server.populate(INBOX, 3);
        harness.state.sync(ACCOUNT, INBOX).await.unwrap();
        let commands = harness.server.stats().commands;
        let ctx = context(&harness);

        let request = parse_request(r#"{"type":"get_emails","account":"me@example.com","id":"e"}"#).unwrap();
        let response = handle(&ctx, request).await;
        assert_eq!(response.kind, ResponseType::Emails);
        assert_eq!(response.emails.unwrap().len(), 3);
        assert_eq!(harness.server.stats().commands, commands);
    }

    #[tokio::test]
    async fn test_mark_read_broadcasts_email_updated() {
        let harness = Harness::new().await;
        let uids = harness.server.populate(INBOX, 1);
        harness.state.sync(ACCOUNT, INBOX).await.unwrap();
        let ctx = context(&harness);
        let mut subscription = ctx.events.subscribe();

        let response = handle(
            &ctx,
            frame("m", Request::MarkRead { account: ACCOUNT.to_string(), mailbox: INBOX.to_string(), uid: uids[0] }),
        )
        .await;
        assert_eq!(response.kind, ResponseType::Ok);

        let event = subscription.receiver.try_recv().unwrap();
        assert_eq!(event.kind, EventType::EmailUpdated);
        assert_eq!(event.uids, uids);
        assert!(harness.server.is_seen(INBOX, uids[0]));
    }

    #[tokio::test]
    async fn test_queue_delete_survives_an_outage() {
        let harness = Harness::new().await;
        let uids = harness.server.populate(INBOX, 2);
        harness.state.sync(ACCOUNT, INBOX).await.unwrap();
        let ctx = context(&harness);
        harness.server.set_broken(true);

        let response = handle(
            &ctx,
            frame("q", Request::QueueDelete { account: ACCOUNT.to_string(), mailbox: INBOX.to_string(), uid: uids[0] }),
        )
        .await;
        assert_eq!(response.kind, ResponseType::Ok);
        assert_eq!(response.id.as_deref(), Some("q"));

        let listed: Vec<u32> = harness.state.get_emails(ACCOUNT, INBOX, 0).await.unwrap().iter().map(|e| e.uid).collect();
        assert_eq!(listed, vec![uids[1]]);
        let pending = harness.cache.get_pending_ops().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!((pending[0].kind, pending[0].uid), (OpKind::Delete, uids[0]));

        let report = harness.state.process_pending_ops().await.unwrap();
        assert_eq!(report, ProcessReport { processed: 0, failed: 1 });
        assert_eq!(harness.server.uids(INBOX), uids);

        harness.server.set_broken(false);
        let report = harness.state.process_pending_ops().await.unwrap();
        assert_eq!(report, ProcessReport { processed: 1, failed: 0 });
        assert_eq!(harness.server.stats().deletes, 1);
        assert_eq!(harness.server.uids(INBOX), vec![uids[1]]);
        assert!(harness.cache.get_pending_ops().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_requests_from_the_wire() {
        let harness = Harness::new().await;
        let uids = harness.server.populate(INBOX, 6);
        harness.state.sync(ACCOUNT, INBOX).await.unwrap();
        let ctx = context(&harness);

        let frames = [
            format!(r#"{{"type":"queue_delete_multi","account":"{}","mailbox":"INBOX","uids":[{},{}],"id":"1"}}"#, ACCOUNT, uids[0], uids[1]),
            format!(r#"{{"type":"queue_move_trash","account":"{}","mailbox":"INBOX","uid":{},"id":"2"}}"#, ACCOUNT, uids[2]),
            format!(r#"{{"type":"queue_move_multi_trash","account":"{}","mailbox":"INBOX","uids":[{},{}],"id":"3"}}"#, ACCOUNT, uids[3], uids[4]),
        ];
        for line in &frames {
            let response = handle(&ctx, parse_request(line).unwrap()).await;
            assert_eq!(response.kind, ResponseType::Ok, "{}", line);
        }

        let queued: Vec<(OpKind, u32)> =
            harness.cache.get_pending_ops().await.unwrap().iter().map(|op| (op.kind, op.uid)).collect();
        assert_eq!(
            queued,
            vec![
                (OpKind::Delete, uids[0]),
                (OpKind::Delete, uids[1]),
                (OpKind::MoveTrash, uids[2]),
                (OpKind::MoveTrash, uids[3]),
                (OpKind::MoveTrash, uids[4]),
            ]
        );
        assert_eq!(harness.cached_uids().await, vec![uids[5]]);

        let report = harness.state.process_pending_ops().await.unwrap();
        assert_eq!(report, ProcessReport { processed: 5, failed: 0 });
        assert_eq!(harness.server.uids(INBOX), vec![uids[5]]);
        assert_eq!(harness.server.stats().deletes, 2);
        assert_eq!(harness.server.stats().moves, 3);
    }

    #[tokio::test]
    async fn test_sync_request_answers_before_sync_finishes() {
        let harness = Harness::new().await;
        harness.server.populate(INBOX, 2);
        let ctx = context(&harness);
        let mut subscription = ctx.events.subscribe();

        let response = handle(&ctx, frame("s", Request::Sync { account: ACCOUNT.to_string(), mailbox: INBOX.to_string() })).await;
        assert_eq!(response.kind, ResponseType::Ok);

        let started = subscription.receiver.recv().await.unwrap();
        assert_eq!(started.kind, EventType::SyncStarted);
        let completed = subscription.receiver.recv().await.unwrap();
        assert_eq!(completed.kind, EventType::SyncCompleted);
        assert_eq!(harness.cached_uids().await.len(), 2);
    }

    #[tokio::test]
    async fn test_sync_unknown_account_fails_synchronously() {
        let harness = Harness::new().await;
        let ctx = context(&harness);
        let subscription = ctx.events.subscribe();

        let response = handle(&ctx, frame("s", Request::Sync { account: "x@y.z".to_string(), mailbox: INBOX.to_string() })).await;
        assert_eq!(response.kind, ResponseType::Error);
        drop(subscription);
        assert_eq!(harness.server.stats().connects, 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_after_reply() {
        let harness = Harness::new().await;
        let ctx = context(&harness);

        let response = handle(&ctx, frame("bye", Request::Shutdown)).await;
        assert_eq!(response.kind, ResponseType::Ok);
        assert!(!ctx.shutdown.is_cancelled());

        tokio::time::timeout(SHUTDOWN_DELAY * 20, ctx.shutdown.cancelled()).await.unwrap();
    }
}
