// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#[cfg(test)]
mod socket_tests {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::UnixStream;
    use tokio::task::JoinHandle;
    use tokio_util::codec::{Framed, LinesCodec};
    use tokio_util::sync::CancellationToken;

    use crate::common::{Harness, ACCOUNT, INBOX};
    use maily::error::{MailyError, Result};
    use maily::server::control::ControlClient;
    use maily::server::protocol::VERSION;
    use maily::server::{PollerConfig, Request, ResponseType, Server, ServerConfig};

    struct Running {
        socket_path: PathBuf,
        pid_path: PathBuf,
        shutdown: CancellationToken,
        task: JoinHandle<Result<()>>,
    }

    fn config(harness: &Harness) -> ServerConfig {
        let run_dir = harness.dir.path().join("run");
        ServerConfig {
            socket_path: run_dir.join("maily.sock"),
            pid_path: run_dir.join("server.pid"),
            poller: PollerConfig { sync_interval: Duration::from_secs(3600), ops_interval: Duration::from_secs(3600) },
            run_poller: false,
        }
    }

    async fn start(harness: &Harness) -> Running {
        let config = config(harness);
        let server = Server::new(Arc::clone(&harness.state), config.clone());
        let listener = server.bind().await.unwrap();
        let shutdown = server.shutdown_token();
        let task = tokio::spawn(server.serve(listener));
        Running { socket_path: config.socket_path, pid_path: config.pid_path, shutdown, task }
    }

    async fn raw_client(path: &PathBuf) -> Framed<UnixStream, LinesCodec> {
        Framed::new(UnixStream::connect(path).await.unwrap(), LinesCodec::new())
    }

    async fn send(client: &mut Framed<UnixStream, LinesCodec>, frame: Value) {
        client.send(frame.to_string()).await.unwrap();
    }

    async fn next_frame(client: &mut Framed<UnixStream, LinesCodec>) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame within timeout")
            .expect("connection open")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn stop(running: Running) {
        running.shutdown.cancel();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_responses_echo_the_request_id() {
        let harness = Harness::new().await;
        let running = start(&harness).await;
        let mut client = raw_client(&running.socket_path).await;

        send(&mut client, json!({"type": "hello", "version": VERSION, "id": "h"})).await;
        let hello = next_frame(&mut client).await;
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["id"], "h");
        assert_eq!(hello["version"], VERSION);

        send(&mut client, json!({"type": "ping", "id": "p1"})).await;
        send(&mut client, json!({"type": "ping"})).await;
        let first = next_frame(&mut client).await;
        assert_eq!(first, json!({"type": "pong", "id": "p1"}));
        let second = next_frame(&mut client).await;
        assert_eq!(second, json!({"type": "pong"}));

        stop(running).await;
    }

    #[tokio::test]
    async fn test_malformed_frames_get_error_responses() {
        let harness = Harness::new().await;
        let running = start(&harness).await;
        let mut client = raw_client(&running.socket_path).await;

        client.send("{not json".to_string()).await.unwrap();
        let response = next_frame(&mut client).await;
        assert_eq!(response, json!({"type": "error", "error": "invalid request"}));

        send(&mut client, json!({"type": "bogus", "id": "b"})).await;
        let response = next_frame(&mut client).await;
        assert_eq!(response["error"], "unknown request type: bogus");
        assert_eq!(response["id"], "b");

        send(&mut client, json!({"type": "get_email", "account": ACCOUNT, "id": "g"})).await;
        let response = next_frame(&mut client).await;
        assert_eq!(response["type"], "error");
        assert!(response["error"].as_str().unwrap().starts_with("invalid request: "));

        // The connection is still usable.
        send(&mut client, json!({"type": "ping", "id": "after"})).await;
        assert_eq!(next_frame(&mut client).await["id"], "after");

        stop(running).await;
    }

    #[tokio::test]
    async fn test_sync_pushes_events_without_ids() {
        let harness = Harness::new().await;
        harness.server.populate(INBOX, 2);
        harness.state.sync(ACCOUNT, INBOX).await.unwrap();
        let fresh = harness.server.add_message(INBOX, maily::test_helpers::NewMessage::new("Hot off the press"));

        let running = start(&harness).await;
        let mut client = raw_client(&running.socket_path).await;
        send(&mut client, json!({"type": "sync", "account": ACCOUNT, "id": "s"})).await;

        let mut seen: Vec<Value> = Vec::new();
        let has = |frames: &[Value], kind: &str| frames.iter().any(|f| f["type"] == kind);
        while !(has(&seen, "ok") && has(&seen, "new_emails")) {
            seen.push(next_frame(&mut client).await);
        }
        assert!(has(&seen, "sync_started"));
        assert!(has(&seen, "sync_completed"));

        let ok = seen.iter().find(|f| f["type"] == "ok").expect("sync acknowledged");
        assert_eq!(ok["id"], "s");
        for event in seen.iter().filter(|f| f["type"] != "ok") {
            assert!(event.get("id").is_none(), "event carried an id: {}", event);
            assert_eq!(event["account"], ACCOUNT);
        }
        let new_emails = seen.iter().find(|f| f["type"] == "new_emails").expect("new_emails event");
        assert_eq!(new_emails["uids"], json!([fresh]));

        stop(running).await;
    }

    #[tokio::test]
    async fn test_control_client_reads_accounts() {
        let harness = Harness::new().await;
        harness.server.populate(INBOX, 3);
        harness.state.sync(ACCOUNT, INBOX).await.unwrap();
        let running = start(&harness).await;

        let mut control = ControlClient::connect(&running.socket_path).await.unwrap();
        let response = control.call(Request::GetAccounts).await.unwrap();
        assert_eq!(response.kind, ResponseType::Accounts);
        let accounts = response.accounts.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].email_count, 3);

        let response = control
            .call(Request::GetEmails { account: ACCOUNT.to_string(), mailbox: INBOX.to_string(), limit: 2 })
            .await
            .unwrap();
        assert_eq!(response.emails.unwrap().len(), 2);

        stop(running).await;
    }

    #[tokio::test]
    async fn test_shutdown_request_cleans_up_files() {
        let harness = Harness::new().await;
        let running = start(&harness).await;
        assert!(running.socket_path.exists());
        assert!(running.pid_path.exists());

        let mut control = ControlClient::connect(&running.socket_path).await.unwrap();
        let response = control.call(Request::Shutdown).await.unwrap();
        assert_eq!(response.kind, ResponseType::Ok);

        tokio::time::timeout(Duration::from_secs(5), running.task)
            .await
            .expect("server stops")
            .unwrap()
            .unwrap();
        assert!(!running.socket_path.exists());
        assert!(!running.pid_path.exists());
    }

    #[tokio::test]
    async fn test_second_server_refuses_to_start() {
        let harness = Harness::new().await;
        let running = start(&harness).await;

        let second = Server::new(Arc::clone(&harness.state), config(&harness));
        assert!(matches!(second.bind().await, Err(MailyError::AlreadyRunning)));
        assert!(running.socket_path.exists());

        stop(running).await;
    }

    #[tokio::test]
    async fn test_clients_are_served_concurrently() {
        let harness = Harness::new().await;
        let running = start(&harness).await;

        let mut first = raw_client(&running.socket_path).await;
        let mut second = raw_client(&running.socket_path).await;
        send(&mut second, json!({"type": "ping", "id": "two"})).await;
        send(&mut first, json!({"type": "ping", "id": "one"})).await;
        assert_eq!(next_frame(&mut second).await["id"], "two");
        assert_eq!(next_frame(&mut first).await["id"], "one");

        drop(first);
        send(&mut second, json!({"type": "get_sync_status", "account": ACCOUNT, "id": "st"})).await;
        let status = next_frame(&mut second).await;
        assert_eq!(status["type"], "status");
        assert_eq!(status["status"]["account"], ACCOUNT);

        stop(running).await;
    }
}
