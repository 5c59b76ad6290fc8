// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#[cfg(test)]
mod connection_pool_tests {
    use async_trait::async_trait;
    use mockall::mock;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::common::{ACCOUNT, INBOX, OTHER_ACCOUNT};
    use maily::config::AccountConfig;
    use maily::connection_pool::ConnectionPool;
    use maily::error::MailyError;
    use maily::imap::{BoxedSession, ImapError, SessionFactory};
    use maily::test_helpers::{test_account, FakeMailServer};

    mock! {
        pub Factory {}

        #[async_trait]
        impl SessionFactory for Factory {
            async fn connect(&self, account: &AccountConfig) -> Result<BoxedSession, ImapError>;
        }
    }

    fn pool_with(factory: MockFactory, accounts: &[&str]) -> ConnectionPool {
        let accounts: Vec<_> = accounts.iter().map(|a| test_account(a)).collect();
        ConnectionPool::new(Arc::new(factory), &accounts)
    }

    #[tokio::test]
    async fn test_connects_lazily_and_reuses_session() {
        let server = FakeMailServer::new();
        server.populate(INBOX, 3);

        let mut factory = MockFactory::new();
        let fake = server.clone();
        factory.expect_connect().times(1).returning(move |_| Ok(fake.session()));
        let pool = pool_with(factory, &[ACCOUNT]);

        for _ in 0..3 {
            let exists = pool
                .with_session(ACCOUNT, |s| Box::pin(async move { s.select(INBOX).await.map(|info| info.exists) }))
                .await
                .unwrap();
            assert_eq!(exists, 3);
        }
    }

    #[tokio::test]
    async fn test_transport_error_forces_reconnect() {
        let server = FakeMailServer::new();
        let mut factory = MockFactory::new();
        let fake = server.clone();
        factory.expect_connect().times(2).returning(move |_| Ok(fake.session()));
        let pool = pool_with(factory, &[ACCOUNT]);

        pool.with_session(ACCOUNT, |s| Box::pin(async move { s.select(INBOX).await.map(|_| ()) }))
            .await
            .unwrap();

        server.set_broken(true);
        let err = pool
            .with_session(ACCOUNT, |s| Box::pin(async move { s.select(INBOX).await.map(|_| ()) }))
            .await
            .unwrap_err();
        assert!(err.is_connection_error());

        server.set_broken(false);
        pool.with_session(ACCOUNT, |s| Box::pin(async move { s.select(INBOX).await.map(|_| ()) }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_protocol_error_keeps_session() {
        let server = FakeMailServer::new();
        let mut factory = MockFactory::new();
        let fake = server.clone();
        factory.expect_connect().times(1).returning(move |_| Ok(fake.session()));
        let pool = pool_with(factory, &[ACCOUNT]);

        let err = pool
            .with_session(ACCOUNT, |s| Box::pin(async move { s.select("Nope").await.map(|_| ()) }))
            .await
            .unwrap_err();
        assert!(!err.is_connection_error());

        pool.with_session(ACCOUNT, |s| Box::pin(async move { s.select(INBOX).await.map(|_| ()) }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_account_never_connects() {
        let mut factory = MockFactory::new();
        factory.expect_connect().never();
        let pool = pool_with(factory, &[ACCOUNT]);

        let err = pool
            .with_session("nobody@example.com", |s| Box::pin(async move { s.select(INBOX).await.map(|_| ()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, MailyError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_login_is_reported_and_retried() {
        let mut factory = MockFactory::new();
        let mut attempts = 0;
        let server = FakeMailServer::new();
        factory.expect_connect().times(2).returning(move |_| {
            attempts += 1;
            if attempts == 1 {
                Err(ImapError::Auth("invalid credentials".to_string()))
            } else {
                Ok(server.session())
            }
        });
        let pool = pool_with(factory, &[ACCOUNT]);

        let err = pool
            .with_session(ACCOUNT, |s| Box::pin(async move { s.select(INBOX).await.map(|_| ()) }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Authentication error: invalid credentials");

        pool.with_session(ACCOUNT, |s| Box::pin(async move { s.select(INBOX).await.map(|_| ()) }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_accounts_do_not_share_a_lock() {
        let server = FakeMailServer::new();
        let mut factory = MockFactory::new();
        let fake = server.clone();
        // Only the other account ever connects.
        factory.expect_connect().times(1).returning(move |_| Ok(fake.session()));
        let pool = pool_with(factory, &[ACCOUNT, OTHER_ACCOUNT]);

        let held = pool.lease(ACCOUNT).await.unwrap();
        let other = tokio::time::timeout(
            Duration::from_secs(1),
            pool.with_session(OTHER_ACCOUNT, |s| Box::pin(async move { s.select(INBOX).await.map(|_| ()) })),
        )
        .await;
        assert!(matches!(other, Ok(Ok(()))));

        // Same account waits for the holder.
        let blocked = tokio::time::timeout(Duration::from_millis(100), pool.lease(ACCOUNT)).await;
        assert!(blocked.is_err());
        drop(held);
        assert!(pool.lease(ACCOUNT).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_all_drops_sessions() {
        let server = FakeMailServer::new();
        let mut factory = MockFactory::new();
        let fake = server.clone();
        factory.expect_connect().times(2).returning(move |_| Ok(fake.session()));
        let pool = pool_with(factory, &[ACCOUNT]);

        pool.with_session(ACCOUNT, |s| Box::pin(async move { s.select(INBOX).await.map(|_| ()) }))
            .await
            .unwrap();
        pool.close_all().await;
        assert!(!pool.lease(ACCOUNT).await.unwrap().is_connected());

        pool.with_session(ACCOUNT, |s| Box::pin(async move { s.select(INBOX).await.map(|_| ()) }))
            .await
            .unwrap();
    }
}
