// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! One lazily-connected IMAP session per account.
//!
//! Every use of an account's session goes through that account's lock, so
//! interactive requests, syncs and the pending-op processor never interleave
//! commands on one connection. Accounts never share a lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tokio::time::timeout;

use crate::config::AccountConfig;
use crate::error::MailyError;
use crate::imap::{BoxedSession, ImapError, SessionFactory};

const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

struct AccountSlot {
    account: Arc<AccountConfig>,
    session: Arc<TokioMutex<Option<BoxedSession>>>,
}

pub struct ConnectionPool {
    factory: Arc<dyn SessionFactory>,
    slots: HashMap<String, AccountSlot>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("accounts", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Exclusive access to one account's connection slot for as long as it is
/// held.
pub struct SessionLease {
    account: Arc<AccountConfig>,
    factory: Arc<dyn SessionFactory>,
    guard: OwnedMutexGuard<Option<BoxedSession>>,
}

impl SessionLease {
    pub fn account(&self) -> &AccountConfig {
        &self.account
    }

    pub fn is_connected(&self) -> bool {
        self.guard.is_some()
    }

    /// The live session, connecting first if the slot is empty.
    pub async fn session(&mut self) -> Result<&mut BoxedSession, ImapError> {
        if self.guard.is_none() {
            debug!("Opening IMAP connection for {}", self.account.email);
            let session = self.factory.connect(&self.account).await?;
            info!("IMAP connection established for {}", self.account.email);
            *self.guard = Some(session);
        }
        self.guard
            .as_mut()
            .ok_or_else(|| ImapError::Connection(format!("no session for {}", self.account.email)))
    }

    /// Tears the connection down if `result` failed at the transport level.
    pub fn observe<T>(&mut self, result: &Result<T, ImapError>) {
        if let Err(e) = result {
            if e.is_connection_error() && self.guard.is_some() {
                warn!("IMAP connection for {} lost ({}); will reconnect on next use", self.account.email, e);
                self.invalidate();
            }
        }
    }

    /// Drops the session without LOGOUT; the transport is assumed dead.
    pub fn invalidate(&mut self) {
        *self.guard = None;
    }

    pub async fn reconnect(&mut self) -> Result<(), ImapError> {
        self.invalidate();
        self.session().await.map(|_| ())
    }
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, accounts: &[AccountConfig]) -> Self {
        let slots = accounts
            .iter()
            .map(|account| {
                (
                    account.email.clone(),
                    AccountSlot {
                        account: Arc::new(account.clone()),
                        session: Arc::new(TokioMutex::new(None)),
                    },
                )
            })
            .collect();
        Self { factory, slots }
    }

    pub fn has_account(&self, account: &str) -> bool {
        self.slots.contains_key(account)
    }

    /// Waits for the account's lock. Connecting is deferred to
    /// [`SessionLease::session`].
    pub async fn lease(&self, account: &str) -> Result<SessionLease, MailyError> {
        let slot = self
            .slots
            .get(account)
            .ok_or_else(|| MailyError::AccountNotFound(account.to_string()))?;
        let guard = slot.session.clone().lock_owned().await;
        Ok(SessionLease {
            account: slot.account.clone(),
            factory: self.factory.clone(),
            guard,
        })
    }

    /// Runs `op` against the account's live session under its lock.
    ///
    /// A transport-level failure clears the pooled session so the next call
    /// reconnects transparently.
    pub async fn with_session<T, F>(&self, account: &str, op: F) -> Result<T, MailyError>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut BoxedSession) -> BoxFuture<'s, Result<T, ImapError>> + Send,
    {
        let mut lease = self.lease(account).await?;
        let result = match lease.session().await {
            Ok(session) => op(session).await,
            Err(e) => Err(e),
        };
        lease.observe(&result);
        result.map_err(MailyError::from)
    }

    /// Logs out and drops every pooled session.
    pub async fn close_all(&self) {
        for (email, slot) in &self.slots {
            let mut guard = slot.session.lock().await;
            if let Some(mut session) = guard.take() {
                match timeout(LOGOUT_TIMEOUT, session.logout()).await {
                    Ok(Ok(())) => info!("Closed IMAP connection for {}", email),
                    Ok(Err(e)) => debug!("Logout for {} failed: {}", email, e),
                    Err(_) => debug!("Logout for {} timed out", email),
                }
            }
        }
    }
}
