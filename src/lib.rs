// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub mod cache;
pub mod config;
pub mod connection_pool;
pub mod error;
pub mod imap;
pub mod server;
pub mod state;
pub mod utils;

// Shared by unit and integration tests
pub mod test_helpers;

pub mod prelude {
    pub use crate::cache::{CacheConfig, CacheService, CachedEmail, OpKind, PendingOp};
    pub use crate::config::{AccountConfig, Settings};
    pub use crate::connection_pool::ConnectionPool;
    pub use crate::error::{MailyError, Result};
    pub use crate::imap::{ImapError, MailSession, SessionFactory};
    pub use crate::server::{Server, ServerConfig};
    pub use crate::state::{StateManager, StateOptions, SyncReport};

    pub use log::{debug, error, info, trace, warn};
    pub use std::sync::Arc;
}
