// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Background sync and pending-op ticks.

use futures::future::join_all;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::events::EventBus;
use super::handlers::sync_with_events;
use crate::state::{StateManager, INBOX};

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub sync_interval: Duration,
    pub ops_interval: Duration,
}

/// Syncs INBOX of every due account concurrently.
pub async fn sync_accounts(state: &StateManager, events: &EventBus, only_stale: bool) {
    let due = state.accounts_to_sync(only_stale).await;
    if due.is_empty() {
        debug!("No accounts due for sync");
        return;
    }
    join_all(due.iter().map(|account| sync_with_events(state, events, account, INBOX))).await;
}

/// Runs until `shutdown` is cancelled. An initial pass syncs only stale
/// accounts; later passes sync every account.
pub async fn run(
    state: Arc<StateManager>,
    events: Arc<EventBus>,
    config: PollerConfig,
    shutdown: CancellationToken,
) {
    info!(
        "Poller started (sync every {:?}, pending ops every {:?})",
        config.sync_interval, config.ops_interval
    );

    sync_accounts(&state, &events, true).await;
    if shutdown.is_cancelled() {
        return;
    }

    let mut sync_tick = interval_at(Instant::now() + config.sync_interval, config.sync_interval);
    sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ops_tick = interval_at(Instant::now() + config.ops_interval, config.ops_interval);
    ops_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sync_tick.tick() => {
                sync_accounts(&state, &events, false).await;
            }
            _ = ops_tick.tick() => {
                if let Err(e) = state.process_pending_ops().await {
                    error!("Pending op pass failed: {}", e);
                }
            }
        }
    }
    info!("Poller stopped");
}
