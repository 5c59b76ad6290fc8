// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Fan-out of push events to every connected client.

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::protocol::Event;

/// Per-client event queue depth.
pub const EVENT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: DashMap<Uuid, mpsc::Sender<Event>>,
}

/// Receiving end of one client's event queue.
#[derive(Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let id = Uuid::new_v4();
        self.subscribers.insert(id, tx);
        debug!("Event subscription added: {}", id);
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: &Uuid) {
        if self.subscribers.remove(id).is_some() {
            debug!("Event subscription removed: {}", id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Queues `event` for every client without waiting. A client whose
    /// queue is full misses the event; a closed one is dropped.
    pub fn broadcast(&self, event: Event) {
        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Event queue full for client {}; dropping {:?}", entry.key(), event.kind);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
    }
}
