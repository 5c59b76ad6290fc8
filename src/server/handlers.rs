// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::events::EventBus;
use super::protocol::{version_compatible, Event, EventType, Request, RequestFrame, Response, VERSION};
use crate::cache::OpKind;
use crate::error::Result;
use crate::state::{StateManager, SyncReport};

/// Delay between answering `shutdown` and stopping, so the reply flushes.
pub const SHUTDOWN_DELAY: Duration = Duration::from_millis(100);

/// Shared by every client connection.
#[derive(Clone)]
pub struct ServerContext {
    pub state: Arc<StateManager>,
    pub events: Arc<EventBus>,
    pub shutdown: CancellationToken,
}

/// Runs one sync with `sync_started`, then `sync_completed` (and
/// `new_emails` when something arrived) or `sync_error`.
pub async fn sync_with_events(
    state: &StateManager,
    events: &EventBus,
    account: &str,
    mailbox: &str,
) -> Result<SyncReport> {
    events.broadcast(Event::new(EventType::SyncStarted, account).mailbox(mailbox));
    let result = state.sync(account, mailbox).await;
    match &result {
        Ok(report) => {
            events.broadcast(Event::new(EventType::SyncCompleted, account).mailbox(mailbox));
            if !report.new_uids.is_empty() {
                events.broadcast(
                    Event::new(EventType::NewEmails, account)
                        .mailbox(mailbox)
                        .uids(report.new_uids.clone()),
                );
            }
        }
        Err(e) => {
            events.broadcast(Event::new(EventType::SyncError, account).mailbox(mailbox).error(e.to_string()));
        }
    }
    result
}

fn updated(ctx: &ServerContext, account: &str, mailbox: &str, uids: Vec<u32>) {
    ctx.events
        .broadcast(Event::new(EventType::EmailUpdated, account).mailbox(mailbox).uids(uids));
}

/// Answers one request. Never fails: every error becomes an `error`
/// response carrying the request id.
pub async fn handle(ctx: &ServerContext, frame: RequestFrame) -> Response {
    let RequestFrame { id, request } = frame;
    debug!("Handling request {:?} (id {:?})", request, id);
    let response = match dispatch(ctx, request).await {
        Ok(response) => response,
        Err(e) => Response::error(e.to_string()),
    };
    response.with_id(id)
}

async fn dispatch(ctx: &ServerContext, request: Request) -> Result<Response> {
    let state = &ctx.state;
    let response = match request {
        Request::Hello { version } => {
            if version_compatible(VERSION, &version) {
                Response::hello()
            } else {
                Response::version_mismatch(&version)
            }
        }
        Request::Ping => Response::pong(),
        Request::GetAccounts => Response::accounts(state.accounts().await?),
        Request::GetEmails { account, mailbox, limit } => {
            Response::emails(state.get_emails(&account, &mailbox, limit).await?)
        }
        Request::GetEmail { account, mailbox, uid } => {
            Response::email(state.get_email_with_body(&account, &mailbox, uid).await?)
        }
        Request::GetLabels { account } => Response::labels(state.get_labels(&account).await?),
        Request::GetSyncStatus { account } => Response::status(state.sync_status(&account)?),
        Request::Sync { account, mailbox } => {
            state.account(&account)?;
            let state = Arc::clone(state);
            let events = Arc::clone(&ctx.events);
            tokio::spawn(async move {
                let _ = sync_with_events(&state, &events, &account, &mailbox).await;
            });
            Response::ok()
        }
        Request::MarkRead { account, mailbox, uid } => {
            state.mark_read(&account, &mailbox, &[uid], true).await?;
            updated(ctx, &account, &mailbox, vec![uid]);
            Response::ok()
        }
        Request::MarkUnread { account, mailbox, uid } => {
            state.mark_read(&account, &mailbox, &[uid], false).await?;
            updated(ctx, &account, &mailbox, vec![uid]);
            Response::ok()
        }
        Request::MarkMultiRead { account, mailbox, uids } => {
            state.mark_read(&account, &mailbox, &uids, true).await?;
            if !uids.is_empty() {
                updated(ctx, &account, &mailbox, uids);
            }
            Response::ok()
        }
        Request::DeleteEmail { account, mailbox, uid } => {
            state.delete_emails(&account, &mailbox, &[uid]).await?;
            Response::ok()
        }
        Request::DeleteMulti { account, mailbox, uids } => {
            state.delete_emails(&account, &mailbox, &uids).await?;
            Response::ok()
        }
        Request::MoveToTrash { account, mailbox, uid } => {
            state.move_to_trash(&account, &mailbox, &[uid]).await?;
            Response::ok()
        }
        Request::MoveMultiTrash { account, mailbox, uids } => {
            state.move_to_trash(&account, &mailbox, &uids).await?;
            Response::ok()
        }
        Request::QueueDelete { account, mailbox, uid } => {
            state.queue_op(&account, &mailbox, OpKind::Delete, uid).await?;
            Response::ok()
        }
        Request::QueueDeleteMulti { account, mailbox, uids } => {
            state.queue_ops(&account, &mailbox, OpKind::Delete, &uids).await?;
            Response::ok()
        }
        Request::QueueMoveTrash { account, mailbox, uid } => {
            state.queue_op(&account, &mailbox, OpKind::MoveTrash, uid).await?;
            Response::ok()
        }
        Request::QueueMoveMultiTrash { account, mailbox, uids } => {
            state.queue_ops(&account, &mailbox, OpKind::MoveTrash, &uids).await?;
            Response::ok()
        }
        Request::Search { account, mailbox, query } => {
            Response::emails(state.search(&account, &mailbox, &query).await?)
        }
        Request::SaveDraft { account, to, subject, body } => {
            state.save_draft(&account, &to, &subject, &body).await?;
            Response::ok()
        }
        Request::DownloadAttachment { account, mailbox, uid, part_id, filename, encoding } => {
            let path = state
                .download_attachment(&account, &mailbox, uid, &part_id, filename.as_deref(), encoding.as_deref())
                .await?;
            Response::file(path.display().to_string())
        }
        Request::Shutdown => {
            info!("Shutdown requested by client");
            let token = ctx.shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SHUTDOWN_DELAY).await;
                token.cancel();
            });
            Response::ok()
        }
    };
    Ok(response)
}
