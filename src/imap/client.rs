// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use async_imap::imap_proto::types::SectionPath;
use async_imap::types::{Fetch, Flag, Name};
use async_imap::{Client as AsyncImapClient, Session as AsyncImapSession};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use futures::TryStreamExt;
use log::{debug, info, warn};
use rustls_pki_types::ServerName as PkiServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream as TokioTcpStream;
use tokio::time::timeout;
use tokio_rustls::{client::TlsStream as TokioTlsStreamClient, TlsConnector};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::config::AccountConfig;
use crate::imap::error::ImapError;
use crate::imap::parse::{apply_envelope, collect_attachments, quote_search_text};
use crate::imap::session::{BoxedSession, MailSession, SessionFactory};
use crate::imap::types::{uid_set, FlagOperation, Folder, MailboxInfo, MessageMeta};

type BaseTlsStream = TokioTlsStreamClient<TokioTcpStream>;
type CompatStream = Compat<BaseTlsStream>;
type UnderlyingImapSession = AsyncImapSession<CompatStream>;

const METADATA_QUERY: &str = "(UID FLAGS ENVELOPE INTERNALDATE BODYSTRUCTURE)";

/// Connects over implicit TLS (port 993 style) with the platform's root
/// certificates.
pub struct TlsSessionFactory {
    connector: TlsConnector,
    login_timeout: Duration,
}

impl TlsSessionFactory {
    pub fn new() -> Result<Self, ImapError> {
        let mut root_cert_store = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs()
            .map_err(|e| ImapError::Tls(format!("Failed to load native certs: {}", e)))?;
        let (added, ignored) = root_cert_store.add_parsable_certificates(certs);
        debug!("Loaded {} native certs, ignored {}.", added, ignored);
        if root_cert_store.is_empty() {
            warn!("Root certificate store is empty after loading native certs.");
        }

        let config = ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            login_timeout: Duration::from_secs(30),
        })
    }
}

#[async_trait]
impl SessionFactory for TlsSessionFactory {
    async fn connect(&self, account: &AccountConfig) -> Result<BoxedSession, ImapError> {
        let host = account.imap_host.as_str();
        let port = account.imap_port;
        debug!("Attempting TCP connection to {}:{}...", host, port);

        let server_name = PkiServerName::try_from(host.to_string())
            .map_err(|_| ImapError::Connection(format!("Invalid server name format: {}", host)))?;

        let tcp_stream = TokioTcpStream::connect((host, port)).await?;
        let tls_stream = self
            .connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| ImapError::Tls(e.to_string()))?;
        debug!("TLS handshake with {} successful.", host);

        let client = AsyncImapClient::new(tls_stream.compat());
        let login = account.login();
        match timeout(self.login_timeout, client.login(login, &account.password)).await {
            Ok(Ok(session)) => {
                info!("IMAP login successful for {}", account.email);
                Ok(Box::new(TlsMailSession { session }))
            }
            Ok(Err((e, _client))) => Err(ImapError::Auth(format!("Login failed for {}: {}", login, e))),
            Err(_) => Err(ImapError::Connection(format!(
                "Login timed out for {} after {:?}",
                login, self.login_timeout
            ))),
        }
    }
}

/// A live async-imap session.
pub struct TlsMailSession {
    session: UnderlyingImapSession,
}

impl TlsMailSession {
    async fn fetch_meta(&mut self, query_set: &str, by_uid: bool) -> Result<Vec<MessageMeta>, ImapError> {
        let fetches: Vec<Fetch> = if by_uid {
            self.session.uid_fetch(query_set, METADATA_QUERY).await?.try_collect().await?
        } else {
            self.session.fetch(query_set, METADATA_QUERY).await?.try_collect().await?
        };
        Ok(fetches.iter().filter_map(meta_from_fetch).collect())
    }
}

fn meta_from_fetch(fetch: &Fetch) -> Option<MessageMeta> {
    let uid = fetch.uid?;
    let mut meta = MessageMeta {
        uid,
        unread: !fetch.flags().any(|f| matches!(f, Flag::Seen)),
        internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
        ..Default::default()
    };
    if let Some(envelope) = fetch.envelope() {
        apply_envelope(&mut meta, envelope);
    }
    if let Some(structure) = fetch.bodystructure() {
        meta.attachments = collect_attachments(structure);
    }
    Some(meta)
}

fn folder_from_name(name: &Name) -> Folder {
    Folder {
        name: name.name().to_string(),
        attributes: name.attributes().iter().map(attribute_name).collect(),
    }
}

/// `\Trash`, `\NoSelect`, ... for a LIST attribute.
fn attribute_name(attribute: &impl std::fmt::Debug) -> String {
    // imap-proto releases disagree on special-use variants; compare by name.
    let debug = format!("{:?}", attribute);
    let bare = debug
        .trim_start_matches("Extension(")
        .trim_matches(|c| c == '"' || c == ')' || c == '\\');
    format!("\\{}", bare)
}

fn part_path(part_id: &str) -> Result<Vec<u32>, ImapError> {
    part_id
        .split('.')
        .map(|p| p.parse::<u32>().map_err(|_| ImapError::Parse(format!("invalid part id {}", part_id))))
        .collect()
}

#[async_trait]
impl MailSession for TlsMailSession {
    async fn select(&mut self, mailbox: &str) -> Result<MailboxInfo, ImapError> {
        let selected = self
            .session
            .select(mailbox)
            .await
            .map_err(|e| match ImapError::from(e) {
                ImapError::Command(msg) => ImapError::Mailbox(format!("{}: {}", mailbox, msg)),
                other => other,
            })?;
        Ok(MailboxInfo {
            name: mailbox.to_string(),
            exists: selected.exists,
            uid_validity: selected.uid_validity,
        })
    }

    async fn fetch_sequence_range(&mut self, start: u32, end: u32) -> Result<Vec<MessageMeta>, ImapError> {
        if end == 0 || start > end {
            return Ok(Vec::new());
        }
        self.fetch_meta(&format!("{}:{}", start.max(1), end), false).await
    }

    async fn fetch_metadata(&mut self, uids: &[u32]) -> Result<Vec<MessageMeta>, ImapError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_meta(&uid_set(uids), true).await
    }

    async fn search_since(&mut self, since: NaiveDate) -> Result<Vec<u32>, ImapError> {
        let query = format!("SINCE {}", since.format("%d-%b-%Y"));
        let mut uids: Vec<u32> = self.session.uid_search(&query).await?.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn search_text(&mut self, query: &str) -> Result<Vec<u32>, ImapError> {
        let mut uids: Vec<u32> = self
            .session
            .uid_search(format!("TEXT {}", quote_search_text(query)))
            .await?
            .into_iter()
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_raw(&mut self, uid: u32) -> Result<Option<Vec<u8>>, ImapError> {
        let fetches: Vec<Fetch> = self
            .session
            .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
            .await?
            .try_collect()
            .await?;
        Ok(fetches
            .iter()
            .find(|f| f.uid == Some(uid))
            .and_then(|f| f.body())
            .map(|b| b.to_vec()))
    }

    async fn fetch_part(&mut self, uid: u32, part_id: &str) -> Result<Option<Vec<u8>>, ImapError> {
        let path = SectionPath::Part(part_path(part_id)?, None);
        let fetches: Vec<Fetch> = self
            .session
            .uid_fetch(uid.to_string(), format!("(UID BODY.PEEK[{}])", part_id))
            .await?
            .try_collect()
            .await?;
        Ok(fetches
            .iter()
            .find(|f| f.uid == Some(uid))
            .and_then(|f| f.section(&path))
            .map(|b| b.to_vec()))
    }

    async fn store_flags(&mut self, uids: &[u32], op: FlagOperation, flag: &str) -> Result<(), ImapError> {
        if uids.is_empty() {
            return Ok(());
        }
        let query = format!("{} ({})", op.store_command(), flag);
        let _updates: Vec<Fetch> = self
            .session
            .uid_store(uid_set(uids), query)
            .await?
            .try_collect()
            .await?;
        Ok(())
    }

    async fn expunge(&mut self) -> Result<(), ImapError> {
        let _expunged: Vec<u32> = self.session.expunge().await?.try_collect().await?;
        Ok(())
    }

    async fn move_uids(&mut self, uids: &[u32], target: &str) -> Result<(), ImapError> {
        if uids.is_empty() {
            return Ok(());
        }
        self.session.uid_mv(uid_set(uids), target).await?;
        Ok(())
    }

    async fn list_folders(&mut self) -> Result<Vec<Folder>, ImapError> {
        let names: Vec<Name> = self.session.list(Some(""), Some("*")).await?.try_collect().await?;
        Ok(names.iter().map(folder_from_name).collect())
    }

    async fn append(&mut self, mailbox: &str, content: &[u8]) -> Result<(), ImapError> {
        self.session.append(mailbox, content).await?;
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), ImapError> {
        self.session.logout().await?;
        Ok(())
    }
}
