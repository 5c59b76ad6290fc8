// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Minimal socket client used by the `status` and `stop` commands.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::path::Path;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec};

use super::protocol::{Request, RequestFrame, Response};
use super::MAX_LINE_LENGTH;
use crate::error::{MailyError, Result};

pub struct ControlClient {
    framed: Framed<UnixStream, LinesCodec>,
    next_id: u64,
}

impl ControlClient {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            next_id: 1,
        })
    }

    /// Sends `request` and waits for the response with the same id.
    /// Event frames arriving in between are skipped.
    pub async fn call(&mut self, request: Request) -> Result<Response> {
        let id = format!("ctl-{}", self.next_id);
        self.next_id += 1;

        let frame = RequestFrame { id: Some(id.clone()), request };
        let line = serde_json::to_string(&frame)
            .map_err(|e| MailyError::InvalidRequest(e.to_string()))?;
        self.framed.send(line).await?;

        while let Some(line) = self.framed.next().await {
            let line = line?;
            let value: Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if value.get("id").and_then(Value::as_str) != Some(id.as_str()) {
                continue;
            }
            return serde_json::from_value(value)
                .map_err(|e| MailyError::InvalidRequest(format!("bad response: {}", e)));
        }
        Err(MailyError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "daemon closed the connection",
        )))
    }
}
