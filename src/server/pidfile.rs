// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! PID marker and stale-socket handling.

use log::info;
use std::io;
use std::path::Path;
use tokio::net::UnixStream;

use crate::error::MailyError;

/// Contents of a PID file: `pid:version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: u32,
    pub version: String,
}

impl PidRecord {
    pub fn current(version: &str) -> Self {
        Self { pid: std::process::id(), version: version.to_string() }
    }

    pub fn parse(contents: &str) -> Option<Self> {
        let (pid, version) = match contents.trim().split_once(':') {
            Some((pid, version)) => (pid, version),
            None => (contents.trim(), ""),
        };
        Some(Self { pid: pid.parse().ok()?, version: version.to_string() })
    }
}

impl std::fmt::Display for PidRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.pid, self.version)
    }
}

pub fn write_pid_file(path: &Path, record: &PidRecord) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, record.to_string())
}

pub fn read_pid_file(path: &Path) -> Option<PidRecord> {
    std::fs::read_to_string(path).ok().and_then(|c| PidRecord::parse(&c))
}

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// True if a process with `pid` exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the permission and existence check only.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// True if something accepts connections on the socket.
pub async fn socket_in_use(path: &Path) -> bool {
    UnixStream::connect(path).await.is_ok()
}

/// Fails with `AlreadyRunning` if a live daemon owns the socket, otherwise
/// clears leftover socket and PID files.
pub async fn claim(socket_path: &Path, pid_path: &Path) -> Result<(), MailyError> {
    if socket_path.exists() {
        if socket_in_use(socket_path).await {
            return Err(MailyError::AlreadyRunning);
        }
        info!("Removing stale socket {}", socket_path.display());
        remove_file_if_exists(socket_path)?;
    }
    if let Some(record) = read_pid_file(pid_path) {
        if record.pid != std::process::id() && !process_alive(record.pid) {
            info!("Removing stale PID file from process {}", record.pid);
            remove_file_if_exists(pid_path)?;
        }
    }
    Ok(())
}
