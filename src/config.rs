// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use config::{Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const SOCKET_FILE: &str = "maily.sock";
pub const PID_FILE: &str = "server.pid";
pub const CACHE_FILE: &str = "cache.db";

/// One configured mailbox identity. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountConfig {
    pub email: String,
    #[serde(default)]
    pub provider: String,
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    /// Login name, when it differs from the address.
    #[serde(default)]
    pub username: Option<String>,
    pub password: String,
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default)]
    pub smtp_port: Option<u16>,
}

fn default_imap_port() -> u16 {
    993
}

impl AccountConfig {
    pub fn login(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between full syncs of every account.
    pub interval_secs: u64,
    /// Seconds between pending-op queue drains.
    pub ops_interval_secs: u64,
    /// Messages received within this many days are always kept.
    pub days: i64,
    /// The newest N messages are always kept.
    pub min_emails: u32,
    /// Bodies fetched eagerly at the end of a sync.
    pub prefetch_bodies: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            ops_interval_secs: 10,
            days: 14,
            min_emails: 100,
            prefetch_bodies: 10,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn ops_interval(&self) -> Duration {
        Duration::from_secs(self.ops_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub memory_items: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { memory_items: 1000 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    #[serde(default)]
    pub pid_path: Option<PathBuf>,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Settings {
    /// Loads defaults, then the config file, then `MAILY_*` environment overrides.
    ///
    /// Without an explicit path the file at `<config_dir>/maily/config.toml`
    /// is used when present. Nested keys use a double underscore, e.g.
    /// `MAILY_SYNC__INTERVAL_SECS=300`.
    pub fn new(config_path: Option<&str>) -> Result<Self, SettingsError> {
        let mut config_builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("sync.interval_secs", 600)?
            .set_default("sync.ops_interval_secs", 10)?
            .set_default("sync.days", 14)?
            .set_default("sync.min_emails", 100)?
            .set_default("sync.prefetch_bodies", 10)?
            .set_default("cache.memory_items", 1000)?;

        match config_path {
            Some(path) => {
                config_builder = config_builder.add_source(File::with_name(path));
            }
            None => {
                if let Some(dir) = dirs::config_dir() {
                    let default_file = dir.join("maily").join("config.toml");
                    config_builder = config_builder
                        .add_source(File::from(default_file).required(false));
                }
            }
        }

        config_builder = config_builder.add_source(
            Environment::with_prefix("MAILY")
                .prefix_separator("_")
                .separator("__")
                .ignore_empty(true),
        );

        let settings: Settings = config_builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.email.trim().is_empty() {
                return Err(SettingsError::Invalid("account with empty email".to_string()));
            }
            if !seen.insert(account.email.as_str()) {
                return Err(SettingsError::Invalid(format!("duplicate account {}", account.email)));
            }
        }
        if self.sync.ops_interval_secs == 0 || self.sync.interval_secs == 0 {
            return Err(SettingsError::Invalid("sync intervals must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("maily")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(|| self.state_dir().join(SOCKET_FILE))
    }

    pub fn pid_path(&self) -> PathBuf {
        self.pid_path.clone().unwrap_or_else(|| self.state_dir().join(PID_FILE))
    }

    pub fn database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!("sqlite:{}", self.state_dir().join(CACHE_FILE).display()),
        }
    }

    pub fn download_dir(&self) -> PathBuf {
        if let Some(dir) = &self.download_dir {
            return dir.clone();
        }
        dirs::download_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load or parse configuration: {0}")]
    LoadError(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
