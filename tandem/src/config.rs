//! Daemon configuration loaded from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Default number of concurrent connections per transfer.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 24;

/// Default number of segments a transfer is split into.
pub const DEFAULT_MAX_PARTS: u32 = 8;

/// Default capacity of each client's outbound frame queue.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Address the WebSocket server binds to.
    pub bind_address: String,
    pub port: u16,
    /// SQLite database URL.
    pub database_url: String,
    /// Directory used when a download request names none.
    pub download_dir: PathBuf,
    pub log_dir: PathBuf,
    pub max_connections: u32,
    pub max_parts: u32,
    pub ffmpeg_path: String,
    /// Frames queued per client before the client is considered stalled.
    pub subscriber_buffer: usize,
    pub user_agent: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 12570,
            database_url: "sqlite:tandem.db?mode=rwc".to_string(),
            download_dir: PathBuf::from("."),
            log_dir: PathBuf::from("logs"),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_parts: DEFAULT_MAX_PARTS,
            ffmpeg_path: "ffmpeg".to_string(),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            user_agent: concat!("tandem/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load from `TANDEM_*` environment variables, falling back to defaults.
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(bind_address) = non_empty_env("TANDEM_BIND_ADDRESS") {
            config.bind_address = bind_address;
        }
        if let Some(port) = parse_env("TANDEM_PORT") {
            config.port = port;
        }
        if let Some(url) = non_empty_env("TANDEM_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = non_empty_env("TANDEM_DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty_env("TANDEM_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(max) = parse_env::<u32>("TANDEM_MAX_CONNECTIONS")
            && max > 0
        {
            config.max_connections = max;
        }
        if let Some(parts) = parse_env::<u32>("TANDEM_MAX_PARTS")
            && parts > 0
        {
            config.max_parts = parts;
        }
        if let Some(path) = non_empty_env("TANDEM_FFMPEG_PATH") {
            config.ffmpeg_path = path;
        }
        if let Some(buffer) = parse_env::<usize>("TANDEM_SUBSCRIBER_BUFFER")
            && buffer > 0
        {
            config.subscriber_buffer = buffer;
        }
        if let Some(agent) = non_empty_env("TANDEM_USER_AGENT") {
            config.user_agent = agent;
        }

        config
    }

    /// Socket address for the server listener.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| Error::config(format!("invalid bind address: {e}")))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    let raw = non_empty_env(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring invalid environment value");
            None
        }
    }
}
