use anyhow::{Context, Result};
use emberlink_core::ServerMode;
use emberlink_net::DEFAULT_READ_BUFFER;
use emberlink_server::NetConfig;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
};

pub const DEFAULT_CONFIG_PATH: &str = "config/server.toml";
const DEFAULT_PORT: u16 = 13_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the accept loop listens on.
    pub bind: SocketAddr,
    pub mode: ServerMode,
    /// Frame reader buffer in bytes; frames larger than this close the connection.
    pub read_buffer_size: usize,
    /// Non-converged handshake replies before a connection is dropped. 0 disables the cap.
    pub max_handshake_attempts: u32,
    /// Packets queued for one client before it is dropped as too slow.
    pub max_outbound_queue: usize,
    /// Default tracing directive when RUST_LOG is unset.
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            mode: ServerMode::default(),
            read_buffer_size: DEFAULT_READ_BUFFER,
            max_handshake_attempts: 32,
            max_outbound_queue: 1024,
            log_filter: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Read and parse `path`. Callers fall back to defaults on error.
    pub fn read(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Transport settings handed to the server builder.
    pub fn to_net_config(&self) -> NetConfig {
        NetConfig {
            mode: self.mode,
            read_buffer_size: self.read_buffer_size,
            max_handshake_attempts: self.max_handshake_attempts,
            max_outbound_queue: self.max_outbound_queue,
            ..NetConfig::default()
        }
    }
}
