//! Runtime configuration and the services every connection shares.

use crate::hooks::HookSet;
use crate::pool::Pool;
use emberlink_core::{Clock, ServerMode, SystemClock};
use emberlink_net::protocol::Phase;
use emberlink_net::DEFAULT_READ_BUFFER;
use std::fmt;
use std::sync::Arc;

/// Transport settings for one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConfig {
    /// Auth or game server.
    pub mode: ServerMode,
    /// Frame reader buffer; also the largest frame accepted.
    pub read_buffer_size: usize,
    /// Non-converged handshake replies tolerated before closing; zero disables the cap.
    pub max_handshake_attempts: u32,
    /// Packets a connection may have queued before it is closed as backlogged.
    pub max_outbound_queue: usize,
    /// Idle write buffers kept for reuse.
    pub pooled_buffers: usize,
    /// Idle packet contexts kept per handled packet type.
    pub pooled_contexts: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            mode: ServerMode::Game,
            read_buffer_size: DEFAULT_READ_BUFFER,
            max_handshake_attempts: 32,
            max_outbound_queue: 1024,
            pooled_buffers: 64,
            pooled_contexts: 16,
        }
    }
}

/// Phase a connection enters once its clock sync converges.
pub fn post_handshake_phase(mode: ServerMode) -> Phase {
    match mode {
        ServerMode::Auth => Phase::Auth,
        ServerMode::Game => Phase::Login,
    }
}

/// Clock, configuration, hooks and buffers shared by all connections.
pub struct ServerContext {
    /// Time source for handshakes.
    pub clock: Arc<dyn Clock>,
    /// Transport settings.
    pub config: NetConfig,
    /// Installed lifecycle hooks.
    pub hooks: HookSet,
    pub(crate) buffers: Pool<Vec<u8>>,
}

impl ServerContext {
    /// Assemble a context.
    pub fn new(config: NetConfig, clock: Arc<dyn Clock>, hooks: HookSet) -> Self {
        let buffers = Pool::new(config.pooled_buffers);
        Self {
            clock,
            config,
            hooks,
            buffers,
        }
    }
}

impl Default for ServerContext {
    fn default() -> Self {
        Self::new(
            NetConfig::default(),
            Arc::new(SystemClock::new()),
            HookSet::default(),
        )
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("buffers", &self.buffers)
            .finish()
    }
}
