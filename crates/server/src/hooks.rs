//! Connection lifecycle hooks.
//!
//! Hooks observe the connection at fixed points of its life. They run inline
//! on the connection's reader or writer task and should not block.

use crate::connection::{CloseReason, Connection};
use emberlink_net::{AnyPacket, HeaderKey};
use std::fmt;
use std::sync::Arc;

/// Observer of connection events. Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait ConnectionHooks: Send + Sync {
    /// Connection accepted, before the handshake starts.
    fn on_connected(&self, connection: &Connection) {}

    /// Connection closed. Runs exactly once per connection.
    fn on_disconnected(&self, connection: &Connection, reason: CloseReason) {}

    /// Clock sync converged and the post-handshake phase was set.
    fn on_handshake_finished(&self, connection: &Arc<Connection>) {}

    /// Packet decoded, before dispatch.
    fn pre_packet_received(&self, connection: &Connection, packet: &dyn AnyPacket) {}

    /// Packet dispatched successfully.
    fn post_packet_received(&self, connection: &Connection, key: HeaderKey) {}

    /// Packet dequeued, before it is encoded.
    fn pre_packet_sent(&self, connection: &Connection, packet: &dyn AnyPacket) {}

    /// Packet written and flushed.
    fn post_packet_sent(&self, connection: &Connection, key: HeaderKey, bytes: usize) {}
}

/// The installed hooks, called in installation order.
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<Arc<dyn ConnectionHooks>>,
}

impl HookSet {
    /// Add a hook.
    pub fn push(&mut self, hook: Arc<dyn ConnectionHooks>) {
        self.hooks.push(hook);
    }

    /// Number of installed hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hooks are installed.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub(crate) fn on_connected(&self, connection: &Connection) {
        self.hooks.iter().for_each(|h| h.on_connected(connection));
    }

    pub(crate) fn on_disconnected(&self, connection: &Connection, reason: CloseReason) {
        self.hooks
            .iter()
            .for_each(|h| h.on_disconnected(connection, reason));
    }

    pub(crate) fn on_handshake_finished(&self, connection: &Arc<Connection>) {
        self.hooks
            .iter()
            .for_each(|h| h.on_handshake_finished(connection));
    }

    pub(crate) fn pre_packet_received(&self, connection: &Connection, packet: &dyn AnyPacket) {
        self.hooks
            .iter()
            .for_each(|h| h.pre_packet_received(connection, packet));
    }

    pub(crate) fn post_packet_received(&self, connection: &Connection, key: HeaderKey) {
        self.hooks
            .iter()
            .for_each(|h| h.post_packet_received(connection, key));
    }

    pub(crate) fn pre_packet_sent(&self, connection: &Connection, packet: &dyn AnyPacket) {
        self.hooks
            .iter()
            .for_each(|h| h.pre_packet_sent(connection, packet));
    }

    pub(crate) fn post_packet_sent(&self, connection: &Connection, key: HeaderKey, bytes: usize) {
        self.hooks
            .iter()
            .for_each(|h| h.post_packet_sent(connection, key, bytes));
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
