//! Handler dispatch.
//!
//! Each handled packet type gets a pool of [`PacketContext`]s and a factory
//! that builds a fresh handler per packet, so no handler state leaks from
//! one packet to the next.

use crate::connection::Connection;
use crate::pool::{Pool, Reusable};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use emberlink_net::{AnyPacket, HandlerId, HeaderKey, Packet, PacketRegistry};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{trace, warn};

/// The connection and packet a handler works on.
///
/// Both are always present while a handler runs; they are cleared when the
/// context goes back to its pool.
pub struct PacketContext<P> {
    connection: Option<Arc<Connection>>,
    packet: Option<P>,
}

impl<P> Default for PacketContext<P> {
    fn default() -> Self {
        Self {
            connection: None,
            packet: None,
        }
    }
}

impl<P: Send> Reusable for PacketContext<P> {
    fn reset(&mut self) {
        self.connection = None;
        self.packet = None;
    }
}

impl<P> PacketContext<P> {
    /// Connection the packet arrived on.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    /// The decoded packet, unless a handler took it.
    pub fn packet(&self) -> Option<&P> {
        self.packet.as_ref()
    }

    /// Take ownership of the packet.
    pub fn take_packet(&mut self) -> Option<P> {
        self.packet.take()
    }

    /// Connection and packet together.
    pub fn parts(&self) -> Result<(&Arc<Connection>, &P)> {
        let connection = self
            .connection
            .as_ref()
            .context("packet context has no connection")?;
        let packet = self
            .packet
            .as_ref()
            .context("packet context has no packet")?;
        Ok((connection, packet))
    }
}

/// Handles one packet type.
///
/// An error or a panic closes the connection the packet came from.
#[async_trait]
pub trait PacketHandler<P: Packet>: Send + Sync + 'static {
    /// Process the packet in `ctx`.
    async fn handle(&self, ctx: &mut PacketContext<P>) -> Result<()>;
}

#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    fn handler_id(&self) -> HandlerId;

    async fn invoke(&self, connection: &Arc<Connection>, packet: Box<dyn AnyPacket>) -> Result<()>;
}

pub(crate) struct TypedHandler<P, H, F> {
    factory: F,
    contexts: Pool<PacketContext<P>>,
    _handler: PhantomData<fn() -> H>,
}

impl<P, H, F> TypedHandler<P, H, F>
where
    P: Packet,
{
    pub(crate) fn new(factory: F, pooled: usize) -> Self {
        Self {
            factory,
            contexts: Pool::new(pooled),
            _handler: PhantomData,
        }
    }
}

#[async_trait]
impl<P, H, F> ErasedHandler for TypedHandler<P, H, F>
where
    P: Packet,
    H: PacketHandler<P>,
    F: Fn() -> H + Send + Sync + 'static,
{
    fn handler_id(&self) -> HandlerId {
        HandlerId::of::<H>()
    }

    async fn invoke(&self, connection: &Arc<Connection>, packet: Box<dyn AnyPacket>) -> Result<()> {
        let packet = packet
            .downcast::<P>()
            .ok_or_else(|| anyhow!("dispatched packet is not a {}", P::NAME))?;
        let mut context = self.contexts.rent();
        context.connection = Some(Arc::clone(connection));
        context.packet = Some(*packet);
        let handler = (self.factory)();
        handler.handle(&mut *context).await
    }
}

/// Routes decoded packets to their handlers.
pub struct Dispatcher {
    registry: Arc<PacketRegistry>,
    handlers: HashMap<HeaderKey, Arc<dyn ErasedHandler>>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<PacketRegistry>,
        handlers: HashMap<HeaderKey, Arc<dyn ErasedHandler>>,
    ) -> Self {
        Self { registry, handlers }
    }

    /// Registry the frame reader decodes against.
    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    /// Run the handler for `packet`.
    ///
    /// Packets without a handler are logged and dropped; only handler
    /// failures are returned.
    pub async fn dispatch(&self, connection: &Arc<Connection>, packet: Box<dyn AnyPacket>) -> Result<()> {
        let Some(info) = self.registry.try_get_packet_info_by_instance(packet.as_ref()) else {
            warn!(packet = packet.type_name(), "dropping unregistered packet");
            return Ok(());
        };
        let Some(expected) = info.handler else {
            warn!(connection = %connection.id(), packet = info.name, key = %info.key, "no handler for packet");
            return Ok(());
        };
        let Some(handler) = self.handlers.get(&info.key) else {
            warn!(packet = info.name, handler = expected.name(), "handler is registered but not installed");
            return Ok(());
        };
        if handler.handler_id() != expected {
            warn!(
                packet = info.name,
                expected = expected.name(),
                installed = handler.handler_id().name(),
                "installed handler does not match registration"
            );
            return Ok(());
        }

        trace!(packet = info.name, handler = expected.name(), "dispatching");
        handler
            .invoke(connection, packet)
            .await
            .with_context(|| format!("{} failed on {}", expected.name(), info.name))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("packets", &self.registry.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
