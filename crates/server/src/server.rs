//! Server assembly and the accept loop.

use crate::connection::{CloseReason, Connection};
use crate::context::{NetConfig, ServerContext};
use crate::dispatch::{Dispatcher, ErasedHandler, PacketHandler, TypedHandler};
use crate::handshake::HandshakeHandler;
use crate::hooks::{ConnectionHooks, HookSet};
use anyhow::{Context, Result};
use emberlink_core::{Clock, SystemClock};
use emberlink_net::protocol::{GcPhase, Handshake};
use emberlink_net::{HandlerId, HeaderKey, Packet, PacketRegistry, RegistryBuilder, RegistryError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pause after a failed accept, so fd exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A group of packets and handlers installed together.
pub trait PacketModule {
    /// Register this module's packets and handlers.
    fn install(&self, server: &mut ServerBuilder) -> Result<(), RegistryError>;
}

/// Collects packets, handlers and hooks, then builds a [`Server`].
pub struct ServerBuilder {
    config: NetConfig,
    clock: Arc<dyn Clock>,
    hooks: HookSet,
    registry: RegistryBuilder,
    handlers: HashMap<HeaderKey, Arc<dyn ErasedHandler>>,
}

impl ServerBuilder {
    /// Start from `config`, the system clock and no hooks.
    pub fn new(config: NetConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock::new()),
            hooks: HookSet::default(),
            registry: RegistryBuilder::default(),
            handlers: HashMap::new(),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Install a lifecycle hook.
    pub fn with_hooks(mut self, hooks: Arc<dyn ConnectionHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    /// Register a packet without a handler (outgoing packets, or incoming
    /// ones that are deliberately ignored).
    pub fn packet<P: Packet>(&mut self) -> Result<&mut Self, RegistryError> {
        self.registry.register::<P>()?;
        Ok(self)
    }

    /// Register `P` and handle it with a fresh `H` from `factory` per packet.
    pub fn handle<P, H, F>(&mut self, factory: F) -> Result<&mut Self, RegistryError>
    where
        P: Packet,
        H: PacketHandler<P>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.registry
            .register_handled::<P>(HandlerId::of::<H>())?;
        let handler: Arc<dyn ErasedHandler> =
            Arc::new(TypedHandler::<P, H, F>::new(factory, self.config.pooled_contexts));
        self.handlers.insert(P::header_key(), handler);
        Ok(self)
    }

    /// Install a module.
    pub fn install<M: PacketModule + ?Sized>(&mut self, module: &M) -> Result<&mut Self, RegistryError> {
        module.install(self)?;
        Ok(self)
    }

    /// Add the built-in handshake packets and freeze the registry.
    pub fn build(mut self) -> Result<Server, RegistryError> {
        self.handle::<Handshake, _, _>(|| HandshakeHandler)?;
        self.packet::<GcPhase>()?;

        let registry = Arc::new(self.registry.build());
        info!(
            packets = registry.len(),
            handlers = self.handlers.len(),
            hooks = self.hooks.len(),
            mode = %self.config.mode,
            "packet registry built"
        );
        let context = Arc::new(ServerContext::new(self.config, self.clock, self.hooks));
        Ok(Server {
            context,
            dispatcher: Arc::new(Dispatcher::new(registry, self.handlers)),
            connections: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Live server: shared context, dispatcher and the map of open connections.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Server {
    context: Arc<ServerContext>,
    dispatcher: Arc<Dispatcher>,
    connections: Arc<RwLock<HashMap<Uuid, Arc<Connection>>>>,
    shutdown: CancellationToken,
}

impl Server {
    /// Start building a server.
    pub fn builder(config: NetConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// Shared services.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Frozen packet registry.
    pub fn registry(&self) -> &Arc<PacketRegistry> {
        self.dispatcher.registry()
    }

    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        info!(addr = %listener.local_addr()?, "listening");
        Ok(listener)
    }

    /// Bind `addr` and accept until [`shutdown`](Self::shutdown).
    pub async fn listen(&self, addr: SocketAddr) -> Result<()> {
        let listener = Self::bind(addr).await?;
        self.run(listener).await
    }

    /// Accept connections from `listener` until [`shutdown`](Self::shutdown).
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(%peer, %err, "failed to disable Nagle");
                    }
                    self.attach(stream, Some(peer));
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        info!("accept loop stopped");
        Ok(())
    }

    /// Serve an already connected stream.
    ///
    /// The connection is in the live map before this returns and leaves it
    /// when its tasks finish.
    pub fn attach<S>(&self, stream: S, peer: Option<SocketAddr>) -> (Arc<Connection>, JoinHandle<()>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (connection, queue) = Connection::new(peer, Arc::clone(&self.context));
        self.connections
            .write()
            .insert(connection.id(), Arc::clone(&connection));

        let live = LiveEntry {
            connections: Arc::clone(&self.connections),
            connection: Arc::clone(&connection),
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = tokio::spawn(async move {
            Arc::clone(&live.connection)
                .serve(stream, queue, dispatcher)
                .await;
            drop(live);
        });
        (connection, handle)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Look a live connection up.
    pub fn connection(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Queue `packet` on every open connection; returns how many took it.
    pub fn broadcast<P: Packet + Clone>(&self, packet: &P) -> usize {
        let targets: Vec<Arc<Connection>> = self.connections.read().values().cloned().collect();
        targets
            .iter()
            .filter(|connection| connection.send(packet.clone()).is_ok())
            .count()
    }

    /// Stop accepting and close every live connection.
    pub fn shutdown(&self) {
        info!(connections = self.connection_count(), "shutting down");
        self.shutdown.cancel();
        let live: Vec<Arc<Connection>> = self.connections.read().values().cloned().collect();
        for connection in live {
            connection.close(CloseReason::Shutdown);
        }
    }
}

/// Keeps a connection in the live map until its task ends, even by unwinding.
struct LiveEntry {
    connections: Arc<RwLock<HashMap<Uuid, Arc<Connection>>>>,
    connection: Arc<Connection>,
}

impl Drop for LiveEntry {
    fn drop(&mut self) {
        self.connection.close(CloseReason::Unexpected);
        let id = self.connection.id();
        self.connections.write().remove(&id);
        debug!(connection = %id, "connection removed");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("context", &self.context)
            .field("dispatcher", &self.dispatcher)
            .field("connections", &self.connection_count())
            .finish()
    }
}
