//! Connection actor: one reader task, one writer task, one outbound queue.
//!
//! The reader pulls frames, runs the receive hooks and dispatches. The writer
//! is the only task touching the socket's write half, so frames go out whole
//! and in the order `send` was called.

use crate::context::{post_handshake_phase, ServerContext};
use crate::dispatch::Dispatcher;
use crate::error::SendError;
use crate::handshake::{HandshakeError, HandshakeState, HandshakeStep};
use emberlink_net::protocol::{GcPhase, Handshake, Phase};
use emberlink_net::{AnyPacket, FrameReader, Packet};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn, Instrument};
use uuid::Uuid;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Closed on purpose by the server or a handler.
    Requested,
    /// Stream ended or failed without a close in progress.
    Unexpected,
    /// Unknown header, undecodable frame or bad handshake.
    ProtocolViolation,
    /// A frame did not fit the configured read buffer.
    BufferTooSmall,
    /// A packet handler returned an error or panicked.
    HandlerFailed,
    /// The outbound queue filled up because the peer stopped reading.
    Backlogged,
    /// The server is shutting down.
    Shutdown,
}

/// Receiving end of a connection's outbound queue, owned by its writer task.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Box<dyn AnyPacket>>,
}

/// One accepted peer.
pub struct Connection {
    id: Uuid,
    peer: Option<SocketAddr>,
    context: Arc<ServerContext>,
    phase: Mutex<Phase>,
    handshake: Mutex<HandshakeState>,
    outbound: mpsc::Sender<Box<dyn AnyPacket>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
}

impl Connection {
    /// Create a connection and the queue its writer will drain.
    pub fn new(peer: Option<SocketAddr>, context: Arc<ServerContext>) -> (Arc<Self>, OutboundQueue) {
        let (outbound, rx) = mpsc::channel(context.config.max_outbound_queue.max(1));
        let handshake = HandshakeState::new(context.config.max_handshake_attempts);
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            peer,
            context,
            phase: Mutex::new(Phase::Close),
            handshake: Mutex::new(handshake),
            outbound,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        });
        (connection, OutboundQueue { rx })
    }

    /// Unique id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remote address, when the stream has one.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Shared server services.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Whether the clock-sync handshake is still running.
    pub fn is_handshaking(&self) -> bool {
        self.handshake.lock().is_active()
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reason passed to the first `close`.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Queue a packet. Never blocks; the writer task transmits it.
    ///
    /// A full queue closes the connection as [`CloseReason::Backlogged`].
    pub fn send<P: Packet>(&self, packet: P) -> Result<(), SendError> {
        self.send_boxed(Box::new(packet))
    }

    /// Queue an already boxed packet.
    pub fn send_boxed(&self, packet: Box<dyn AnyPacket>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed(self.id));
        }
        match self.outbound.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(packet)) => {
                let queued = self.outbound.max_capacity();
                warn!(
                    connection = %self.id,
                    queued,
                    packet = packet.type_name(),
                    "outbound queue full"
                );
                self.close(CloseReason::Backlogged);
                Err(SendError::Backlogged {
                    id: self.id,
                    queued,
                })
            }
            Err(TrySendError::Closed(_)) => Err(SendError::Closed(self.id)),
        }
    }

    /// Move to `phase` and tell the client.
    pub fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
        debug!(connection = %self.id, ?phase, "phase changed");
        if let Err(err) = self.send(GcPhase { phase }) {
            debug!(connection = %self.id, %err, "phase notification dropped");
        }
    }

    /// Begin clock sync with a fresh random nonce.
    pub fn start_handshake(&self) {
        let nonce = rand::random::<u32>();
        let now = self.context.clock.server_time();
        let request = self.handshake.lock().begin(nonce, now);
        debug!(connection = %self.id, nonce, time = now, "starting handshake");
        if let Err(err) = self.send(request) {
            debug!(connection = %self.id, %err, "handshake request dropped");
        }
    }

    /// Process a handshake reply.
    ///
    /// On convergence the post-handshake phase is set and the
    /// `on_handshake_finished` hooks run. Errors must close the connection.
    pub fn handle_handshake(self: &Arc<Self>, reply: &Handshake) -> Result<(), HandshakeError> {
        let now = self.context.clock.server_time();
        let step = self.handshake.lock().on_reply(reply, now)?;
        match step {
            HandshakeStep::Converged {
                attempts,
                difference,
            } => {
                info!(connection = %self.id, attempts, difference, "handshake converged");
                self.set_phase(post_handshake_phase(self.context.config.mode));
                self.context.hooks.on_handshake_finished(self);
            }
            HandshakeStep::Resend(request) => {
                debug!(
                    connection = %self.id,
                    delta = request.delta,
                    "handshake not converged, resending"
                );
                if let Err(err) = self.send(request) {
                    debug!(connection = %self.id, %err, "handshake resend dropped");
                }
            }
        }
        Ok(())
    }

    /// Close the connection. Only the first call has any effect.
    pub fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.close_reason.lock() = Some(reason);
        *self.phase.lock() = Phase::Close;
        self.cancel.cancel();
        info!(connection = %self.id, peer = ?self.peer, ?reason, "connection closed");
        self.context.hooks.on_disconnected(self, reason);
    }

    /// Drive the connection over `stream` until it closes.
    #[instrument(skip_all, fields(connection = %self.id, peer = ?self.peer))]
    pub async fn serve<S>(self: Arc<Self>, stream: S, queue: OutboundQueue, dispatcher: Arc<Dispatcher>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let writer = tokio::spawn(
            Arc::clone(&self)
                .write_loop(writer, queue)
                .in_current_span(),
        );

        self.context.hooks.on_connected(&self);
        info!("connection established");
        self.set_phase(Phase::Handshake);
        self.start_handshake();

        let mut frames = FrameReader::new(
            reader,
            Arc::clone(dispatcher.registry()),
            self.context.config.read_buffer_size,
        );
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = frames.next_packet() => next,
            };
            match next {
                Ok(Some(packet)) => {
                    let key = packet.key();
                    self.context.hooks.pre_packet_received(&self, packet.as_ref());
                    let outcome = AssertUnwindSafe(dispatcher.dispatch(&self, packet))
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(Ok(())) => self.context.hooks.post_packet_received(&self, key),
                        Ok(Err(err)) => {
                            warn!(packet = %key, "packet handler failed: {err:#}");
                            self.close(CloseReason::HandlerFailed);
                            break;
                        }
                        Err(panic) => {
                            error!(
                                packet = %key,
                                panic = panic_message(panic.as_ref()),
                                "packet handler panicked"
                            );
                            self.close(CloseReason::HandlerFailed);
                            break;
                        }
                    }
                }
                Ok(None) => {
                    debug!("peer closed the stream");
                    break;
                }
                Err(err) if err.is_transport() => {
                    debug!(%err, "read failed");
                    break;
                }
                Err(err) if err.is_configuration() => {
                    error!(%err, "dropping connection");
                    self.close(CloseReason::BufferTooSmall);
                    break;
                }
                Err(err) => {
                    warn!(%err, "protocol violation");
                    self.close(CloseReason::ProtocolViolation);
                    break;
                }
            }
        }

        self.close(CloseReason::Unexpected);
        if let Err(err) = writer.await {
            error!(%err, "writer task panicked");
        }
    }

    async fn write_loop<W>(self: Arc<Self>, mut writer: W, mut queue: OutboundQueue)
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let packet = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                packet = queue.rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };
            // A peer that stops reading must not keep a closed connection's writer alive.
            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                sent = self.transmit(&mut writer, packet.as_ref()) => sent,
            };
            if let Err(err) = sent {
                debug!(packet = packet.type_name(), %err, "send failed");
            }
        }
        if let Err(err) = writer.shutdown().await {
            debug!(%err, "socket shutdown failed");
        }
    }

    async fn transmit<W>(&self, writer: &mut W, packet: &dyn AnyPacket) -> Result<usize, SendError>
    where
        W: AsyncWrite + Unpin,
    {
        self.context.hooks.pre_packet_sent(self, packet);
        let mut buffer = self.context.buffers.rent();
        buffer.reserve_exact(packet.wire_len());
        let written = packet.write_frame(&mut buffer)?;
        writer.write_all(&buffer[..]).await?;
        writer.flush().await?;
        trace!(packet = packet.type_name(), bytes = written, "sent packet");
        self.context.hooks.post_packet_sent(self, packet.key(), written);
        Ok(written)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("phase", &self.phase())
            .field("closed", &self.is_closed())
            .finish()
    }
}
