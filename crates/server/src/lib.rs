#![warn(missing_docs)]
//! TCP transport for emberlink: connection actors, clock-sync handshake,
//! handler dispatch and the accept loop.

mod connection;
mod context;
mod dispatch;
mod error;
mod handshake;
mod hooks;
mod pool;
mod server;

pub use connection::{CloseReason, Connection, OutboundQueue};
pub use context::{post_handshake_phase, NetConfig, ServerContext};
pub use dispatch::{Dispatcher, PacketContext, PacketHandler};
pub use error::SendError;
pub use handshake::{HandshakeError, HandshakeState, HandshakeStep, CONVERGENCE_WINDOW_MS};
pub use hooks::{ConnectionHooks, HookSet};
pub use pool::{Pool, Pooled, Reusable};
pub use server::{PacketModule, Server, ServerBuilder};
