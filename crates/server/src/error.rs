//! Send-path errors.

use emberlink_net::CodecError;
use thiserror::Error;
use uuid::Uuid;

/// Failure to queue or transmit a packet.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection is closed; nothing more is written.
    #[error("connection {0} is closed")]
    Closed(Uuid),

    /// The outbound queue was full; the connection has been closed.
    #[error("connection {id} fell {queued} packets behind and was closed")]
    Backlogged {
        /// Connection that stopped draining.
        id: Uuid,
        /// Queue bound it hit.
        queued: usize,
    },

    /// The packet could not be encoded.
    #[error("failed to encode packet: {0}")]
    Encode(#[from] CodecError),

    /// The socket rejected the write.
    #[error("failed to write packet: {0}")]
    Io(#[from] std::io::Error),
}
