//! Error types for the codec, registry, and frame reader.

use crate::registry::HeaderKey;
use thiserror::Error;

/// Failure while encoding or decoding a single packet.
///
/// `OutOfRange` means the buffer ended before a field could be read; every
/// other variant means the bytes were present but did not make sense.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Attempted to read past the end of the supplied buffer.
    #[error("read of {needed} bytes at offset {offset} exceeds buffer ({available} bytes left)")]
    OutOfRange {
        /// Offset at which the read started.
        offset: usize,
        /// Bytes the read required.
        needed: usize,
        /// Bytes that were actually left.
        available: usize,
    },

    /// A fixed-length string does not fit its field.
    #[error("string of {len} bytes does not fit a {max}-byte field")]
    StringTooLong {
        /// Length of the rejected string.
        len: usize,
        /// Field length.
        max: usize,
    },

    /// A string contained bytes the wire format cannot carry.
    #[error("string is not valid for the wire: {reason}")]
    InvalidString {
        /// What was wrong with it.
        reason: &'static str,
    },

    /// An enum field carried an undeclared discriminant.
    #[error("invalid {name} discriminant {value}")]
    InvalidEnum {
        /// Enum type name.
        name: &'static str,
        /// Raw value read from the wire.
        value: i64,
    },

    /// The header byte did not belong to the packet being decoded.
    #[error("expected header 0x{expected:02X}, found 0x{found:02X}")]
    HeaderMismatch {
        /// Header declared by the packet type.
        expected: u8,
        /// Header found on the wire.
        found: u8,
    },

    /// The sub-header byte did not belong to the packet being decoded.
    #[error("expected sub-header 0x{expected:02X}, found 0x{found:02X}")]
    SubHeaderMismatch {
        /// Sub-header declared by the packet type.
        expected: u8,
        /// Sub-header found on the wire.
        found: u8,
    },

    /// A size field was smaller than the bytes it must account for.
    #[error("size field {size} is smaller than the {overhead}-byte overhead it must include")]
    SizeUnderflow {
        /// Value of the size field.
        size: usize,
        /// Bytes the size convention counts besides the dynamic payload.
        overhead: usize,
    },

    /// A dynamic payload is too large for its size field.
    #[error("packet size {size} does not fit the 16-bit size field")]
    SizeOverflow {
        /// Size that would have been written.
        size: usize,
    },

    /// The sub-header offset never lined up with a field boundary.
    #[error("sub-header offset {offset} was never reached (packet body is {len} bytes)")]
    SubHeaderOffset {
        /// Declared offset.
        offset: usize,
        /// Bytes written.
        len: usize,
    },

    /// An array field decoded to the wrong number of elements.
    #[error("array expected {expected} elements, decoded {found}")]
    ArrayLength {
        /// Declared length.
        expected: usize,
        /// Decoded length.
        found: usize,
    },

    /// Bytes were left over after the packet body was decoded.
    #[error("{remaining} unexpected trailing bytes")]
    TrailingBytes {
        /// Leftover byte count.
        remaining: usize,
    },
}

impl CodecError {
    /// Whether the error came from running out of bytes rather than from bad data.
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, CodecError::OutOfRange { .. })
    }
}

/// Startup-time registry configuration error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Two packet types claimed the same header key.
    #[error("header {key} is registered by both {existing} and {packet}")]
    DuplicateKey {
        /// Contested key.
        key: HeaderKey,
        /// Packet registered first.
        existing: &'static str,
        /// Packet rejected.
        packet: &'static str,
    },

    /// A header is used both with and without a sub-header.
    #[error("header 0x{header:02X} mixes sub-header packets ({family}) with a plain packet ({plain})")]
    MixedFamily {
        /// Shared header.
        header: u8,
        /// A packet that carries a sub-header.
        family: &'static str,
        /// A packet that does not.
        plain: &'static str,
    },

    /// Members of one packet family disagree on where the sub-header sits.
    #[error("packet {packet} places its sub-header at offset {offset}, family 0x{header:02X} uses {expected}")]
    InconsistentFamily {
        /// Family header.
        header: u8,
        /// Packet rejected.
        packet: &'static str,
        /// Offset declared by the rejected packet.
        offset: usize,
        /// Offset used by the rest of the family.
        expected: usize,
    },

    /// The packet's own layout declaration is unusable.
    #[error("packet {packet} has an invalid shape: {reason}")]
    InvalidShape {
        /// Packet type name.
        packet: &'static str,
        /// Collected layout problems.
        reason: String,
    },
}

/// Reasons the frame reader stops producing packets.
#[derive(Debug, Error)]
pub enum FrameError {
    /// No packet is registered for the header (and sub-header) read.
    #[error("unknown packet header {key}")]
    UnknownHeader {
        /// Key read off the wire.
        key: HeaderKey,
    },

    /// The configured read buffer cannot hold the packet.
    #[error(
        "packet {key} needs {required} bytes but the read buffer holds {capacity}; raise the read buffer size"
    )]
    BufferTooSmall {
        /// Offending packet key.
        key: HeaderKey,
        /// Bytes the packet needs.
        required: usize,
        /// Configured buffer size.
        capacity: usize,
    },

    /// The frame was complete but its contents did not decode.
    #[error("failed to decode packet {key}: {source}")]
    Decode {
        /// Packet key.
        key: HeaderKey,
        /// Underlying codec failure.
        #[source]
        source: CodecError,
    },

    /// The underlying stream failed or closed mid-frame.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Unknown headers and undecodable frames: the peer broke the protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FrameError::UnknownHeader { .. } | FrameError::Decode { .. }
        )
    }

    /// Socket-level failures, expected during ordinary disconnects.
    pub fn is_transport(&self) -> bool {
        matches!(self, FrameError::Io(_))
    }

    /// Local misconfiguration rather than anything the peer did.
    pub fn is_configuration(&self) -> bool {
        matches!(self, FrameError::BufferTooSmall { .. })
    }
}
