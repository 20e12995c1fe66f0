#![warn(missing_docs)]
//! Wire protocol for emberlink: field codec, packet shapes, the packet
//! registry and the async frame reader.

mod codec;
mod error;
mod framing;
mod packet;
pub mod protocol;
mod registry;
mod shape;

pub use codec::{FixedString, WireField, WireReader, WireWriter};
pub use error::{CodecError, FrameError, RegistryError};
pub use framing::{FrameReader, DEFAULT_READ_BUFFER};
pub use packet::{decode, encode, encode_into, encoded_len, AnyPacket, Packet};
pub use registry::{HandlerId, HeaderKey, PacketInfo, PacketRegistry, RegistryBuilder};
pub use shape::{DynamicLayout, FieldKind, FieldLayout, PacketShape, ShapeBuilder, SizeConvention};
