//! Packet trait, encode/decode entry points and the type-erased packet object.

use crate::codec::{WireReader, WireWriter};
use crate::error::CodecError;
use crate::registry::HeaderKey;
use crate::shape::{PacketShape, ShapeBuilder};
use std::any::Any;
use std::fmt;

/// A message type with a fixed header and a declared field layout.
///
/// Most packets are declared with [`packet!`](crate::packet!). Dynamic
/// packets and families whose sub-header is not at offset 1 implement the
/// trait by hand.
pub trait Packet: fmt::Debug + Send + Sync + Sized + 'static {
    /// Header byte.
    const HEADER: u8;
    /// Sub-header byte for members of a packet family.
    const SUB_HEADER: Option<u8> = None;
    /// Offset of the sub-header byte. Every member of a family must agree.
    const SUB_HEADER_OFFSET: usize = 1;
    /// Whether a sequence byte trails every frame.
    const SEQUENCE: bool = false;
    /// Type name used in logs and errors.
    const NAME: &'static str;

    /// Declare the body fields in wire order.
    fn describe(shape: &mut ShapeBuilder);

    /// Write the body. The header and sub-header are written by the caller.
    fn encode_body(&self, w: &mut WireWriter<'_>) -> Result<(), CodecError>;

    /// Read the body. The reader is positioned after the header and steps
    /// over the sub-header on its own.
    fn decode_body(r: &mut WireReader<'_>) -> Result<Self, CodecError>;

    /// Cached shape; implement with [`cached_shape!`](crate::cached_shape!).
    fn shape() -> &'static PacketShape;

    /// Length of the dynamic payload, without its terminator.
    fn dynamic_len(&self) -> usize {
        0
    }

    /// Registry key of this packet type.
    fn header_key() -> HeaderKey {
        HeaderKey::new(Self::HEADER, Self::SUB_HEADER)
    }
}

/// Body of [`Packet::shape`]: computes the shape once per type.
#[macro_export]
macro_rules! cached_shape {
    () => {{
        static SHAPE: ::std::sync::OnceLock<$crate::PacketShape> = ::std::sync::OnceLock::new();
        SHAPE.get_or_init($crate::PacketShape::of::<Self>)
    }};
}

/// Declare a fixed-size packet.
///
/// ```
/// emberlink_net::packet! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub struct Ping => 0x2C, sequence {
///         pub stamp: u32,
///     }
/// }
/// ```
///
/// `=> 0x50 / 0x0B` declares a family member with its sub-header at offset 1.
#[macro_export]
macro_rules! packet {
    (@sub) => { None };
    (@sub $sub:literal) => { Some($sub) };
    (@seq) => { false };
    (@seq sequence) => { true };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident => $header:literal $(/ $sub:literal)? $(, $seq:ident)? {
            $( $(#[$fmeta:meta])* $fvis:vis $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $( $(#[$fmeta])* $fvis $field: $ty, )*
        }

        impl $crate::Packet for $name {
            const HEADER: u8 = $header;
            const SUB_HEADER: Option<u8> = $crate::packet!(@sub $($sub)?);
            const SEQUENCE: bool = $crate::packet!(@seq $($seq)?);
            const NAME: &'static str = stringify!($name);

            #[allow(unused_variables)]
            fn describe(shape: &mut $crate::ShapeBuilder) {
                $( shape.field::<$ty>(stringify!($field)); )*
            }

            #[allow(unused_variables)]
            fn encode_body(&self, w: &mut $crate::WireWriter<'_>) -> Result<(), $crate::CodecError> {
                $( $crate::WireField::encode(&self.$field, w)?; )*
                Ok(())
            }

            #[allow(unused_variables)]
            fn decode_body(r: &mut $crate::WireReader<'_>) -> Result<Self, $crate::CodecError> {
                Ok(Self {
                    $( $field: <$ty as $crate::WireField>::decode(r)?, )*
                })
            }

            fn shape() -> &'static $crate::PacketShape {
                $crate::cached_shape!()
            }
        }
    };
}

/// Bytes `packet` occupies on the wire, sequence byte included.
pub fn encoded_len<P: Packet>(packet: &P) -> usize {
    P::shape().frame_len(packet.dynamic_len())
}

/// Append the encoded frame to `buf` and return the number of bytes written.
///
/// On error `buf` is left as it was.
pub fn encode_into<P: Packet>(packet: &P, buf: &mut Vec<u8>) -> Result<usize, CodecError> {
    let start = buf.len();
    let mut w = WireWriter::new(buf);
    if let Some(sub) = P::SUB_HEADER {
        w = w.with_insert(P::SUB_HEADER_OFFSET, sub);
    }
    w.write_u8(P::HEADER);
    let written = match packet.encode_body(&mut w) {
        Ok(()) => w.finish(),
        Err(err) => Err(err),
    };
    match written {
        Ok(written) if P::SEQUENCE => {
            buf.push(0);
            Ok(written + 1)
        }
        Ok(written) => Ok(written),
        Err(err) => {
            buf.truncate(start);
            Err(err)
        }
    }
}

/// Encode a packet into a fresh buffer.
pub fn encode<P: Packet>(packet: &P) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(encoded_len(packet));
    encode_into(packet, &mut buf)?;
    Ok(buf)
}

/// Decode one complete frame.
///
/// A trailing sequence byte is accepted for sequenced packets but not
/// required; anything else left over is an error.
pub fn decode<P: Packet>(frame: &[u8]) -> Result<P, CodecError> {
    let mut r = WireReader::new(frame);
    let found = r.read_u8()?;
    if found != P::HEADER {
        return Err(CodecError::HeaderMismatch {
            expected: P::HEADER,
            found,
        });
    }

    let mut body = WireReader::starting_at(frame, 1);
    if let Some(expected) = P::SUB_HEADER {
        let offset = P::SUB_HEADER_OFFSET;
        let found = *frame.get(offset).ok_or(CodecError::OutOfRange {
            offset,
            needed: 1,
            available: 0,
        })?;
        if found != expected {
            return Err(CodecError::SubHeaderMismatch { expected, found });
        }
        body = body.with_skip(offset);
    }

    let packet = P::decode_body(&mut body)?;
    body.settle();
    let remaining = body.remaining();
    if remaining > usize::from(P::SEQUENCE) {
        return Err(CodecError::TrailingBytes { remaining });
    }
    Ok(packet)
}

/// Object-safe view of any [`Packet`], used where the concrete type is only
/// known at runtime (frame reader output, outbound queue).
pub trait AnyPacket: fmt::Debug + Send + Sync + 'static {
    /// Registry key.
    fn key(&self) -> HeaderKey;
    /// Packet type name.
    fn type_name(&self) -> &'static str;
    /// Layout of the concrete type.
    fn layout(&self) -> &'static PacketShape;
    /// Bytes on the wire, sequence byte included.
    fn wire_len(&self) -> usize;
    /// Append the encoded frame to `buf`.
    fn write_frame(&self, buf: &mut Vec<u8>) -> Result<usize, CodecError>;
    /// Borrow as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
    /// Convert into `Any` for downcasting by value.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<P: Packet> AnyPacket for P {
    fn key(&self) -> HeaderKey {
        <P as Packet>::header_key()
    }

    fn type_name(&self) -> &'static str {
        P::NAME
    }

    fn layout(&self) -> &'static PacketShape {
        <P as Packet>::shape()
    }

    fn wire_len(&self) -> usize {
        encoded_len(self)
    }

    fn write_frame(&self, buf: &mut Vec<u8>) -> Result<usize, CodecError> {
        encode_into(self, buf)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl dyn AnyPacket {
    /// Whether the concrete type is `P`.
    pub fn is<P: Packet>(&self) -> bool {
        self.as_any().is::<P>()
    }

    /// Borrow as `P` if that is the concrete type.
    pub fn downcast_ref<P: Packet>(&self) -> Option<&P> {
        self.as_any().downcast_ref::<P>()
    }

    /// Take ownership as `P` if that is the concrete type.
    pub fn downcast<P: Packet>(self: Box<Self>) -> Option<Box<P>> {
        self.into_any().downcast::<P>().ok()
    }
}
