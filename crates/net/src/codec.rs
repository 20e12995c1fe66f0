//! Field-level binary codec.
//!
//! Multi-byte integers are little-endian. Fixed-length strings are ASCII,
//! left-justified and zero-padded. Dynamic tails are raw bytes followed by a
//! single NUL terminator.

use crate::error::CodecError;
use crate::shape::FieldKind;
use std::fmt;
use std::ops::Deref;

/// Appends encoded fields to a byte buffer.
///
/// Positions are counted from where the writer started, so the header byte
/// sits at position 0. A writer can be told to drop a sub-header byte in at
/// a given position; it is emitted just before the first write that starts
/// there.
pub struct WireWriter<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
    insert: Option<(usize, u8)>,
}

impl<'a> WireWriter<'a> {
    /// Start writing at the current end of `buf`.
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        let start = buf.len();
        Self {
            buf,
            start,
            insert: None,
        }
    }

    pub(crate) fn with_insert(mut self, offset: usize, byte: u8) -> Self {
        self.insert = Some((offset, byte));
        self
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.buf.len() - self.start
    }

    fn place_insert(&mut self) {
        if let Some((offset, byte)) = self.insert {
            if self.position() == offset {
                self.buf.push(byte);
                self.insert = None;
            }
        }
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.place_insert();
        self.buf.extend_from_slice(bytes);
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    /// Write `bytes` left-justified in exactly `len` bytes, zero padded.
    pub fn write_padded(&mut self, bytes: &[u8], len: usize) -> Result<(), CodecError> {
        if bytes.len() > len {
            return Err(CodecError::StringTooLong {
                len: bytes.len(),
                max: len,
            });
        }
        self.write_bytes(bytes);
        self.buf.resize(self.buf.len() + (len - bytes.len()), 0);
        Ok(())
    }

    /// Write a dynamic tail followed by its NUL terminator.
    ///
    /// The payload itself may not contain NUL; the reader stops at the first one.
    pub fn write_tail(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        if bytes.contains(&0) {
            return Err(CodecError::InvalidString {
                reason: "dynamic payload contains NUL",
            });
        }
        self.write_bytes(bytes);
        self.buf.push(0);
        Ok(())
    }

    /// Flush a trailing sub-header and report the number of bytes written.
    pub(crate) fn finish(mut self) -> Result<usize, CodecError> {
        self.place_insert();
        if let Some((offset, _)) = self.insert {
            return Err(CodecError::SubHeaderOffset {
                offset,
                len: self.position(),
            });
        }
        Ok(self.position())
    }
}

/// Reads fields out of a complete frame.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    skip: Option<usize>,
}

impl<'a> WireReader<'a> {
    /// Read `buf` from the beginning.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            skip: None,
        }
    }

    pub(crate) fn starting_at(buf: &'a [u8], pos: usize) -> Self {
        Self {
            buf,
            pos,
            skip: None,
        }
    }

    pub(crate) fn with_skip(mut self, offset: usize) -> Self {
        self.skip = Some(offset);
        self
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Step over a pending skipped byte sitting at the current position.
    pub(crate) fn settle(&mut self) {
        if self.skip == Some(self.pos) {
            self.skip = None;
            self.pos += 1;
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.settle();
        let available = self.remaining();
        if n > available {
            return Err(CodecError::OutOfRange {
                offset: self.pos,
                needed: n,
                available,
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    /// Read exactly `N` bytes.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    /// Read `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len)
    }

    /// Read a zero-padded string of exactly `len` bytes.
    pub fn read_padded(&mut self, len: usize) -> Result<String, CodecError> {
        let bytes = self.take(len)?;
        let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        ascii_string(&bytes[..end])
    }

    /// Read a dynamic tail of `len` bytes plus its terminator.
    ///
    /// Text ends at the first NUL. Bytes that are not UTF-8 (legacy client
    /// code pages) become U+FFFD instead of failing the frame.
    pub fn read_tail(&mut self, len: usize) -> Result<String, CodecError> {
        let bytes = self.take(len)?;
        self.take(1)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

fn ascii_string(bytes: &[u8]) -> Result<String, CodecError> {
    if !bytes.is_ascii() {
        return Err(CodecError::InvalidString {
            reason: "fixed-length string is not ASCII",
        });
    }
    Ok(bytes.iter().map(|&b| char::from(b)).collect())
}

/// A value with a fixed on-wire width.
pub trait WireField: Sized {
    /// Layout metadata for shape descriptors.
    fn kind() -> FieldKind;

    /// Append the value.
    fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), CodecError>;

    /// Read the value back.
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError>;
}

macro_rules! int_fields {
    ($($ty:ty => $signed:expr),* $(,)?) => {
        $(
            impl WireField for $ty {
                fn kind() -> FieldKind {
                    FieldKind::Int {
                        width: std::mem::size_of::<$ty>(),
                        signed: $signed,
                    }
                }

                fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), CodecError> {
                    w.write_bytes(&self.to_le_bytes());
                    Ok(())
                }

                fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
                    Ok(<$ty>::from_le_bytes(r.read_array()?))
                }
            }
        )*
    };
}

int_fields!(
    u8 => false,
    u16 => false,
    u32 => false,
    u64 => false,
    i8 => true,
    i16 => true,
    i32 => true,
    i64 => true,
);

impl WireField for f32 {
    fn kind() -> FieldKind {
        FieldKind::Float { width: 4 }
    }

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), CodecError> {
        w.write_bytes(&self.to_le_bytes());
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(f32::from_le_bytes(r.read_array()?))
    }
}

impl WireField for bool {
    fn kind() -> FieldKind {
        FieldKind::Bool
    }

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), CodecError> {
        w.write_u8(u8::from(*self));
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(r.read_u8()? != 0)
    }
}

impl<T: WireField, const N: usize> WireField for [T; N] {
    fn kind() -> FieldKind {
        FieldKind::Array {
            element: Box::new(T::kind()),
            len: N,
        }
    }

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), CodecError> {
        for item in self {
            item.encode(w)?;
        }
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let items = (0..N)
            .map(|_| T::decode(r))
            .collect::<Result<Vec<_>, _>>()?;
        items
            .try_into()
            .map_err(|items: Vec<T>| CodecError::ArrayLength {
                expected: N,
                found: items.len(),
            })
    }
}

/// ASCII string occupying exactly `N` bytes on the wire.
///
/// Construction rejects anything longer than `N` bytes, non-ASCII text and
/// embedded NULs, so every value survives a round trip unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FixedString<const N: usize>(String);

impl<const N: usize> FixedString<N> {
    /// Field width in bytes.
    pub const LEN: usize = N;

    /// Validate and wrap `value`.
    pub fn new(value: impl Into<String>) -> Result<Self, CodecError> {
        let value = value.into();
        if value.len() > N {
            return Err(CodecError::StringTooLong {
                len: value.len(),
                max: N,
            });
        }
        if !value.is_ascii() {
            return Err(CodecError::InvalidString {
                reason: "fixed-length string is not ASCII",
            });
        }
        if value.bytes().any(|b| b == 0) {
            return Err(CodecError::InvalidString {
                reason: "fixed-length string contains NUL",
            });
        }
        Ok(Self(value))
    }

    /// Borrow the text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<const N: usize> Deref for FixedString<N> {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl<const N: usize> fmt::Display for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<const N: usize> TryFrom<&str> for FixedString<N> {
    type Error = CodecError;

    fn try_from(value: &str) -> Result<Self, CodecError> {
        Self::new(value)
    }
}

impl<const N: usize> WireField for FixedString<N> {
    fn kind() -> FieldKind {
        FieldKind::FixedString { len: N }
    }

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), CodecError> {
        w.write_padded(self.0.as_bytes(), N)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        r.read_padded(N).map(Self)
    }
}

/// Declare a C-like enum carried on the wire as its underlying integer.
///
/// The enum must derive `Clone` and `Copy`.
#[macro_export]
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $repr:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr($repr)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant = $value, )*
        }

        impl $crate::WireField for $name {
            fn kind() -> $crate::FieldKind {
                $crate::FieldKind::Enum {
                    name: stringify!($name),
                    width: ::std::mem::size_of::<$repr>(),
                }
            }

            fn encode(&self, w: &mut $crate::WireWriter<'_>) -> Result<(), $crate::CodecError> {
                $crate::WireField::encode(&(*self as $repr), w)
            }

            fn decode(r: &mut $crate::WireReader<'_>) -> Result<Self, $crate::CodecError> {
                let raw = <$repr as $crate::WireField>::decode(r)?;
                $(
                    if raw == $name::$variant as $repr {
                        return Ok($name::$variant);
                    }
                )*
                Err($crate::CodecError::InvalidEnum {
                    name: stringify!($name),
                    value: raw as i64,
                })
            }
        }
    };
}

/// Declare a composite field made of other wire fields, laid out in order.
#[macro_export]
macro_rules! wire_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $fvis:vis $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $( $(#[$fmeta])* $fvis $field: $ty, )*
        }

        impl $crate::WireField for $name {
            #[allow(unused_mut)]
            fn kind() -> $crate::FieldKind {
                let mut shape = $crate::ShapeBuilder::nested();
                $( shape.field::<$ty>(stringify!($field)); )*
                $crate::FieldKind::Nested {
                    name: stringify!($name),
                    fields: shape.into_fields(),
                }
            }

            #[allow(unused_variables)]
            fn encode(&self, w: &mut $crate::WireWriter<'_>) -> Result<(), $crate::CodecError> {
                $( $crate::WireField::encode(&self.$field, w)?; )*
                Ok(())
            }

            #[allow(unused_variables)]
            fn decode(r: &mut $crate::WireReader<'_>) -> Result<Self, $crate::CodecError> {
                Ok(Self {
                    $( $field: <$ty as $crate::WireField>::decode(r)?, )*
                })
            }
        }
    };
}
