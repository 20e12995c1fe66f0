//! Packet shape descriptors.
//!
//! A [`PacketShape`] is the layout of one packet type: every field with its
//! byte offset, the fixed size, and whether a sequence byte or a dynamic tail
//! follows. Shapes are computed once per type and cached for the life of the
//! process.

use crate::codec::WireField;
use crate::error::{CodecError, RegistryError};
use crate::packet::Packet;

/// How a dynamic packet's size field counts bytes.
///
/// Each packet keeps whatever convention its clients already use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeConvention {
    /// Size is the payload length alone.
    TailOnly,
    /// Size is the payload length plus the NUL terminator.
    TailWithTerminator,
    /// Size is the whole packet: header, fixed fields, payload and terminator.
    WholePacket,
}

impl SizeConvention {
    fn overhead(self, fixed_size: usize) -> usize {
        match self {
            SizeConvention::TailOnly => 0,
            SizeConvention::TailWithTerminator => 1,
            SizeConvention::WholePacket => fixed_size + 1,
        }
    }

    /// Payload length (without terminator) described by `size`.
    pub fn tail_len(self, size: usize, fixed_size: usize) -> Result<usize, CodecError> {
        let overhead = self.overhead(fixed_size);
        size.checked_sub(overhead)
            .ok_or(CodecError::SizeUnderflow { size, overhead })
    }

    /// Size field value for a payload of `tail_len` bytes.
    pub fn size_value(self, tail_len: usize, fixed_size: usize) -> Result<u16, CodecError> {
        let size = tail_len + self.overhead(fixed_size);
        u16::try_from(size).map_err(|_| CodecError::SizeOverflow { size })
    }
}

/// What a field is and how wide it is on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// The packet header byte.
    Header,
    /// The sub-header byte of a packet family.
    SubHeader,
    /// Little-endian integer.
    Int {
        /// Width in bytes.
        width: usize,
        /// Two's complement or unsigned.
        signed: bool,
    },
    /// Little-endian IEEE float.
    Float {
        /// Width in bytes.
        width: usize,
    },
    /// One byte, nonzero is true.
    Bool,
    /// Zero-padded ASCII of exactly `len` bytes.
    FixedString {
        /// Width in bytes.
        len: usize,
    },
    /// `len` elements of the same kind back to back.
    Array {
        /// Element kind.
        element: Box<FieldKind>,
        /// Element count.
        len: usize,
    },
    /// Enum carried as its underlying integer.
    Enum {
        /// Enum type name.
        name: &'static str,
        /// Width of the underlying integer.
        width: usize,
    },
    /// Composite field with its own offset table (offsets relative to its start).
    Nested {
        /// Composite type name.
        name: &'static str,
        /// Member fields.
        fields: Vec<FieldLayout>,
    },
    /// 16-bit size of a dynamic packet.
    SizePrefix(SizeConvention),
    /// Variable-length payload; not part of the fixed size.
    DynamicTail,
}

impl FieldKind {
    /// Width in bytes; zero for the dynamic tail.
    pub fn width(&self) -> usize {
        match self {
            FieldKind::Header | FieldKind::SubHeader | FieldKind::Bool => 1,
            FieldKind::Int { width, .. }
            | FieldKind::Float { width }
            | FieldKind::Enum { width, .. } => *width,
            FieldKind::FixedString { len } => *len,
            FieldKind::Array { element, len } => element.width() * len,
            FieldKind::Nested { fields, .. } => fields.iter().map(FieldLayout::width).sum(),
            FieldKind::SizePrefix(_) => 2,
            FieldKind::DynamicTail => 0,
        }
    }
}

/// One field at its byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    /// Field name as declared.
    pub name: &'static str,
    /// Offset from the start of the packet (or of the enclosing composite).
    pub offset: usize,
    /// Field kind.
    pub kind: FieldKind,
}

impl FieldLayout {
    /// Width in bytes.
    pub fn width(&self) -> usize {
        self.kind.width()
    }
}

/// Where a dynamic packet keeps its size and how the size is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicLayout {
    /// Offset of the 16-bit size field.
    pub size_offset: usize,
    /// Size semantics.
    pub convention: SizeConvention,
}

/// Collects fields in wire order and assigns offsets.
#[derive(Debug, Default)]
pub struct ShapeBuilder {
    fields: Vec<FieldLayout>,
    offset: usize,
    pending_sub_header: Option<usize>,
    dynamic: Option<DynamicLayout>,
    tail_declared: bool,
    problems: Vec<String>,
}

impl ShapeBuilder {
    /// Builder for a composite field: offsets start at zero, no header.
    pub fn nested() -> Self {
        Self::default()
    }

    fn for_packet(sub_header_offset: Option<usize>) -> Self {
        let mut builder = Self {
            pending_sub_header: sub_header_offset,
            ..Self::default()
        };
        builder.fields.push(FieldLayout {
            name: "header",
            offset: 0,
            kind: FieldKind::Header,
        });
        builder.offset = 1;
        builder
    }

    fn place_sub_header(&mut self) {
        if self.pending_sub_header == Some(self.offset) {
            self.fields.push(FieldLayout {
                name: "sub_header",
                offset: self.offset,
                kind: FieldKind::SubHeader,
            });
            self.offset += 1;
            self.pending_sub_header = None;
        }
    }

    fn push(&mut self, name: &'static str, kind: FieldKind) -> usize {
        self.place_sub_header();
        if self.tail_declared {
            self.problems
                .push(format!("field `{name}` follows the dynamic tail"));
        }
        let offset = self.offset;
        self.offset += kind.width();
        self.fields.push(FieldLayout { name, offset, kind });
        offset
    }

    /// Declare the next fixed field.
    pub fn field<T: WireField>(&mut self, name: &'static str) -> &mut Self {
        self.push(name, T::kind());
        self
    }

    /// Declare the 16-bit size field of a dynamic packet.
    pub fn size_prefix(&mut self, name: &'static str, convention: SizeConvention) -> &mut Self {
        if self.dynamic.is_some() {
            self.problems.push("more than one size field".to_owned());
        }
        let size_offset = self.push(name, FieldKind::SizePrefix(convention));
        self.dynamic = Some(DynamicLayout {
            size_offset,
            convention,
        });
        self
    }

    /// Declare the variable-length tail. Must come last.
    pub fn dynamic_tail(&mut self, name: &'static str) -> &mut Self {
        if self.dynamic.is_none() {
            self.problems
                .push(format!("dynamic tail `{name}` has no size field"));
        }
        if self.tail_declared {
            self.problems.push("more than one dynamic tail".to_owned());
        }
        self.push(name, FieldKind::DynamicTail);
        self.tail_declared = true;
        self
    }

    /// Fields declared so far.
    pub fn into_fields(self) -> Vec<FieldLayout> {
        self.fields
    }
}

/// Compiled layout of one packet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketShape {
    /// Packet type name.
    pub name: &'static str,
    /// Header byte.
    pub header: u8,
    /// Sub-header byte, for packet families.
    pub sub_header: Option<u8>,
    /// Offset of the sub-header byte, for packet families.
    pub sub_header_offset: Option<usize>,
    /// Every field in wire order, header included.
    pub fields: Vec<FieldLayout>,
    /// Bytes before the dynamic tail, header and sub-header included.
    /// Excludes the tail, its terminator and the sequence byte.
    pub fixed_size: usize,
    /// A trailing sequence byte follows every frame of this type.
    pub has_sequence_byte: bool,
    /// Size field location for dynamic packets.
    pub dynamic: Option<DynamicLayout>,
    problems: Vec<String>,
}

impl PacketShape {
    /// Derive the shape of `P` from its field declarations.
    ///
    /// Prefer [`Packet::shape`], which caches the result.
    pub fn of<P: Packet>() -> Self {
        let sub_header_offset = P::SUB_HEADER.map(|_| P::SUB_HEADER_OFFSET);
        let mut builder = ShapeBuilder::for_packet(sub_header_offset);
        P::describe(&mut builder);
        builder.place_sub_header();

        let mut problems = std::mem::take(&mut builder.problems);
        if let Some(offset) = builder.pending_sub_header {
            problems.push(format!(
                "sub-header offset {offset} does not fall on a field boundary"
            ));
        }
        if builder.dynamic.is_some() && !builder.tail_declared {
            problems.push("size field without a dynamic tail".to_owned());
        }

        Self {
            name: P::NAME,
            header: P::HEADER,
            sub_header: P::SUB_HEADER,
            sub_header_offset,
            fixed_size: builder.offset,
            has_sequence_byte: P::SEQUENCE,
            dynamic: builder.dynamic,
            fields: builder.fields,
            problems,
        }
    }

    /// Whether a variable-length tail follows the fixed fields.
    pub fn has_dynamic_tail(&self) -> bool {
        self.dynamic.is_some()
    }

    /// Look a field up by name.
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Reject layouts that cannot be framed.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.problems.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::InvalidShape {
                packet: self.name,
                reason: self.problems.join("; "),
            })
        }
    }

    /// Payload length described by a size field value.
    pub fn tail_len(&self, size: u16) -> Result<usize, CodecError> {
        match self.dynamic {
            Some(dynamic) => dynamic
                .convention
                .tail_len(usize::from(size), self.fixed_size),
            None => Ok(0),
        }
    }

    /// Size field value for a payload of `tail_len` bytes.
    pub fn size_value(&self, tail_len: usize) -> Result<u16, CodecError> {
        let convention = self
            .dynamic
            .map_or(SizeConvention::TailOnly, |dynamic| dynamic.convention);
        convention.size_value(tail_len, self.fixed_size)
    }

    /// Total bytes on the wire for a payload of `tail_len` bytes.
    pub fn frame_len(&self, tail_len: usize) -> usize {
        let tail = if self.has_dynamic_tail() {
            tail_len + 1
        } else {
            0
        };
        self.fixed_size + tail + usize::from(self.has_sequence_byte)
    }
}
