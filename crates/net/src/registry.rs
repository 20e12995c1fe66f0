//! Packet registry: header (and sub-header) to packet type, shape and handler.
//!
//! The registry is assembled once at startup with [`RegistryBuilder`] and is
//! read-only afterwards, so it can be shared behind an `Arc` without locking.

use crate::error::{CodecError, RegistryError};
use crate::packet::{decode, AnyPacket, Packet};
use crate::shape::PacketShape;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::debug;

/// Header byte plus optional sub-header byte; unique per packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeaderKey {
    /// Header byte.
    pub header: u8,
    /// Sub-header byte for family members.
    pub sub_header: Option<u8>,
}

impl HeaderKey {
    /// Build a key.
    pub const fn new(header: u8, sub_header: Option<u8>) -> Self {
        Self { header, sub_header }
    }

    /// Key of a packet without a sub-header.
    pub const fn plain(header: u8) -> Self {
        Self::new(header, None)
    }
}

impl fmt::Display for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub_header {
            Some(sub) => write!(f, "0x{:02X}/0x{:02X}", self.header, sub),
            None => write!(f, "0x{:02X}", self.header),
        }
    }
}

/// Identifies a handler type without naming it.
#[derive(Debug, Clone, Copy)]
pub struct HandlerId {
    type_id: TypeId,
    name: &'static str,
}

impl HandlerId {
    /// Identity of handler type `H`.
    pub fn of<H: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            name: std::any::type_name::<H>(),
        }
    }

    /// Rust type name of the handler.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for HandlerId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for HandlerId {}

impl Hash for HandlerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

type Decoder = fn(&[u8]) -> Result<Box<dyn AnyPacket>, CodecError>;

fn decode_boxed<P: Packet>(frame: &[u8]) -> Result<Box<dyn AnyPacket>, CodecError> {
    decode::<P>(frame).map(|packet| Box::new(packet) as Box<dyn AnyPacket>)
}

/// Everything the transport knows about one packet type.
#[derive(Clone)]
pub struct PacketInfo {
    /// Registry key.
    pub key: HeaderKey,
    /// Packet type name.
    pub name: &'static str,
    /// Cached shape.
    pub shape: &'static PacketShape,
    /// Handler bound to this packet, if any.
    pub handler: Option<HandlerId>,
    type_id: TypeId,
    decoder: Decoder,
}

impl PacketInfo {
    fn of<P: Packet>(handler: Option<HandlerId>) -> Self {
        Self {
            key: P::header_key(),
            name: P::NAME,
            shape: P::shape(),
            handler,
            type_id: TypeId::of::<P>(),
            decoder: decode_boxed::<P>,
        }
    }

    /// Decode a complete frame into the registered packet type.
    pub fn decode(&self, frame: &[u8]) -> Result<Box<dyn AnyPacket>, CodecError> {
        (self.decoder)(frame)
    }
}

impl fmt::Debug for PacketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketInfo")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("fixed_size", &self.shape.fixed_size)
            .field("handler", &self.handler.map(|h| h.name()))
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Family {
    sub_header_offset: usize,
    members: HashMap<u8, PacketInfo>,
}

/// Read-only lookup table from header keys to packet metadata.
#[derive(Debug, Clone, Default)]
pub struct PacketRegistry {
    plain: HashMap<u8, PacketInfo>,
    families: HashMap<u8, Family>,
    by_type: HashMap<TypeId, HeaderKey>,
}

impl PacketRegistry {
    /// Start assembling a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look a packet up by its wire header.
    ///
    /// Family members need their sub-header; plain packets take `None`.
    pub fn try_get_packet_info(&self, header: u8, sub_header: Option<u8>) -> Option<&PacketInfo> {
        match sub_header {
            Some(sub) => self.families.get(&header)?.members.get(&sub),
            None => self.plain.get(&header),
        }
    }

    /// Look a packet up by key.
    pub fn get(&self, key: HeaderKey) -> Option<&PacketInfo> {
        self.try_get_packet_info(key.header, key.sub_header)
    }

    /// Look up the registration of an outgoing packet's concrete type.
    pub fn try_get_packet_info_by_instance(&self, packet: &dyn AnyPacket) -> Option<&PacketInfo> {
        let type_id = Any::type_id(packet.as_any());
        let key = self.by_type.get(&type_id)?;
        self.get(*key)
    }

    /// Whether `header` introduces a sub-header family.
    pub fn is_sub_packet_definition(&self, header: u8) -> bool {
        self.families.contains_key(&header)
    }

    /// Where the sub-header sits for the family under `header`.
    pub fn sub_header_offset(&self, header: u8) -> Option<usize> {
        self.families
            .get(&header)
            .map(|family| family.sub_header_offset)
    }

    /// Number of registered packet types.
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

/// Collects packet registrations and rejects conflicting layouts.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: PacketRegistry,
}

impl RegistryBuilder {
    /// Register packet type `P` with no handler.
    pub fn register<P: Packet>(&mut self) -> Result<&mut Self, RegistryError> {
        self.insert(PacketInfo::of::<P>(None))
    }

    /// Register packet type `P` bound to `handler`.
    ///
    /// Registering a type that is already present only replaces its handler.
    pub fn register_handled<P: Packet>(
        &mut self,
        handler: HandlerId,
    ) -> Result<&mut Self, RegistryError> {
        self.insert(PacketInfo::of::<P>(Some(handler)))
    }

    fn insert(&mut self, info: PacketInfo) -> Result<&mut Self, RegistryError> {
        info.shape.validate()?;
        let key = info.key;

        if let Some(existing) = self.registry.get(key) {
            if existing.type_id != info.type_id {
                return Err(RegistryError::DuplicateKey {
                    key,
                    existing: existing.name,
                    packet: info.name,
                });
            }
        }

        match key.sub_header {
            None => {
                if let Some(family) = self.registry.families.get(&key.header) {
                    return Err(RegistryError::MixedFamily {
                        header: key.header,
                        family: family.members.values().next().map_or("?", |m| m.name),
                        plain: info.name,
                    });
                }
                self.registry
                    .plain
                    .entry(key.header)
                    .and_modify(|existing| {
                        if info.handler.is_some() {
                            existing.handler = info.handler;
                        }
                    })
                    .or_insert_with(|| info.clone());
            }
            Some(sub) => {
                if let Some(plain) = self.registry.plain.get(&key.header) {
                    return Err(RegistryError::MixedFamily {
                        header: key.header,
                        family: info.name,
                        plain: plain.name,
                    });
                }
                let offset = info.shape.sub_header_offset.unwrap_or(1);
                let family = self
                    .registry
                    .families
                    .entry(key.header)
                    .or_insert_with(|| Family {
                        sub_header_offset: offset,
                        members: HashMap::new(),
                    });
                if family.sub_header_offset != offset {
                    return Err(RegistryError::InconsistentFamily {
                        header: key.header,
                        packet: info.name,
                        offset,
                        expected: family.sub_header_offset,
                    });
                }
                family
                    .members
                    .entry(sub)
                    .and_modify(|existing| {
                        if info.handler.is_some() {
                            existing.handler = info.handler;
                        }
                    })
                    .or_insert_with(|| info.clone());
            }
        }

        debug!(packet = info.name, %key, "registered packet");
        self.registry.by_type.insert(info.type_id, key);
        Ok(self)
    }

    /// Finish and freeze the registry.
    pub fn build(self) -> PacketRegistry {
        self.registry
    }
}
