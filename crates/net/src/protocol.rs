//! Packet catalog shared by the server and client simulators.
//!
//! Fixed-size packets are declared with [`packet!`](crate::packet!); the
//! dynamic chat packets implement [`Packet`] by hand because each keeps the
//! size convention its clients were built against.

use crate::codec::{FixedString, WireField, WireReader, WireWriter};
use crate::error::{CodecError, RegistryError};
use crate::packet::Packet;
use crate::registry::RegistryBuilder;
use crate::shape::{PacketShape, ShapeBuilder, SizeConvention};

crate::wire_enum! {
    /// Connection phase announced to the client with [`GcPhase`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Phase: u8 {
        /// Connection is closing.
        Close = 0,
        /// Clock synchronisation in progress.
        Handshake = 1,
        /// Waiting for credentials.
        Login = 2,
        /// Character selection.
        Select = 3,
        /// Loading into the world.
        Loading = 4,
        /// In game.
        Game = 5,
        /// Character is dead.
        Dead = 6,
        /// Authentication server session.
        Auth = 10,
    }
}

crate::wire_enum! {
    /// Player kingdom.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Empire: u8 {
        /// Red kingdom.
        Shinsoo = 1,
        /// Yellow kingdom.
        Chunjo = 2,
        /// Blue kingdom.
        Jinno = 3,
    }
}

crate::wire_enum! {
    /// Chat channel of a message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum ChatMessageType: u8 {
        /// Local talk.
        Normal = 0,
        /// Party chat.
        Party = 1,
        /// Guild chat.
        Guild = 2,
        /// Shout to the whole map.
        Shout = 3,
        /// System information.
        Info = 4,
        /// Server notice.
        Notice = 5,
        /// Dice roll result.
        Dice = 6,
        /// Command output.
        Command = 7,
        /// Big on-screen notice.
        Big = 8,
    }
}

crate::packet! {
    /// Clock synchronisation exchange, sent by both sides.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Handshake => 0xFF {
        /// Nonce chosen by the server for this connection.
        pub handshake: u32,
        /// Sender's clock in milliseconds.
        pub time: u32,
        /// Estimated one-way latency in milliseconds.
        pub delta: u32,
    }
}

crate::packet! {
    /// Announces a phase change to the client.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcPhase => 0xFD {
        /// New phase.
        pub phase: Phase,
    }
}

crate::packet! {
    /// Client picks a character slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SelectCharacter => 0x06 {
        /// Slot index.
        pub slot: u8,
    }
}

crate::packet! {
    /// Credentials sent after the handshake.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LoginRequest => 0x6F, sequence {
        /// Account name.
        pub username: FixedString<31>,
        /// Login key or password.
        pub password: FixedString<17>,
        /// Client cipher key.
        pub encrypt_key: [u32; 4],
    }
}

crate::wire_struct! {
    /// One character slot in the selection screen.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct CharacterSlot {
        /// Character id, zero for an empty slot.
        pub id: u32,
        /// Character name.
        pub name: FixedString<25>,
        /// Class and gender.
        pub class: u8,
        /// Level.
        pub level: u8,
        /// Minutes played.
        pub playtime: u32,
        /// Last position.
        pub x: i32,
        /// Last position.
        pub y: i32,
        /// Game server address, IPv4 as a little-endian integer.
        pub ip: u32,
        /// Game server port.
        pub port: u16,
    }
}

crate::packet! {
    /// Account characters, sent when entering the select phase.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct Characters => 0x20 {
        /// Four slots, empty ones zeroed.
        pub slots: [CharacterSlot; 4],
        /// Guild of each slot.
        pub guild_ids: [u32; 4],
        /// Guild name of each slot.
        pub guild_names: [FixedString<13>; 4],
    }
}

crate::packet! {
    /// Empire choice for a new account.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EmpireSelect => 0x5A {
        /// Chosen empire.
        pub empire: Empire,
    }
}

crate::packet! {
    /// Guild master adds a player.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GuildAddMember => 0x50 / 0x00 {
        /// Player being added.
        pub player_vid: u32,
    }
}

crate::packet! {
    /// Player leaves their guild.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GuildLeave => 0x50 / 0x05 {}
}

crate::packet! {
    /// Answer to a guild invitation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GuildInviteResponse => 0x50 / 0x0B {
        /// Inviting guild.
        pub guild_id: u32,
        /// Accepted or declined.
        pub wants_to_join: bool,
    }
}

/// Chat line typed by a client. Size counts the whole packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatIncoming {
    /// Channel.
    pub message_type: ChatMessageType,
    /// Text, without terminator.
    pub message: String,
}

impl Packet for ChatIncoming {
    const HEADER: u8 = 0x03;
    const SEQUENCE: bool = true;
    const NAME: &'static str = "ChatIncoming";

    fn describe(shape: &mut ShapeBuilder) {
        shape
            .size_prefix("size", SizeConvention::WholePacket)
            .field::<ChatMessageType>("message_type")
            .dynamic_tail("message");
    }

    fn encode_body(&self, w: &mut WireWriter<'_>) -> Result<(), CodecError> {
        Self::shape().size_value(self.message.len())?.encode(w)?;
        self.message_type.encode(w)?;
        w.write_tail(self.message.as_bytes())?;
        Ok(())
    }

    fn decode_body(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let size = u16::decode(r)?;
        let message_type = ChatMessageType::decode(r)?;
        let message = r.read_tail(Self::shape().tail_len(size)?)?;
        Ok(Self {
            message_type,
            message,
        })
    }

    fn shape() -> &'static PacketShape {
        crate::cached_shape!()
    }

    fn dynamic_len(&self) -> usize {
        self.message.len()
    }
}

/// Chat line delivered to clients. Size counts the whole packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOutgoing {
    /// Channel.
    pub message_type: ChatMessageType,
    /// Speaker, zero for system messages.
    pub vid: u32,
    /// Speaker's empire, zero for system messages.
    pub empire: u8,
    /// Text, without terminator.
    pub message: String,
}

impl Packet for ChatOutgoing {
    const HEADER: u8 = 0x04;
    const NAME: &'static str = "ChatOutgoing";

    fn describe(shape: &mut ShapeBuilder) {
        shape
            .size_prefix("size", SizeConvention::WholePacket)
            .field::<ChatMessageType>("message_type")
            .field::<u32>("vid")
            .field::<u8>("empire")
            .dynamic_tail("message");
    }

    fn encode_body(&self, w: &mut WireWriter<'_>) -> Result<(), CodecError> {
        Self::shape().size_value(self.message.len())?.encode(w)?;
        self.message_type.encode(w)?;
        self.vid.encode(w)?;
        self.empire.encode(w)?;
        w.write_tail(self.message.as_bytes())?;
        Ok(())
    }

    fn decode_body(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let size = u16::decode(r)?;
        let message_type = ChatMessageType::decode(r)?;
        let vid = u32::decode(r)?;
        let empire = u8::decode(r)?;
        let message = r.read_tail(Self::shape().tail_len(size)?)?;
        Ok(Self {
            message_type,
            vid,
            empire,
            message,
        })
    }

    fn shape() -> &'static PacketShape {
        crate::cached_shape!()
    }

    fn dynamic_len(&self) -> usize {
        self.message.len()
    }
}

/// Private message. Size counts the text and its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Whisper {
    /// Recipient (incoming) or sender (outgoing) name.
    pub target: FixedString<25>,
    /// Text, without terminator.
    pub message: String,
}

impl Packet for Whisper {
    const HEADER: u8 = 0x13;
    const NAME: &'static str = "Whisper";

    fn describe(shape: &mut ShapeBuilder) {
        shape
            .size_prefix("size", SizeConvention::TailWithTerminator)
            .field::<FixedString<25>>("target")
            .dynamic_tail("message");
    }

    fn encode_body(&self, w: &mut WireWriter<'_>) -> Result<(), CodecError> {
        Self::shape().size_value(self.message.len())?.encode(w)?;
        self.target.encode(w)?;
        w.write_tail(self.message.as_bytes())?;
        Ok(())
    }

    fn decode_body(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let size = u16::decode(r)?;
        let target = FixedString::decode(r)?;
        let message = r.read_tail(Self::shape().tail_len(size)?)?;
        Ok(Self { target, message })
    }

    fn shape() -> &'static PacketShape {
        crate::cached_shape!()
    }

    fn dynamic_len(&self) -> usize {
        self.message.len()
    }
}

/// Register every packet in this catalog without handlers.
pub fn register_catalog(builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
    builder
        .register::<Handshake>()?
        .register::<GcPhase>()?
        .register::<SelectCharacter>()?
        .register::<LoginRequest>()?
        .register::<Characters>()?
        .register::<EmpireSelect>()?
        .register::<GuildAddMember>()?
        .register::<GuildLeave>()?
        .register::<GuildInviteResponse>()?
        .register::<ChatIncoming>()?
        .register::<ChatOutgoing>()?
        .register::<Whisper>()?;
    Ok(())
}
