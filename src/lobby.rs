//! Login and lobby handlers: the packets a client sends between the
//! handshake and entering the world.

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use emberlink_net::protocol::{
    CharacterSlot, Characters, ChatIncoming, ChatMessageType, ChatOutgoing, EmpireSelect,
    GuildAddMember, GuildInviteResponse, GuildLeave, LoginRequest, Phase, SelectCharacter, Whisper,
};
use emberlink_net::{FixedString, RegistryError};
use emberlink_server::{
    CloseReason, Connection, ConnectionHooks, PacketContext, PacketHandler, PacketModule,
    ServerBuilder,
};
use std::sync::Arc;
use tracing::{debug, info};

const SLOT_COUNT: u8 = 4;

/// Registers the lobby packets and their handlers.
#[derive(Debug, Default, Clone, Copy)]
pub struct LobbyModule;

impl PacketModule for LobbyModule {
    fn install(&self, server: &mut ServerBuilder) -> Result<(), RegistryError> {
        server
            .handle::<LoginRequest, _, _>(|| LoginHandler)?
            .handle::<SelectCharacter, _, _>(|| SelectHandler)?
            .handle::<EmpireSelect, _, _>(|| EmpireHandler)?
            .handle::<ChatIncoming, _, _>(|| ChatHandler)?
            .handle::<Whisper, _, _>(|| WhisperHandler)?
            .handle::<GuildInviteResponse, _, _>(|| GuildInviteHandler)?
            .packet::<Characters>()?
            .packet::<ChatOutgoing>()?
            .packet::<GuildAddMember>()?
            .packet::<GuildLeave>()?;
        Ok(())
    }
}

/// Logs session milestones that the transport itself does not.
#[derive(Debug, Default)]
pub struct SessionLog;

impl ConnectionHooks for SessionLog {
    fn on_connected(&self, connection: &Connection) {
        debug!(connection = %connection.id(), peer = ?connection.peer(), "client connected");
    }

    fn on_handshake_finished(&self, connection: &Arc<Connection>) {
        info!(connection = %connection.id(), phase = ?connection.phase(), "clock synchronised");
    }

    fn on_disconnected(&self, connection: &Connection, reason: CloseReason) {
        debug!(connection = %connection.id(), ?reason, "client gone");
    }
}

fn system_message(message: impl Into<String>) -> ChatOutgoing {
    ChatOutgoing {
        message_type: ChatMessageType::Info,
        vid: 0,
        empire: 0,
        message: message.into(),
    }
}

struct LoginHandler;

#[async_trait]
impl PacketHandler<LoginRequest> for LoginHandler {
    async fn handle(&self, ctx: &mut PacketContext<LoginRequest>) -> Result<()> {
        let (connection, request) = ctx.parts()?;
        ensure!(!request.username.is_empty(), "login without a username");
        // Auth servers enter Auth after the handshake, game servers Login.
        ensure!(
            matches!(connection.phase(), Phase::Auth | Phase::Login),
            "login request in phase {:?}",
            connection.phase()
        );

        let name = FixedString::new(request.username.as_str())
            .with_context(|| format!("username {} does not fit a character name", request.username.as_str()))?;
        let mut characters = Characters::default();
        characters.slots[0] = CharacterSlot {
            id: 1,
            name,
            level: 1,
            ..CharacterSlot::default()
        };
        info!(connection = %connection.id(), user = request.username.as_str(), "login accepted");
        connection.send(characters)?;
        connection.set_phase(Phase::Select);
        Ok(())
    }
}

struct SelectHandler;

#[async_trait]
impl PacketHandler<SelectCharacter> for SelectHandler {
    async fn handle(&self, ctx: &mut PacketContext<SelectCharacter>) -> Result<()> {
        let (connection, packet) = ctx.parts()?;
        ensure!(packet.slot < SLOT_COUNT, "slot {} out of range", packet.slot);
        ensure!(
            connection.phase() == Phase::Select,
            "character selected in phase {:?}",
            connection.phase()
        );
        connection.set_phase(Phase::Loading);
        Ok(())
    }
}

struct EmpireHandler;

#[async_trait]
impl PacketHandler<EmpireSelect> for EmpireHandler {
    async fn handle(&self, ctx: &mut PacketContext<EmpireSelect>) -> Result<()> {
        let (connection, packet) = ctx.parts()?;
        debug!(connection = %connection.id(), empire = ?packet.empire, "empire chosen");
        connection.send(*packet)?;
        Ok(())
    }
}

/// Echoes chat back to the speaker.
struct ChatHandler;

#[async_trait]
impl PacketHandler<ChatIncoming> for ChatHandler {
    async fn handle(&self, ctx: &mut PacketContext<ChatIncoming>) -> Result<()> {
        let connection = ctx.connection().cloned().context("chat without a connection")?;
        let chat = ctx.take_packet().context("chat packet already taken")?;
        connection.send(ChatOutgoing {
            message_type: chat.message_type,
            vid: 0,
            empire: 0,
            message: chat.message,
        })?;
        Ok(())
    }
}

/// No player directory lives here, so every recipient is offline.
struct WhisperHandler;

#[async_trait]
impl PacketHandler<Whisper> for WhisperHandler {
    async fn handle(&self, ctx: &mut PacketContext<Whisper>) -> Result<()> {
        let (connection, whisper) = ctx.parts()?;
        connection.send(system_message(format!("{} is not online.", whisper.target.as_str())))?;
        Ok(())
    }
}

struct GuildInviteHandler;

#[async_trait]
impl PacketHandler<GuildInviteResponse> for GuildInviteHandler {
    async fn handle(&self, ctx: &mut PacketContext<GuildInviteResponse>) -> Result<()> {
        let (connection, response) = ctx.parts()?;
        info!(
            connection = %connection.id(),
            guild = response.guild_id,
            accepted = response.wants_to_join,
            "guild invite answered"
        );
        Ok(())
    }
}
