//! End-to-end connection tests over in-memory duplex streams and loopback TCP.

use anyhow::Result;
use async_trait::async_trait;
use emberlink_core::{ManualClock, ServerMode};
use emberlink_net::protocol::{
    register_catalog, ChatMessageType, ChatOutgoing, GcPhase, GuildLeave, Handshake, Phase,
    SelectCharacter,
};
use emberlink_net::{encode, AnyPacket, FrameReader, HeaderKey, Packet, PacketRegistry};
use emberlink_server::{
    CloseReason, Connection, ConnectionHooks, NetConfig, PacketContext, PacketHandler, Server,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

const STEP: Duration = Duration::from_secs(2);

/// Replies to slot selection with a chat line; slot 9 fails the handler and
/// slot 13 panics in it.
struct SelectHandler;

#[async_trait]
impl PacketHandler<SelectCharacter> for SelectHandler {
    async fn handle(&self, ctx: &mut PacketContext<SelectCharacter>) -> Result<()> {
        let (connection, packet) = ctx.parts()?;
        anyhow::ensure!(packet.slot != 9, "slot {} does not exist", packet.slot);
        if packet.slot == 13 {
            panic!("slot 13 is haunted");
        }
        connection.send(ChatOutgoing {
            message_type: ChatMessageType::Info,
            vid: 0,
            empire: 0,
            message: format!("slot {}", packet.slot),
        })?;
        Ok(())
    }
}

#[derive(Default)]
struct RecordingHooks {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    handshakes: AtomicUsize,
    received: AtomicUsize,
    handled: AtomicUsize,
    sending: AtomicUsize,
    sent: AtomicUsize,
}

impl ConnectionHooks for RecordingHooks {
    fn on_connected(&self, _connection: &Connection) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self, _connection: &Connection, _reason: CloseReason) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_handshake_finished(&self, _connection: &Arc<Connection>) {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
    }

    fn pre_packet_received(&self, _connection: &Connection, _packet: &dyn AnyPacket) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }

    fn post_packet_received(&self, _connection: &Connection, _key: HeaderKey) {
        self.handled.fetch_add(1, Ordering::SeqCst);
    }

    fn pre_packet_sent(&self, _connection: &Connection, _packet: &dyn AnyPacket) {
        self.sending.fetch_add(1, Ordering::SeqCst);
    }

    fn post_packet_sent(&self, _connection: &Connection, _key: HeaderKey, _bytes: usize) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    server: Server,
    clock: Arc<ManualClock>,
    hooks: Arc<RecordingHooks>,
}

fn harness(mode: ServerMode) -> Harness {
    let clock = Arc::new(ManualClock::new(10_000));
    let hooks = Arc::new(RecordingHooks::default());
    let config = NetConfig {
        mode,
        max_handshake_attempts: 4,
        ..NetConfig::default()
    };
    let mut builder = Server::builder(config)
        .with_clock(clock.clone())
        .with_hooks(hooks.clone());
    builder
        .handle::<SelectCharacter, _, _>(|| SelectHandler)
        .expect("register select")
        .packet::<GuildLeave>()
        .expect("register guild leave")
        .packet::<ChatOutgoing>()
        .expect("register chat");
    let server = builder.build().expect("server builds");
    Harness {
        server,
        clock,
        hooks,
    }
}

fn client_registry() -> Arc<PacketRegistry> {
    let mut builder = PacketRegistry::builder();
    register_catalog(&mut builder).expect("catalog registers");
    Arc::new(builder.build())
}

/// The other end of a connection, speaking the wire protocol directly.
struct Client<S> {
    frames: FrameReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite> Client<S> {
    fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            frames: FrameReader::new(reader, client_registry(), 4096),
            writer,
        }
    }

    async fn next(&mut self) -> Option<Box<dyn AnyPacket>> {
        tokio::time::timeout(STEP, self.frames.next_packet())
            .await
            .expect("server answered in time")
            .expect("server sent a valid frame")
    }

    async fn expect<P: Packet + Clone>(&mut self) -> P {
        let packet = self.next().await.expect("stream still open");
        packet
            .downcast_ref::<P>()
            .cloned()
            .unwrap_or_else(|| panic!("expected {}, got {:?}", P::NAME, packet))
    }

    async fn send<P: Packet>(&mut self, packet: &P) {
        self.send_raw(&encode(packet).expect("encode")).await;
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
        self.writer.flush().await.expect("flush");
    }

    async fn expect_eof(&mut self) {
        let next = tokio::time::timeout(STEP, self.frames.next_packet())
            .await
            .expect("server closed in time");
        assert!(matches!(next, Ok(None) | Err(_)), "expected close, got {next:?}");
    }

    /// Read the opening phase and handshake packets.
    async fn open(&mut self) -> Handshake {
        let phase = self.expect::<GcPhase>().await;
        assert_eq!(phase.phase, Phase::Handshake);
        self.expect::<Handshake>().await
    }

    /// Open and converge in one round trip.
    async fn login(&mut self) {
        let request = self.open().await;
        self.send(&Handshake {
            handshake: request.handshake,
            time: request.time,
            delta: 0,
        })
        .await;
        self.expect::<GcPhase>().await;
    }
}

async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(STEP, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn handshake_converges_into_login_phase() {
    let h = harness(ServerMode::Game);
    let (client_side, server_side) = tokio::io::duplex(4096);
    let (connection, _task) = h.server.attach(server_side, None);
    let mut client = Client::new(client_side);

    let request = client.open().await;
    assert_eq!(request.delta, 0);
    assert_eq!(request.time, 10_000);
    assert!(connection.is_handshaking());

    h.clock.advance(20);
    client
        .send(&Handshake {
            handshake: request.handshake,
            time: request.time,
            delta: 0,
        })
        .await;

    let phase = client.expect::<GcPhase>().await;
    assert_eq!(phase.phase, Phase::Login);
    assert_eq!(connection.phase(), Phase::Login);
    assert!(!connection.is_handshaking());
    wait_for(|| h.hooks.handshakes.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn auth_mode_enters_auth_phase() {
    let h = harness(ServerMode::Auth);
    let (client_side, server_side) = tokio::io::duplex(4096);
    let (connection, _task) = h.server.attach(server_side, None);
    let mut client = Client::new(client_side);

    client.login().await;
    assert_eq!(connection.phase(), Phase::Auth);
}

#[tokio::test]
async fn slow_reply_triggers_resend() {
    let h = harness(ServerMode::Game);
    let (client_side, server_side) = tokio::io::duplex(4096);
    let (_connection, _task) = h.server.attach(server_side, None);
    let mut client = Client::new(client_side);

    let request = client.open().await;
    h.clock.advance(200);
    client
        .send(&Handshake {
            handshake: request.handshake,
            time: request.time,
            delta: 0,
        })
        .await;

    let resend = client.expect::<Handshake>().await;
    assert_eq!(resend.handshake, request.handshake);
    assert_eq!(resend.time, 10_200);
    assert_eq!(resend.delta, 100);

    h.clock.advance(200);
    client
        .send(&Handshake {
            handshake: resend.handshake,
            time: resend.time + resend.delta,
            delta: resend.delta,
        })
        .await;
    assert_eq!(client.expect::<GcPhase>().await.phase, Phase::Login);
}

#[tokio::test]
async fn nonce_mismatch_closes_connection() {
    let h = harness(ServerMode::Game);
    let (client_side, server_side) = tokio::io::duplex(4096);
    let (connection, task) = h.server.attach(server_side, None);
    let mut client = Client::new(client_side);

    let request = client.open().await;
    client
        .send(&Handshake {
            handshake: request.handshake.wrapping_add(1),
            time: request.time,
            delta: 0,
        })
        .await;

    client.expect_eof().await;
    tokio::time::timeout(STEP, task).await.expect("task ends").expect("task ok");
    assert_eq!(connection.close_reason(), Some(CloseReason::ProtocolViolation));
    assert_eq!(h.server.connection_count(), 0);
}

#[tokio::test]
async fn handshake_attempt_cap_closes_connection() {
    let h = harness(ServerMode::Game);
    let (client_side, server_side) = tokio::io::duplex(4096);
    let (connection, _task) = h.server.attach(server_side, None);
    let mut client = Client::new(client_side);

    let request = client.open().await;
    let stale = Handshake {
        handshake: request.handshake,
        time: 0,
        delta: 0,
    };
    for _ in 0..3 {
        client.send(&stale).await;
        client.expect::<Handshake>().await;
    }
    client.send(&stale).await;
    client.expect_eof().await;
    assert_eq!(connection.close_reason(), Some(CloseReason::ProtocolViolation));
}

#[tokio::test]
async fn unknown_header_closes_only_that_connection() {
    let h = harness(ServerMode::Game);

    let (bad_side, bad_server) = tokio::io::duplex(4096);
    let (bad, _bad_task) = h.server.attach(bad_server, None);
    let mut bad_client = Client::new(bad_side);

    let (good_side, good_server) = tokio::io::duplex(4096);
    let (good, _good_task) = h.server.attach(good_server, None);
    let mut good_client = Client::new(good_side);

    bad_client.open().await;
    bad_client.send_raw(&[0xEE, 0x01, 0x02]).await;
    bad_client.expect_eof().await;
    assert_eq!(bad.close_reason(), Some(CloseReason::ProtocolViolation));

    good_client.login().await;
    assert!(!good.is_closed());
    wait_for(|| h.server.connection_count() == 1).await;
    assert!(h.server.connection(good.id()).is_some());
    assert!(h.server.connection(bad.id()).is_none());
}

#[tokio::test]
async fn handler_error_closes_connection() {
    let h = harness(ServerMode::Game);
    let (client_side, server_side) = tokio::io::duplex(4096);
    let (connection, _task) = h.server.attach(server_side, None);
    let mut client = Client::new(client_side);

    client.login().await;
    client.send(&SelectCharacter { slot: 9 }).await;
    client.expect_eof().await;
    assert_eq!(connection.close_reason(), Some(CloseReason::HandlerFailed));
}

#[tokio::test]
async fn handler_panic_closes_and_releases_connection() {
    let h = harness(ServerMode::Game);
    let (client_side, server_side) = tokio::io::duplex(4096);
    let (connection, task) = h.server.attach(server_side, None);
    let mut client = Client::new(client_side);

    client.login().await;
    client.send(&SelectCharacter { slot: 13 }).await;
    client.expect_eof().await;

    tokio::time::timeout(STEP, task)
        .await
        .expect("task ends")
        .expect("panic stays inside the connection");
    assert_eq!(connection.close_reason(), Some(CloseReason::HandlerFailed));
    assert_eq!(h.hooks.disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(h.server.connection_count(), 0);
}

#[tokio::test]
async fn close_releases_connection_whose_peer_stopped_reading() {
    let h = harness(ServerMode::Game);
    let (client_side, server_side) = tokio::io::duplex(64);
    let (connection, task) = h.server.attach(server_side, None);

    for vid in 0..100u32 {
        connection
            .send(ChatOutgoing {
                message_type: ChatMessageType::Normal,
                vid,
                empire: 0,
                message: "y".repeat(100),
            })
            .expect("queued");
    }
    // Let the writer fill the pipe and block on it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.server.connection_count(), 1);

    connection.close(CloseReason::Requested);
    tokio::time::timeout(STEP, task)
        .await
        .expect("task ends while the peer is stalled")
        .expect("task ok");
    assert_eq!(h.server.connection_count(), 0);
    assert_eq!(connection.close_reason(), Some(CloseReason::Requested));
    drop(client_side);
}

#[tokio::test]
async fn missing_handler_keeps_connection_open() {
    let h = harness(ServerMode::Game);
    let (client_side, server_side) = tokio::io::duplex(4096);
    let (connection, _task) = h.server.attach(server_side, None);
    let mut client = Client::new(client_side);

    client.login().await;
    client.send(&GuildLeave {}).await;
    client.send(&SelectCharacter { slot: 2 }).await;

    let reply = client.expect::<ChatOutgoing>().await;
    assert_eq!(reply.message, "slot 2");
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn concurrent_senders_produce_whole_frames() {
    let h = harness(ServerMode::Game);
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (connection, _task) = h.server.attach(server_side, None);
    let mut client = Client::new(client_side);
    client.open().await;

    let senders: Vec<_> = (0..4)
        .map(|_| {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                for i in 0..25u32 {
                    connection
                        .send(ChatOutgoing {
                            message_type: ChatMessageType::Normal,
                            vid: i,
                            empire: 0,
                            message: "x".repeat(i as usize),
                        })
                        .expect("queued");
                }
            })
        })
        .collect();
    for sender in senders {
        sender.await.expect("sender task");
    }

    // Concurrent senders never interleave bytes of different frames.
    let mut seen = [0u32; 25];
    for _ in 0..100 {
        let chat = client.expect::<ChatOutgoing>().await;
        assert_eq!(chat.message.len(), chat.vid as usize);
        seen[chat.vid as usize] += 1;
    }
    assert!(seen.iter().all(|&count| count == 4));
}

#[tokio::test]
async fn single_sender_order_is_preserved() {
    let h = harness(ServerMode::Game);
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (connection, _task) = h.server.attach(server_side, None);
    let mut client = Client::new(client_side);
    client.open().await;

    for vid in 0..50u32 {
        connection
            .send(ChatOutgoing {
                message_type: ChatMessageType::Normal,
                vid,
                empire: 1,
                message: format!("line {vid}"),
            })
            .expect("queued");
    }
    for vid in 0..50u32 {
        assert_eq!(client.expect::<ChatOutgoing>().await.vid, vid);
    }
}

#[tokio::test]
async fn hooks_observe_the_whole_lifecycle() {
    let h = harness(ServerMode::Game);
    let (client_side, server_side) = tokio::io::duplex(4096);
    let (connection, task) = h.server.attach(server_side, None);
    let mut client = Client::new(client_side);

    client.login().await;
    client.send(&SelectCharacter { slot: 1 }).await;
    client.expect::<ChatOutgoing>().await;

    connection.close(CloseReason::Requested);
    connection.close(CloseReason::Requested);
    tokio::time::timeout(STEP, task).await.expect("task ends").expect("task ok");

    let hooks = &h.hooks;
    assert_eq!(hooks.connected.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.handshakes.load(Ordering::SeqCst), 1);
    // handshake reply + select
    assert_eq!(hooks.received.load(Ordering::SeqCst), 2);
    assert_eq!(hooks.handled.load(Ordering::SeqCst), 2);
    // phase, handshake, phase, chat
    assert_eq!(hooks.sending.load(Ordering::SeqCst), 4);
    assert_eq!(hooks.sent.load(Ordering::SeqCst), 4);
    assert_eq!(connection.close_reason(), Some(CloseReason::Requested));
}

#[tokio::test]
async fn peer_disconnect_closes_as_unexpected() {
    let h = harness(ServerMode::Game);
    let (client_side, server_side) = tokio::io::duplex(4096);
    let (connection, task) = h.server.attach(server_side, None);
    let mut client = Client::new(client_side);

    client.open().await;
    drop(client);
    tokio::time::timeout(STEP, task).await.expect("task ends").expect("task ok");
    assert_eq!(connection.close_reason(), Some(CloseReason::Unexpected));
    assert_eq!(h.hooks.disconnected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn broadcast_reaches_every_open_connection() {
    let h = harness(ServerMode::Game);
    let mut clients = Vec::new();
    for _ in 0..3 {
        let (client_side, server_side) = tokio::io::duplex(4096);
        h.server.attach(server_side, None);
        let mut client = Client::new(client_side);
        client.open().await;
        clients.push(client);
    }

    let notice = ChatOutgoing {
        message_type: ChatMessageType::Notice,
        vid: 0,
        empire: 0,
        message: "maintenance in 5 minutes".to_owned(),
    };
    assert_eq!(h.server.broadcast(&notice), 3);
    for client in &mut clients {
        assert_eq!(client.expect::<ChatOutgoing>().await, notice);
    }
}

#[tokio::test]
async fn tcp_accept_loop_serves_and_shuts_down() {
    let h = harness(ServerMode::Game);
    let listener = Server::bind("127.0.0.1:0".parse().expect("addr"))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = h.server.clone();
    let accept = tokio::spawn(async move { server.run(listener).await });

    let stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    let mut client = Client::new(stream);
    client.login().await;
    wait_for(|| h.server.connection_count() == 1).await;

    h.server.shutdown();
    client.expect_eof().await;
    tokio::time::timeout(STEP, accept)
        .await
        .expect("accept loop stops")
        .expect("accept task")
        .expect("accept loop ok");
    wait_for(|| h.server.connection_count() == 0).await;
}
