//! Fuzz-style property tests for the wire codec and frame reader.
//!
//! Decoders must survive arbitrary network input, and every catalog packet
//! must survive an encode/decode cycle unchanged.

use emberlink_net::protocol::{
    register_catalog, ChatIncoming, ChatMessageType, GuildInviteResponse, Handshake,
    LoginRequest, SelectCharacter, Whisper,
};
use emberlink_net::{decode, encode, FixedString, FrameReader, PacketRegistry};
use proptest::prelude::*;
use std::sync::Arc;

fn registry() -> Arc<PacketRegistry> {
    let mut builder = PacketRegistry::builder();
    register_catalog(&mut builder).expect("catalog registers");
    Arc::new(builder.build())
}

/// Drain a frame reader over `bytes`, returning how many packets it produced.
fn drain(bytes: Vec<u8>, capacity: usize) -> usize {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        let mut frames = FrameReader::new(std::io::Cursor::new(bytes), registry(), capacity);
        let mut count = 0;
        while let Ok(Some(_)) = frames.next_packet().await {
            count += 1;
        }
        count
    })
}

fn ascii(max: usize) -> impl Strategy<Value = String> {
    prop::collection::vec(0x20u8..0x7F, 0..=max)
        .prop_map(|bytes| bytes.into_iter().map(char::from).collect())
}

fn chat_type() -> impl Strategy<Value = ChatMessageType> {
    prop_oneof![
        Just(ChatMessageType::Normal),
        Just(ChatMessageType::Party),
        Just(ChatMessageType::Guild),
        Just(ChatMessageType::Shout),
        Just(ChatMessageType::Big),
    ]
}

proptest! {
    /// Property: arbitrary bytes never panic the frame reader
    #[test]
    fn arbitrary_bytes_dont_crash_frame_reader(
        random_bytes in prop::collection::vec(any::<u8>(), 0..2000),
        capacity in 0usize..512,
    ) {
        let _packets = drain(random_bytes, capacity);
    }

    /// Property: arbitrary bytes never panic a single-packet decoder
    #[test]
    fn arbitrary_bytes_dont_crash_decoders(
        random_bytes in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let _ = decode::<LoginRequest>(&random_bytes);
        let _ = decode::<ChatIncoming>(&random_bytes);
        let _ = decode::<Whisper>(&random_bytes);
        let _ = decode::<GuildInviteResponse>(&random_bytes);
    }

    /// Property: handshake packets roundtrip
    #[test]
    fn handshake_roundtrips(handshake in any::<u32>(), time in any::<u32>(), delta in any::<u32>()) {
        let packet = Handshake { handshake, time, delta };
        let encoded = encode(&packet).unwrap();
        prop_assert_eq!(encoded.len(), 13);
        prop_assert_eq!(decode::<Handshake>(&encoded).unwrap(), packet);
    }

    /// Property: fixed strings roundtrip at any length up to their width
    #[test]
    fn login_roundtrips(
        username in ascii(31),
        password in ascii(17),
        encrypt_key in any::<[u32; 4]>(),
    ) {
        let packet = LoginRequest {
            username: FixedString::new(username).unwrap(),
            password: FixedString::new(password).unwrap(),
            encrypt_key,
        };
        let encoded = encode(&packet).unwrap();
        prop_assert_eq!(decode::<LoginRequest>(&encoded).unwrap(), packet);
    }

    /// Property: dynamic packets roundtrip and the reader frames them by size
    #[test]
    fn chat_stream_roundtrips(
        messages in prop::collection::vec((chat_type(), ascii(200)), 1..8),
    ) {
        let packets: Vec<ChatIncoming> = messages
            .into_iter()
            .map(|(message_type, message)| ChatIncoming { message_type, message })
            .collect();
        let mut stream = Vec::new();
        for packet in &packets {
            stream.extend(encode(packet).unwrap());
        }
        prop_assert_eq!(drain(stream, 4096), packets.len());
    }

    /// Property: guild invite responses roundtrip for every id
    #[test]
    fn guild_invite_roundtrips(guild_id in any::<u32>(), wants_to_join in any::<bool>()) {
        let packet = GuildInviteResponse { guild_id, wants_to_join };
        let encoded = encode(&packet).unwrap();
        prop_assert_eq!(encoded[..2].to_vec(), vec![0x50, 0x0B]);
        prop_assert_eq!(decode::<GuildInviteResponse>(&encoded).unwrap(), packet);
    }
}

#[test]
fn select_character_scenario() {
    let packet = decode::<SelectCharacter>(&[0x06, 0x03]).unwrap();
    assert_eq!(packet, SelectCharacter { slot: 3 });
    assert_eq!(encode(&packet).unwrap(), vec![0x06, 0x03]);
}

#[test]
fn guild_invite_scenario() {
    let id = 0xCAFE_u32.to_le_bytes();
    let bytes = [0x50, 0x0B, id[0], id[1], id[2], id[3], 0x01];
    let packet = decode::<GuildInviteResponse>(&bytes).unwrap();
    assert_eq!(
        packet,
        GuildInviteResponse {
            guild_id: 0xCAFE,
            wants_to_join: true
        }
    );
}

#[test]
fn whisper_with_fixed_target_frames_correctly() {
    let whisper = Whisper {
        target: FixedString::new("Mira").unwrap(),
        message: "meet at the gate".to_owned(),
    };
    let mut stream = encode(&whisper).unwrap();
    stream.extend(encode(&SelectCharacter { slot: 0 }).unwrap());
    assert_eq!(drain(stream, 4096), 2);
}
