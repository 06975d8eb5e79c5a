// Copyright (c) 2026 Dispersy
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Decoder round trips and failure classification.

mod common;

use common::{new_master, TestNode};
use dispersy::core::codec::{decode_packet, Decoded, DelayReason, DropReason};
use dispersy::core::member::MemberDirectory;
use dispersy::core::message::WirePacket;
use dispersy::core::types::{encode_canonical, MAX_PACKET_BYTES};
use dispersy::store::db::Database;
use proptest::prelude::*;
use std::sync::Arc;

fn decode_with(node: &TestNode, packet: &[u8]) -> Decoded {
    let community = &node.community;
    let lookup = |name: &str| community.meta(name);
    decode_packet(&community.id(), &lookup, &node.directory, packet).expect("decode")
}

#[tokio::test(start_paused = true)]
async fn garbage_is_malformed() {
    let master = new_master();
    let node = TestNode::new(&master);
    let Decoded::Drop(reason) = decode_with(&node, b"not a packet") else {
        panic!("garbage must drop");
    };
    assert_eq!(reason, DropReason::Malformed);
}

#[tokio::test(start_paused = true)]
async fn tampered_signature_drops() {
    let master = new_master();
    let mut node = TestNode::new(&master);
    let message = node.create_text("full-sync-text", "payload", 10, Some(1));

    let mut wire = WirePacket::decode(&message.packet).expect("wire");
    wire.signatures[0].0[0] ^= 0x01;
    let tampered = encode_canonical(&wire).expect("encode");

    let Decoded::Drop(reason) = decode_with(&node, &tampered) else {
        panic!("tampered packet must drop");
    };
    assert_eq!(reason, DropReason::BadSignature);
}

#[tokio::test(start_paused = true)]
async fn unknown_signer_delays() {
    let master = new_master();
    let node = TestNode::new(&master);
    let mut stranger = TestNode::new(&master);

    // `node` never learned the stranger's key.
    let message = stranger.create_text("full-sync-text", "who?", 10, Some(1));

    let Decoded::Delay(reason) = decode_with(&node, &message.packet) else {
        panic!("unknown signer must delay");
    };
    assert!(matches!(reason, DelayReason::MissingMember { .. }));
}

#[tokio::test(start_paused = true)]
async fn wire_policy_mismatch_is_forbidden() {
    let master = new_master();
    let mut node = TestNode::new(&master);
    // A last-sync packet claiming a full-sync distribution header.
    let message = node.create_text("full-sync-text", "payload", 10, Some(1));
    let mut wire = WirePacket::decode(&message.packet).expect("wire");

    // Graft the body of a different meta under the same signature: the
    // signature no longer matches, but the header check fires first when the
    // distribution variant disagrees with the registered policy.
    let mut body = dispersy::core::message::PacketBody::decode(&wire.body).expect("body");
    body.meta = "last-1-test".to_string();
    wire.body = body.encode().expect("encode body");
    let forged = encode_canonical(&wire).expect("encode");

    let Decoded::Drop(reason) = decode_with(&node, &forged) else {
        panic!("policy mismatch must drop");
    };
    assert_eq!(reason, DropReason::ForbiddenPolicy);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// decode(encode(m)) == m for well-formed messages.
    #[test]
    fn round_trip_preserves_every_field(
        text in "[a-zA-Z0-9 ]{0,64}",
        global_time in 2u64..1_000_000,
        seq in 1u64..1_000,
        full_sync in any::<bool>(),
    ) {
        let master = new_master();
        let mut node = TestNode::new(&master);
        let name = if full_sync { "full-sync-text" } else { "last-1-test" };
        let sequence = if full_sync { Some(seq) } else { None };
        let message = node.create_text(name, &text, global_time, sequence);

        let decoded = decode_with(&node, &message.packet);
        let Decoded::Message(back) = decoded else {
            panic!("well-formed message must decode");
        };

        prop_assert_eq!(back.name(), name);
        prop_assert_eq!(back.global_time(), global_time);
        prop_assert_eq!(back.sequence_number(), sequence);
        prop_assert_eq!(&back.payload, &message.payload);
        prop_assert_eq!(&back.distribution, &message.distribution);
        prop_assert_eq!(&back.destination, &message.destination);
        prop_assert_eq!(back.author().map(|m| m.mid), message.author().map(|m| m.mid));
        prop_assert_eq!(&back.packet, &message.packet);
    }
}

#[tokio::test(start_paused = true)]
async fn oversized_packets_never_decode() {
    let db = Arc::new(Database::open_in_memory().expect("db"));
    let directory = MemberDirectory::new(db);
    let master = new_master();
    let node = TestNode::new(&master);
    let community = &node.community;
    let lookup = |name: &str| community.meta(name);

    let blob = vec![0u8; MAX_PACKET_BYTES + 1];
    let decoded = decode_packet(&community.id(), &lookup, &directory, &blob).expect("decode");
    assert!(matches!(decoded, Decoded::Drop(DropReason::Malformed)));
}
