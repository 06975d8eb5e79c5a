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
#![allow(dead_code)]

//! Two-node test harness: manual endpoints, in-memory stores, and a debug
//! community schema exercising every distribution policy.

use dispersy::config::CoreConfig;
use dispersy::core::batch::BatchConfig;
use dispersy::core::community::Community;
use dispersy::core::identity::LocalIdentity;
use dispersy::core::member::MemberDirectory;
use dispersy::core::message::{
    packet_signing_bytes, Message, PacketBody, WireAuthentication, WireDestination,
    WireDistribution, WireIdentity, WirePacket,
};
use dispersy::core::payload::Payload;
use dispersy::core::policy::{
    AuthEncoding, Authentication, Destination, Distribution, Resolution, SyncOrder,
};
use dispersy::core::types::{CommunityId, GlobalTime, PublicKey};
use dispersy::monitoring::metrics::Metrics;
use dispersy::networking::endpoint::ManualEndpoint;
use dispersy::store::db::Database;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_PORT: AtomicU16 = AtomicU16::new(20000);

/// One peer: a community over an in-memory store and a manual endpoint.
pub struct TestNode {
    pub community: Community,
    pub endpoint: Arc<ManualEndpoint>,
    pub metrics: Arc<Metrics>,
    pub identity: Arc<LocalIdentity>,
    pub directory: Arc<MemberDirectory>,
    pub addr: SocketAddr,
    pub identity_packet: Vec<u8>,
}

impl TestNode {
    /// Create a node joined to the community anchored at `master`.
    pub fn new(master: &Arc<LocalIdentity>) -> Self {
        let identity = Arc::new(LocalIdentity::generate().expect("identity"));
        Self::with_identity(master, identity)
    }

    /// Create the master node itself (signs with the master key).
    pub fn master_node(master: &Arc<LocalIdentity>) -> Self {
        Self::with_identity(master, master.clone())
    }

    fn with_identity(master: &Arc<LocalIdentity>, identity: Arc<LocalIdentity>) -> Self {
        let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().expect("addr");
        let endpoint = ManualEndpoint::new(addr);
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let db = Arc::new(Database::open_in_memory().expect("db"));
        let directory = Arc::new(MemberDirectory::new(db.clone()));

        let mut community = Community::new(
            master.public_key().clone(),
            identity.clone(),
            db,
            directory.clone(),
            endpoint.clone(),
            metrics.clone(),
            CoreConfig::default(),
        )
        .expect("community");
        register_debug_metas(&mut community);

        let identity_message = community.create_identity().expect("identity message");
        let identity_packet = identity_message.packet.clone();
        community
            .handle_packets(addr, vec![identity_packet.clone()])
            .expect("store identity");

        Self {
            community,
            endpoint,
            metrics,
            identity,
            directory,
            addr,
            identity_packet,
        }
    }

    /// Create a permit-carrying message of a debug meta.
    pub fn create_text(
        &mut self,
        name: &str,
        text: &str,
        global_time: GlobalTime,
        sequence: Option<u64>,
    ) -> Message {
        self.community
            .create_message(name, Payload::Permit(text.as_bytes().to_vec()), Some(global_time), sequence)
            .expect("create message")
    }

    /// Deliver messages as if they arrived from `from`.
    pub fn give_messages(&mut self, messages: &[Message], from: &TestNode) {
        let packets = messages.iter().map(|m| m.packet.clone()).collect();
        self.community
            .handle_packets(from.addr, packets)
            .expect("handle packets");
    }

    /// Deliver one message as if it arrived from `from`.
    pub fn give_message(&mut self, message: &Message, from: &TestNode) {
        self.give_messages(std::slice::from_ref(message), from);
    }

    /// Deliver raw packets as if they arrived from `from_addr`.
    pub fn give_packets(&mut self, packets: Vec<Vec<u8>>, from_addr: SocketAddr) {
        self.community
            .handle_packets(from_addr, packets)
            .expect("handle packets");
    }

    /// Admit our own messages (the local store-and-forward path).
    pub fn store(&mut self, messages: &[Message]) {
        let packets = messages.iter().map(|m| m.packet.clone()).collect();
        self.community
            .handle_packets(self.addr, packets)
            .expect("store own");
    }

    /// Packets this node sent to `other`, in send order.
    pub fn sent_to(&self, other: &TestNode) -> Vec<Vec<u8>> {
        self.endpoint.drain_sent_to(other.addr)
    }

    pub fn assert_stored(&self, message: &Message) {
        assert!(
            self.community.packet_stored(&message.packet).expect("query"),
            "expected message @{} to be stored",
            message.global_time()
        );
    }

    pub fn assert_not_stored(&self, message: &Message) {
        assert!(
            !self.community.packet_stored(&message.packet).expect("query"),
            "expected message @{} to be absent",
            message.global_time()
        );
    }

    pub fn assert_count(&self, meta_name: &str, expected: u64) {
        assert_eq!(
            self.community.stored_count(meta_name).expect("count"),
            expected,
            "stored count mismatch for {meta_name}"
        );
    }
}

/// Learn each other's identities (both directions).
pub fn introduce(a: &mut TestNode, b: &mut TestNode) {
    let b_identity = b.identity_packet.clone();
    let b_addr = b.addr;
    a.give_packets(vec![b_identity], b_addr);
    let a_identity = a.identity_packet.clone();
    let a_addr = a.addr;
    b.give_packets(vec![a_identity], a_addr);
}

/// The debug schema: one meta per policy the suite exercises.
pub fn register_debug_metas(community: &mut Community) {
    let member = Authentication::Member {
        encoding: AuthEncoding::Mid,
    };
    let full_sync = |order| Distribution::FullSync { order };
    let community_dest = Destination::Community { node_count: 10 };

    for (name, order, priority) in [
        ("full-sync-text", SyncOrder::Ascending, None),
        ("sequence-text", SyncOrder::Ascending, None),
        ("ASC-text", SyncOrder::Ascending, None),
        ("DESC-text", SyncOrder::Descending, None),
        ("RANDOM-text", SyncOrder::Random, None),
        ("high-priority-text", SyncOrder::Ascending, Some(200)),
        ("medium-priority-text", SyncOrder::Ascending, Some(128)),
        ("low-priority-text", SyncOrder::Ascending, Some(20)),
    ] {
        community
            .register_meta(
                name,
                member,
                Resolution::Public,
                full_sync(order),
                community_dest,
                None,
                priority,
            )
            .expect("register meta");
    }

    community
        .register_meta(
            "batched-text",
            member,
            Resolution::Public,
            full_sync(SyncOrder::Ascending),
            community_dest,
            Some(BatchConfig {
                max_window: Duration::from_secs(5),
                max_size: 500,
            }),
            None,
        )
        .expect("register batched-text");

    for (name, history) in [("last-1-test", 1), ("last-9-test", 9)] {
        community
            .register_meta(
                name,
                member,
                Resolution::Public,
                Distribution::LastSync {
                    order: SyncOrder::Ascending,
                    history,
                },
                community_dest,
                None,
                None,
            )
            .expect("register last-sync meta");
    }

    community
        .register_meta(
            "last-1-doublemember-text",
            Authentication::DoubleMember,
            Resolution::Public,
            Distribution::LastSync {
                order: SyncOrder::Ascending,
                history: 1,
            },
            community_dest,
            None,
            None,
        )
        .expect("register doublemember meta");
}

/// Decoded view of a sent packet, for assertions.
pub struct SentMessage {
    pub name: String,
    pub global_time: GlobalTime,
    pub sequence_number: Option<u64>,
    pub payload: Payload,
}

/// Parse a wire packet without verification (assertion helper).
pub fn peek(packet: &[u8]) -> SentMessage {
    let wire = WirePacket::decode(packet).expect("wire");
    let body = PacketBody::decode(&wire.body).expect("body");
    SentMessage {
        name: body.meta.clone(),
        global_time: body.distribution.global_time(),
        sequence_number: body.distribution.sequence_number(),
        payload: body.payload,
    }
}

/// Parse every packet in send order.
pub fn peek_all(packets: &[Vec<u8>]) -> Vec<SentMessage> {
    packets.iter().map(|p| peek(p)).collect()
}

/// Packets of one meta name, in order.
pub fn filter_name(packets: &[Vec<u8>], name: &str) -> Vec<SentMessage> {
    peek_all(packets).into_iter().filter(|m| m.name == name).collect()
}

/// Hand-build a signed full-sync packet outside the public API (a peer that
/// does not respect the permission rules).
pub fn forge_full_sync(
    author: &LocalIdentity,
    community: CommunityId,
    name: &str,
    payload: Payload,
    global_time: GlobalTime,
    sequence_number: u64,
) -> Vec<u8> {
    let body = PacketBody {
        meta: name.to_string(),
        authentication: WireAuthentication::Member(WireIdentity::Mid(author.mid())),
        distribution: WireDistribution::FullSync {
            global_time,
            sequence_number,
        },
        destination: WireDestination::Community,
        payload,
    };
    let body_bytes = body.encode().expect("encode body");
    let signing = packet_signing_bytes(&community, &body_bytes);
    let wire = WirePacket {
        community,
        body: body_bytes,
        signatures: vec![author.sign(&signing)],
    };
    wire.encode().expect("encode packet")
}

/// A community id derived from a master key (assertion helper).
pub fn community_id_of(master: &LocalIdentity) -> CommunityId {
    CommunityId::from_bytes(*dispersy::core::identity::mid_of(master.public_key()).as_bytes())
}

/// Fresh master identity for one test.
pub fn new_master() -> Arc<LocalIdentity> {
    Arc::new(LocalIdentity::generate().expect("master"))
}

/// Public key helper.
pub fn key_of(identity: &LocalIdentity) -> PublicKey {
    identity.public_key().clone()
}
