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

//! Last-N retention: member-keyed, pair-keyed (double member), and the proof
//! counter-messages sent for dropped older messages.

mod common;

use common::{filter_name, introduce, new_master, TestNode};
use dispersy::core::payload::Payload;
use dispersy::core::types::GlobalTime;
use proptest::prelude::*;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn last_1_keeps_only_the_newest() {
    let master = new_master();
    let mut node = TestNode::new(&master);
    let mut other = TestNode::new(&master);
    introduce(&mut node, &mut other);

    let message = other.create_text("last-1-test", "should be accepted (1)", 10, None);
    node.give_message(&message, &other);
    node.assert_stored(&message);

    // A newer message replaces the stored one.
    let new_message = other.create_text("last-1-test", "should be accepted (2)", 11, None);
    node.give_message(&new_message, &other);
    node.assert_not_stored(&message);
    node.assert_stored(&new_message);

    // An older message is dropped.
    let old_message = other.create_text("last-1-test", "should be dropped (1)", 9, None);
    node.give_message(&old_message, &other);
    node.assert_not_stored(&message);
    node.assert_stored(&new_message);
    node.assert_not_stored(&old_message);

    // As proof for the drop, the newest message is sent back.
    let proofs = filter_name(&node.sent_to(&other), "last-1-test");
    assert_eq!(proofs.len(), 1);
    assert_eq!(proofs[0].global_time, new_message.global_time());
}

#[tokio::test(start_paused = true)]
async fn last_9_retains_the_nine_newest() {
    let master = new_master();
    let mut node = TestNode::new(&master);
    let mut other = TestNode::new(&master);
    introduce(&mut node, &mut other);

    let mut stored: Vec<(GlobalTime, _)> = Vec::new();
    for gt in [21u64, 20, 28, 27, 22, 23, 24, 26, 25] {
        let message = other.create_text("last-9-test", &gt.to_string(), gt, None);
        node.give_message(&message, &other);
        stored.push((gt, message));
    }
    for (_, message) in &stored {
        node.assert_stored(message);
    }

    // Older messages are dropped outright.
    for gt in [11u64, 12, 13, 19, 18, 17] {
        let message = other.create_text("last-9-test", &gt.to_string(), gt, None);
        node.give_message(&message, &other);
        node.assert_not_stored(&message);
    }
    for (_, message) in &stored {
        node.assert_stored(message);
    }

    // Newer messages push out the oldest.
    stored.sort_by_key(|(gt, _)| *gt);
    for gt in [30u64, 35, 37, 31, 32, 34, 33, 36, 38, 45, 44, 43, 42, 41, 40, 39] {
        let message = other.create_text("last-9-test", &gt.to_string(), gt, None);
        node.give_message(&message, &other);
        stored.remove(0);
        stored.push((gt, message));
        stored.sort_by_key(|(gt, _)| *gt);
    }
    node.assert_count("last-9-test", 9);
    for (_, message) in &stored {
        node.assert_stored(message);
    }
}

#[tokio::test(start_paused = true)]
async fn last_1_double_member_keys_by_signer_pair() {
    let master = new_master();
    let mut a = TestNode::new(&master);
    let mut b = TestNode::new(&master);
    let mut c = TestNode::new(&master);
    introduce(&mut a, &mut b);
    introduce(&mut a, &mut c);
    introduce(&mut b, &mut c);

    let mut identifier = 0u32;
    let mut exchange = |a: &mut TestNode, peer: &mut TestNode, text: &str, gt: u64| -> Vec<u8> {
        identifier += 1;
        let submessage = a
            .community
            .create_double_signed_submessage(
                "last-1-doublemember-text",
                Payload::Permit(text.as_bytes().to_vec()),
                peer.community.my_member().mid,
                Some(gt),
            )
            .expect("submessage");
        let request = a
            .community
            .create_signature_request(identifier, submessage, peer.addr)
            .expect("request");
        peer.give_packets(vec![request.packet.clone()], a.addr);
        let responses = peer.sent_to(a);
        let responses = filter_name(&responses, "dispersy-signature-response");
        assert_eq!(responses.len(), 1);
        let Payload::SignatureResponse { packet, .. } = &responses[0].payload else {
            panic!("expected signature-response");
        };
        packet.clone()
    };

    // First generation: AB@10, AC@11.
    let ab10 = exchange(&mut a, &mut b, "Allow=True (1AB)", 10);
    let ac11 = exchange(&mut a, &mut c, "Allow=True (1AC)", 11);
    // Second generation: AB@20, AC@21 (these must survive).
    let ab20 = exchange(&mut a, &mut b, "Allow=True (2AB)", 20);
    let ac21 = exchange(&mut a, &mut c, "Allow=True (2AC)", 21);
    // Duplicate global times and older pairs: all dropped.
    let ab20bis = exchange(&mut a, &mut b, "Allow=True duplicate (2ABbis)", 20);
    let ac21bis = exchange(&mut a, &mut c, "Allow=True duplicate (2ACbis)", 21);
    let ab8 = exchange(&mut a, &mut b, "Allow=True too old (AB)", 8);
    let ac9 = exchange(&mut a, &mut c, "Allow=True too old (AC)", 9);

    let b_addr = b.addr;
    for packet in [ab10, ac11, ab20.clone(), ac21.clone(), ab20bis, ac21bis, ab8, ac9] {
        a.give_packets(vec![packet], b_addr);
    }

    // Exactly two rows remain: {A,B}@20 and {A,C}@21, member1 < member2.
    let meta = a
        .community
        .meta("last-1-doublemember-text")
        .expect("meta");
    let community_id = a.community.database_id();
    let rows = a
        .community
        .database()
        .fetchall(
            "SELECT sync.global_time, double_signed_sync.member1, double_signed_sync.member2
             FROM sync JOIN double_signed_sync ON double_signed_sync.sync = sync.id
             WHERE sync.community = ? AND sync.meta_message = ?
             ORDER BY sync.global_time",
            &[&community_id, &meta.database_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .expect("rows");

    assert_eq!(rows.len(), 2, "one row per signer pair");
    let my_id = a.community.my_member().database_id;
    assert_eq!(rows[0].0, 20);
    assert_eq!(rows[1].0, 21);
    for (_, m1, m2) in &rows {
        assert!(m1 < m2, "pair must be sorted by database id");
        assert!(*m1 == my_id || *m2 == my_id, "A is part of every pair");
    }
    assert_ne!((rows[0].1, rows[0].2), (rows[1].1, rows[1].2));

    assert!(a.community.packet_stored(&ab20).expect("query"));
    assert!(a.community.packet_stored(&ac21).expect("query"));

    // Proofs for the dropped messages went back to the delivering peer.
    let proofs = filter_name(&a.sent_to(&b), "last-1-doublemember-text");
    assert!(!proofs.is_empty());
    for proof in &proofs {
        assert!(proof.global_time == 20 || proof.global_time == 21);
    }
}

#[tokio::test(start_paused = true)]
async fn pending_signature_requests_expire_silently() {
    let master = new_master();
    let mut a = TestNode::new(&master);
    let mut b = TestNode::new(&master);
    introduce(&mut a, &mut b);

    let submessage = a
        .community
        .create_double_signed_submessage(
            "last-1-doublemember-text",
            Payload::Permit(b"never signed".to_vec()),
            b.community.my_member().mid,
            Some(30),
        )
        .expect("submessage");
    let _request = a
        .community
        .create_signature_request(77, submessage, b.addr)
        .expect("request");

    tokio::time::advance(Duration::from_secs(11)).await;
    a.community.on_tick(Instant::now());
    assert_eq!(a.metrics.signature_timeouts_total.get(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Last-N cardinality holds for any arrival order.
    #[test]
    fn last_9_cardinality_invariant(gts in proptest::collection::vec(1u64..200, 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        rt.block_on(async {
            let master = new_master();
            let mut node = TestNode::new(&master);
            let mut other = TestNode::new(&master);
            introduce(&mut node, &mut other);

            let mut max_seen = 0u64;
            for gt in gts {
                let message = other.create_text("last-9-test", &gt.to_string(), gt, None);
                node.give_message(&message, &other);
                max_seen = max_seen.max(gt);

                let count = node.community.stored_count("last-9-test").expect("count");
                assert!(count <= 9, "cardinality exceeded: {count}");

                let times = node.community.stored_global_times("last-9-test").expect("times");
                assert!(times.contains(&max_seen), "newest message must be retained");
            }
        });
    }
}
