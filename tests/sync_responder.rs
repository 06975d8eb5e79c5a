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

//! The sync responder: range and modulo selection, bloom suppression, and
//! the ordering/priority policies.

mod common;

use common::{filter_name, introduce, new_master, TestNode};
use dispersy::core::bloom::BloomFilter;
use dispersy::core::payload::SyncRequest;
use dispersy::store::db::Database;
use dispersy::store::messages;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn empty_sync(time_low: u64, time_high: u64, modulo: u64, offset: u64) -> SyncRequest {
    SyncRequest {
        time_low,
        time_high,
        modulo,
        offset,
        bloom: BloomFilter::empty(),
    }
}

fn ask(node: &mut TestNode, other: &mut TestNode, sync: SyncRequest) -> Vec<Vec<u8>> {
    let request = node
        .community
        .create_introduction_request(other.addr, 42, Some(sync))
        .expect("introduction request");
    other.give_message(&request, node);
    other.sent_to(node)
}

#[tokio::test(start_paused = true)]
async fn modulo_selects_congruent_global_times() {
    let master = new_master();
    let mut node = TestNode::new(&master);
    let mut other = TestNode::new(&master);
    introduce(&mut node, &mut other);

    let messages: Vec<_> = (0u64..30)
        .enumerate()
        .map(|(i, _)| {
            let gt = i as u64 + 10;
            other.create_text("full-sync-text", &format!("m{gt}"), gt, Some(i as u64 + 1))
        })
        .collect();
    other.store(&messages);
    other.sent_to(&node);

    for modulo in 1u64..10 {
        for offset in 0..modulo {
            let expected: Vec<u64> = messages
                .iter()
                .map(|m| m.global_time())
                .filter(|gt| (gt + offset) % modulo == 0)
                .collect();

            let sent = ask(&mut node, &mut other, empty_sync(1, 0, modulo, offset));
            let got: Vec<u64> = filter_name(&sent, "full-sync-text")
                .iter()
                .map(|m| m.global_time)
                .collect();
            assert_eq!(got, expected, "modulo {modulo} offset {offset}");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn range_bounds_are_inclusive() {
    let master = new_master();
    let mut node = TestNode::new(&master);
    let mut other = TestNode::new(&master);
    introduce(&mut node, &mut other);

    let messages: Vec<_> = (0u64..30)
        .map(|i| other.create_text("full-sync-text", &format!("m{i}"), i + 10, Some(i + 1)))
        .collect();
    other.store(&messages);
    other.sent_to(&node);

    for time_low in [1u64, 5, 11, 20] {
        for time_high in [15u64, 25, 39, 0] {
            let expected: Vec<u64> = messages
                .iter()
                .map(|m| m.global_time())
                .filter(|gt| *gt >= time_low && (time_high == 0 || *gt <= time_high))
                .collect();

            let sent = ask(&mut node, &mut other, empty_sync(time_low, time_high, 1, 0));
            let got: Vec<u64> = filter_name(&sent, "full-sync-text")
                .iter()
                .map(|m| m.global_time)
                .collect();
            assert_eq!(got, expected, "range {time_low}..{time_high}");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn bloom_suppresses_known_packets() {
    let master = new_master();
    let mut node = TestNode::new(&master);
    let mut other = TestNode::new(&master);
    introduce(&mut node, &mut other);

    let messages: Vec<_> = (1u64..=6)
        .map(|i| other.create_text("full-sync-text", &format!("m{i}"), i + 10, Some(i)))
        .collect();
    other.store(&messages);
    other.sent_to(&node);

    let mut bloom = BloomFilter::new(256, 4);
    for message in &messages[0..3] {
        bloom.add(&message.packet);
    }
    let sync = SyncRequest {
        time_low: 1,
        time_high: 0,
        modulo: 1,
        offset: 0,
        bloom,
    };
    let sent = ask(&mut node, &mut other, sync);
    let got: Vec<u64> = filter_name(&sent, "full-sync-text")
        .iter()
        .map(|m| m.global_time)
        .collect();
    assert_eq!(got, vec![14, 15, 16]);
}

#[tokio::test(start_paused = true)]
async fn order_policies_shape_each_meta() {
    let master = new_master();
    let mut node = TestNode::new(&master);
    let mut other = TestNode::new(&master);
    introduce(&mut node, &mut other);

    let in_order: Vec<_> = (0u64..30)
        .step_by(3)
        .map(|i| other.create_text("ASC-text", &format!("m{i}"), i + 10, Some(i / 3 + 1)))
        .collect();
    let out_order: Vec<_> = (1u64..30)
        .step_by(3)
        .map(|i| other.create_text("DESC-text", &format!("m{i}"), i + 10, Some(i / 3 + 1)))
        .collect();
    let random_order: Vec<_> = (2u64..30)
        .step_by(3)
        .map(|i| other.create_text("RANDOM-text", &format!("m{i}"), i + 10, Some(i / 3 + 1)))
        .collect();
    other.store(&in_order);
    other.store(&out_order);
    other.store(&random_order);
    other.sent_to(&node);

    let sent = ask(&mut node, &mut other, empty_sync(1, 0, 1, 0));

    let asc: Vec<u64> = filter_name(&sent, "ASC-text").iter().map(|m| m.global_time).collect();
    let mut asc_expected: Vec<u64> = in_order.iter().map(|m| m.global_time()).collect();
    asc_expected.sort_unstable();
    assert_eq!(asc, asc_expected);

    let desc: Vec<u64> = filter_name(&sent, "DESC-text").iter().map(|m| m.global_time).collect();
    let mut desc_expected: Vec<u64> = out_order.iter().map(|m| m.global_time()).collect();
    desc_expected.sort_unstable();
    desc_expected.reverse();
    assert_eq!(desc, desc_expected);

    let random: Vec<u64> = filter_name(&sent, "RANDOM-text").iter().map(|m| m.global_time).collect();
    let mut sorted = random.clone();
    sorted.sort_unstable();
    assert_eq!(random.len(), random_order.len());
    assert_ne!(random, sorted, "random order must not be ascending");
    sorted.reverse();
    assert_ne!(random, sorted, "random order must not be descending");
}

#[tokio::test(start_paused = true)]
async fn priority_orders_across_metas() {
    let master = new_master();
    let mut node = TestNode::new(&master);
    let mut other = TestNode::new(&master);
    introduce(&mut node, &mut other);

    let high: Vec<_> = (0u64..30)
        .step_by(3)
        .map(|i| other.create_text("high-priority-text", &format!("m{i}"), i + 10, Some(i / 3 + 1)))
        .collect();
    let low: Vec<_> = (1u64..30)
        .step_by(3)
        .map(|i| other.create_text("low-priority-text", &format!("m{i}"), i + 10, Some(i / 3 + 1)))
        .collect();
    let medium: Vec<_> = (2u64..30)
        .step_by(3)
        .map(|i| other.create_text("medium-priority-text", &format!("m{i}"), i + 10, Some(i / 3 + 1)))
        .collect();
    other.store(&high);
    other.store(&low);
    other.store(&medium);
    other.sent_to(&node);

    let sent = ask(&mut node, &mut other, empty_sync(1, 0, 1, 0));
    let names: Vec<String> = common::peek_all(&sent)
        .into_iter()
        .map(|m| m.name)
        .filter(|n| n.ends_with("priority-text"))
        .collect();

    let mut expected = Vec::new();
    expected.extend(std::iter::repeat("high-priority-text".to_string()).take(high.len()));
    expected.extend(std::iter::repeat("medium-priority-text".to_string()).take(medium.len()));
    expected.extend(std::iter::repeat("low-priority-text".to_string()).take(low.len()));
    assert_eq!(names, expected);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Store-level selection equals the brute-force range/modulo predicate.
    #[test]
    fn selection_matches_predicate(
        gts in proptest::collection::btree_set(1u64..100, 0..20),
        time_low in 1u64..60,
        time_high in 0u64..100,
        modulo in 1u64..10,
        offset in 0u64..10,
    ) {
        let db = Database::open_in_memory().expect("open");
        let outcome = db.with_conn(|c| {
            let member = messages::member_get_or_insert(c, &[1u8; 20], &[1u8; 32])?;
            let (community, _, _) = messages::community_register(c, &[9u8; 20], member)?;
            let meta = messages::meta_register(c, community, "text")?;
            for gt in &gts {
                messages::sync_insert(c, community, member, meta, *gt, format!("p{gt}").as_bytes())?;
            }
            messages::sync_select(c, community, meta, time_low, time_high, modulo, offset)
        }).expect("select");

        let got: BTreeSet<u64> = outcome.iter().map(|r| r.global_time).collect();
        let expected: BTreeSet<u64> = gts
            .iter()
            .copied()
            .filter(|gt| *gt >= time_low && (time_high == 0 || *gt <= time_high))
            .filter(|gt| (gt + offset) % modulo == 0)
            .collect();
        prop_assert_eq!(got, expected);

        // Emission from the store is ascending before ordering policies apply.
        let sequence: Vec<u64> = outcome.iter().map(|r| r.global_time).collect();
        let mut sorted = sequence.clone();
        sorted.sort_unstable();
        prop_assert_eq!(sequence, sorted);
    }
}
