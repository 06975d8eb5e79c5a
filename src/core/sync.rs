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
#![warn(missing_docs)]

//! Sync responder: selects and orders the stored packets answering an
//! introduction-request sync tuple.

use crate::core::payload::SyncRequest;
use crate::core::policy::{MetaMessage, SyncOrder};
use crate::store::db::StoreError;
use crate::store::messages;
use rand::seq::SliceRandom;
use rusqlite::Connection;
use std::sync::Arc;

/// Select the packets answering `request`, in emission order.
///
/// Meta messages are served one after another: descending priority, ties by
/// declaration order. Within one meta the packets follow its sync order.
/// `byte_limit` bounds the total response size; a packet that does not fit
/// ends the response.
pub fn respond(
    conn: &Connection,
    community_database_id: i64,
    metas: &[Arc<MetaMessage>],
    request: &SyncRequest,
    byte_limit: usize,
) -> Result<Vec<Vec<u8>>, StoreError> {
    let mut synced: Vec<&Arc<MetaMessage>> =
        metas.iter().filter(|m| m.distribution.is_synced()).collect();
    // Stable: ties keep declaration order.
    synced.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.index.cmp(&b.index)));

    let mut out: Vec<Vec<u8>> = Vec::new();
    let mut budget = byte_limit;

    for meta in synced {
        let rows = messages::sync_select(
            conn,
            community_database_id,
            meta.database_id,
            request.time_low,
            request.time_high,
            request.modulo,
            request.offset,
        )?;

        // False-positive suppression: skip what the requester already holds.
        let mut packets: Vec<Vec<u8>> = rows
            .into_iter()
            .filter(|row| !request.bloom.contains(&row.packet))
            .map(|row| row.packet)
            .collect();

        match meta.distribution.sync_order() {
            Some(SyncOrder::Ascending) | None => {}
            Some(SyncOrder::Descending) => packets.reverse(),
            Some(SyncOrder::Random) => {
                let mut rng = rand::thread_rng();
                packets.shuffle(&mut rng);
            }
        }

        for packet in packets {
            if packet.len() > budget {
                return Ok(out);
            }
            budget -= packet.len();
            out.push(packet);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bloom::BloomFilter;
    use crate::core::policy::{AuthEncoding, Authentication, Destination, Distribution, Resolution};
    use crate::store::db::Database;

    fn meta(name: &str, database_id: i64, index: usize, order: SyncOrder, priority: u8) -> Arc<MetaMessage> {
        Arc::new(
            MetaMessage::new(
                name,
                database_id,
                index,
                Authentication::Member { encoding: AuthEncoding::Mid },
                Resolution::Public,
                Distribution::FullSync { order },
                Destination::Community { node_count: 10 },
                None,
                Some(priority),
            )
            .expect("meta"),
        )
    }

    fn request(modulo: u64, offset: u64) -> SyncRequest {
        SyncRequest {
            time_low: 1,
            time_high: 0,
            modulo,
            offset,
            bloom: BloomFilter::empty(),
        }
    }

    #[test]
    fn priority_orders_across_metas() {
        let db = Database::open_in_memory().expect("open");
        db.with_conn(|c| {
            let member = messages::member_get_or_insert(c, &[1u8; 20], &[1u8; 32])?;
            let (community, _, _) = messages::community_register(c, &[9u8; 20], member)?;
            let high = messages::meta_register(c, community, "high")?;
            let low = messages::meta_register(c, community, "low")?;
            // Declaration order favours "low"; priority must override it.
            let metas = vec![
                meta("low", low, 0, SyncOrder::Ascending, 20),
                meta("high", high, 1, SyncOrder::Ascending, 200),
            ];
            messages::sync_insert(c, community, member, low, 10, b"low-packet")?;
            messages::sync_insert(c, community, member, high, 11, b"high-packet")?;

            let out = respond(c, community, &metas, &request(1, 0), usize::MAX)?;
            assert_eq!(out, vec![b"high-packet".to_vec(), b"low-packet".to_vec()]);
            Ok(())
        })
        .expect("ops");
    }

    #[test]
    fn descending_order_and_byte_limit() {
        let db = Database::open_in_memory().expect("open");
        db.with_conn(|c| {
            let member = messages::member_get_or_insert(c, &[1u8; 20], &[1u8; 32])?;
            let (community, _, _) = messages::community_register(c, &[9u8; 20], member)?;
            let id = messages::meta_register(c, community, "desc")?;
            let metas = vec![meta("desc", id, 0, SyncOrder::Descending, 128)];
            for gt in 10u64..14 {
                messages::sync_insert(c, community, member, id, gt, format!("p{gt}").as_bytes())?;
            }

            let out = respond(c, community, &metas, &request(1, 0), usize::MAX)?;
            assert_eq!(
                out,
                vec![b"p13".to_vec(), b"p12".to_vec(), b"p11".to_vec(), b"p10".to_vec()]
            );

            let capped = respond(c, community, &metas, &request(1, 0), 6)?;
            assert_eq!(capped.len(), 2);
            Ok(())
        })
        .expect("ops");
    }
}
