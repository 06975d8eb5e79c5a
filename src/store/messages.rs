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

//! Typed message-store operations.
//!
//! Sequence numbers are not a column. Invariant I3 keeps the stored set for a
//! (member, meta) a contiguous prefix with strictly increasing global time,
//! so the row count is the highest sequence number and the n-th row in
//! global_time order carries sequence number n.

use crate::core::types::{global_time_from_sql, global_time_to_sql, GlobalTime};
use crate::store::db::StoreError;
use rusqlite::{Connection, OptionalExtension};

/// A stored packet with its global time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredPacket {
    /// Row id in `sync`.
    pub sync_id: i64,
    /// Stored global time.
    pub global_time: GlobalTime,
    /// Canonical wire bytes.
    pub packet: Vec<u8>,
}

/// Fetch or create the community row; returns (id, global_time, degree).
pub fn community_register(
    conn: &Connection,
    master: &[u8],
    my_member: i64,
) -> Result<(i64, GlobalTime, Option<String>), StoreError> {
    let found = conn
        .query_row(
            "SELECT id, global_time, degree FROM community WHERE master = ?",
            rusqlite::params![master],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()
        .map_err(|_| StoreError::Io)?;
    if let Some((id, gt, degree)) = found {
        return Ok((id, global_time_from_sql(gt), degree));
    }
    conn.execute(
        "INSERT INTO community (master, member, global_time) VALUES (?, ?, 0)",
        rusqlite::params![master, my_member],
    )
    .map_err(|_| StoreError::Io)?;
    Ok((conn.last_insert_rowid(), 0, None))
}

/// Persist the community clock.
pub fn community_update_global_time(
    conn: &Connection,
    community: i64,
    global_time: GlobalTime,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE community SET global_time = ? WHERE id = ?",
        rusqlite::params![global_time_to_sql(global_time), community],
    )
    .map_err(|_| StoreError::Io)?;
    Ok(())
}

/// Persist the kill degree of a destroyed community.
pub fn community_set_degree(
    conn: &Connection,
    community: i64,
    degree: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE community SET degree = ? WHERE id = ?",
        rusqlite::params![degree, community],
    )
    .map_err(|_| StoreError::Io)?;
    Ok(())
}

/// Fetch or create the meta_message row for (community, name).
pub fn meta_register(conn: &Connection, community: i64, name: &str) -> Result<i64, StoreError> {
    let found = conn
        .query_row(
            "SELECT id FROM meta_message WHERE community = ? AND name = ?",
            rusqlite::params![community, name],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(|_| StoreError::Io)?;
    if let Some(id) = found {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO meta_message (community, name) VALUES (?, ?)",
        rusqlite::params![community, name],
    )
    .map_err(|_| StoreError::Io)?;
    Ok(conn.last_insert_rowid())
}

/// Fetch or create a member row; mids may collide, keys are unique.
pub fn member_get_or_insert(
    conn: &Connection,
    mid: &[u8],
    public_key: &[u8],
) -> Result<i64, StoreError> {
    let found = conn
        .query_row(
            "SELECT id FROM member WHERE public_key = ?",
            rusqlite::params![public_key],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(|_| StoreError::Io)?;
    if let Some(id) = found {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO member (mid, public_key) VALUES (?, ?)",
        rusqlite::params![mid, public_key],
    )
    .map_err(|_| StoreError::Io)?;
    Ok(conn.last_insert_rowid())
}

/// Every (database id, public key) known for a mid, insertion order.
pub fn member_all_by_mid(
    conn: &Connection,
    mid: &[u8],
) -> Result<Vec<(i64, Vec<u8>)>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT id, public_key FROM member WHERE mid = ? ORDER BY id")
        .map_err(|_| StoreError::Io)?;
    let rows = stmt
        .query_map(rusqlite::params![mid], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .map_err(|_| StoreError::Io)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(|_| StoreError::Io)?);
    }
    Ok(out)
}

/// Stored message count for (community, member, meta) == highest sequence.
pub fn sync_count(
    conn: &Connection,
    community: i64,
    member: i64,
    meta: i64,
) -> Result<u64, StoreError> {
    let n: i64 = conn
        .query_row(
            "SELECT count(*) FROM sync WHERE community = ? AND member = ? AND meta_message = ?",
            rusqlite::params![community, member, meta],
            |row| row.get(0),
        )
        .map_err(|_| StoreError::Io)?;
    Ok(n.max(0) as u64)
}

/// Stored message count for (community, meta) across members.
pub fn sync_count_meta(conn: &Connection, community: i64, meta: i64) -> Result<u64, StoreError> {
    let n: i64 = conn
        .query_row(
            "SELECT count(*) FROM sync WHERE community = ? AND meta_message = ?",
            rusqlite::params![community, meta],
            |row| row.get(0),
        )
        .map_err(|_| StoreError::Io)?;
    Ok(n.max(0) as u64)
}

/// Global time of the row holding sequence number `seq` (1-based).
pub fn sync_global_time_at_seq(
    conn: &Connection,
    community: i64,
    member: i64,
    meta: i64,
    seq: u64,
) -> Result<Option<GlobalTime>, StoreError> {
    if seq == 0 {
        return Ok(None);
    }
    let v = conn
        .query_row(
            "SELECT global_time FROM sync
             WHERE community = ? AND member = ? AND meta_message = ?
             ORDER BY global_time ASC LIMIT 1 OFFSET ?",
            rusqlite::params![community, member, meta, (seq - 1) as i64],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(|_| StoreError::Io)?;
    Ok(v.map(global_time_from_sql))
}

/// Highest stored global time for (community, member, meta).
pub fn sync_max_global_time(
    conn: &Connection,
    community: i64,
    member: i64,
    meta: i64,
) -> Result<Option<GlobalTime>, StoreError> {
    let v = conn
        .query_row(
            "SELECT max(global_time) FROM sync
             WHERE community = ? AND member = ? AND meta_message = ?",
            rusqlite::params![community, member, meta],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map_err(|_| StoreError::Io)?;
    Ok(v.map(global_time_from_sql))
}

/// Stored packets for sequence numbers `low..=high`, ascending.
pub fn sync_packets_in_seq_range(
    conn: &Connection,
    community: i64,
    member: i64,
    meta: i64,
    low: u64,
    high: u64,
) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
    if low == 0 || high < low {
        return Ok(Vec::new());
    }
    let limit = (high - low + 1) as i64;
    let mut stmt = conn
        .prepare(
            "SELECT packet FROM sync
             WHERE community = ? AND member = ? AND meta_message = ?
             ORDER BY global_time ASC LIMIT ? OFFSET ?",
        )
        .map_err(|_| StoreError::Io)?;
    let rows = stmt
        .query_map(
            rusqlite::params![community, member, meta, limit, (low - 1) as i64],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .map_err(|_| StoreError::Io)?;
    let mut out = Vec::new();
    let mut seq = low;
    for r in rows {
        out.push((seq, r.map_err(|_| StoreError::Io)?));
        seq += 1;
    }
    Ok(out)
}

/// Insert an admitted message; returns the sync row id.
pub fn sync_insert(
    conn: &Connection,
    community: i64,
    member: i64,
    meta: i64,
    global_time: GlobalTime,
    packet: &[u8],
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO sync (community, member, meta_message, global_time, packet, undone)
         VALUES (?, ?, ?, ?, ?, 0)",
        rusqlite::params![community, member, meta, global_time_to_sql(global_time), packet],
    )
    .map_err(|_| StoreError::Io)?;
    Ok(conn.last_insert_rowid())
}

/// True when this exact packet is already stored for (member, meta).
pub fn sync_packet_stored(
    conn: &Connection,
    community: i64,
    member: i64,
    meta: i64,
    packet: &[u8],
) -> Result<bool, StoreError> {
    let v = conn
        .query_row(
            "SELECT 1 FROM sync
             WHERE community = ? AND member = ? AND meta_message = ? AND packet = ?",
            rusqlite::params![community, member, meta, packet],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(|_| StoreError::Io)?;
    Ok(v.is_some())
}

/// Delete every row with sequence number >= `seq` for (member, meta);
/// returns the removed count. Row ids are resolved by global_time order.
pub fn sync_delete_from_seq(
    conn: &Connection,
    community: i64,
    member: i64,
    meta: i64,
    seq: u64,
) -> Result<usize, StoreError> {
    if seq == 0 {
        return Ok(0);
    }
    let ids: Vec<i64> = {
        let mut stmt = conn
            .prepare(
                "SELECT id FROM sync
                 WHERE community = ? AND member = ? AND meta_message = ?
                 ORDER BY global_time ASC LIMIT -1 OFFSET ?",
            )
            .map_err(|_| StoreError::Io)?;
        let rows = stmt
            .query_map(
                rusqlite::params![community, member, meta, (seq - 1) as i64],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|_| StoreError::Io)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(|_| StoreError::Io)?);
        }
        out
    };
    for id in &ids {
        sync_delete_by_id(conn, *id)?;
    }
    Ok(ids.len())
}

/// Delete one sync row and its double-signed companion.
pub fn sync_delete_by_id(conn: &Connection, sync_id: i64) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM double_signed_sync WHERE sync = ?",
        rusqlite::params![sync_id],
    )
    .map_err(|_| StoreError::Io)?;
    conn.execute("DELETE FROM sync WHERE id = ?", rusqlite::params![sync_id])
        .map_err(|_| StoreError::Io)?;
    Ok(())
}

/// Rows for a member-keyed last-sync retention key, ascending global time.
pub fn sync_member_rows(
    conn: &Connection,
    community: i64,
    member: i64,
    meta: i64,
) -> Result<Vec<StoredPacket>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, global_time, packet FROM sync
             WHERE community = ? AND member = ? AND meta_message = ?
             ORDER BY global_time ASC",
        )
        .map_err(|_| StoreError::Io)?;
    let rows = stmt
        .query_map(rusqlite::params![community, member, meta], |row| {
            Ok(StoredPacket {
                sync_id: row.get(0)?,
                global_time: global_time_from_sql(row.get(1)?),
                packet: row.get(2)?,
            })
        })
        .map_err(|_| StoreError::Io)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(|_| StoreError::Io)?);
    }
    Ok(out)
}

/// Record the sorted signer pair of a double-signed sync row.
pub fn double_signed_insert(
    conn: &Connection,
    sync_id: i64,
    member_a: i64,
    member_b: i64,
) -> Result<(), StoreError> {
    let (m1, m2) = if member_a <= member_b {
        (member_a, member_b)
    } else {
        (member_b, member_a)
    };
    conn.execute(
        "INSERT INTO double_signed_sync (sync, member1, member2) VALUES (?, ?, ?)",
        rusqlite::params![sync_id, m1, m2],
    )
    .map_err(|_| StoreError::Io)?;
    Ok(())
}

/// Rows for a pair-keyed last-sync retention key, ascending global time.
pub fn sync_pair_rows(
    conn: &Connection,
    community: i64,
    meta: i64,
    member_a: i64,
    member_b: i64,
) -> Result<Vec<StoredPacket>, StoreError> {
    let (m1, m2) = if member_a <= member_b {
        (member_a, member_b)
    } else {
        (member_b, member_a)
    };
    let mut stmt = conn
        .prepare(
            "SELECT sync.id, sync.global_time, sync.packet FROM sync
             JOIN double_signed_sync ON double_signed_sync.sync = sync.id
             WHERE sync.community = ? AND sync.meta_message = ?
               AND double_signed_sync.member1 = ? AND double_signed_sync.member2 = ?
             ORDER BY sync.global_time ASC",
        )
        .map_err(|_| StoreError::Io)?;
    let rows = stmt
        .query_map(rusqlite::params![community, meta, m1, m2], |row| {
            Ok(StoredPacket {
                sync_id: row.get(0)?,
                global_time: global_time_from_sql(row.get(1)?),
                packet: row.get(2)?,
            })
        })
        .map_err(|_| StoreError::Io)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(|_| StoreError::Io)?);
    }
    Ok(out)
}

/// Select stored packets of one meta matching the sync range and modulo,
/// ascending global time. Bloom suppression happens in the responder.
pub fn sync_select(
    conn: &Connection,
    community: i64,
    meta: i64,
    time_low: GlobalTime,
    time_high: GlobalTime,
    modulo: u64,
    offset: u64,
) -> Result<Vec<StoredPacket>, StoreError> {
    let high = if time_high == 0 {
        i64::MAX
    } else {
        global_time_to_sql(time_high)
    };
    let modulo = modulo.max(1);
    let mut stmt = conn
        .prepare(
            "SELECT id, global_time, packet FROM sync
             WHERE community = ? AND meta_message = ?
               AND global_time >= ? AND global_time <= ?
               AND (global_time + ?) % ? = 0
               AND undone = 0
             ORDER BY global_time ASC",
        )
        .map_err(|_| StoreError::Io)?;
    let rows = stmt
        .query_map(
            rusqlite::params![
                community,
                meta,
                global_time_to_sql(time_low),
                high,
                global_time_to_sql(offset),
                global_time_to_sql(modulo)
            ],
            |row| {
                Ok(StoredPacket {
                    sync_id: row.get(0)?,
                    global_time: global_time_from_sql(row.get(1)?),
                    packet: row.get(2)?,
                })
            },
        )
        .map_err(|_| StoreError::Io)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(|_| StoreError::Io)?);
    }
    Ok(out)
}

/// Stored packets of one member at exactly the given global times, ascending.
pub fn sync_packets_at_global_times(
    conn: &Connection,
    community: i64,
    member: i64,
    global_times: &[GlobalTime],
) -> Result<Vec<StoredPacket>, StoreError> {
    let mut out = Vec::new();
    for gt in global_times {
        let row = conn
            .query_row(
                "SELECT id, global_time, packet FROM sync
                 WHERE community = ? AND member = ? AND global_time = ?",
                rusqlite::params![community, member, global_time_to_sql(*gt)],
                |row| {
                    Ok(StoredPacket {
                        sync_id: row.get(0)?,
                        global_time: global_time_from_sql(row.get(1)?),
                        packet: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|_| StoreError::Io)?;
        if let Some(p) = row {
            out.push(p);
        }
    }
    out.sort_by_key(|p| p.global_time);
    out.dedup_by_key(|p| p.sync_id);
    Ok(out)
}

/// Stored packets of a member for one meta, ascending global time.
pub fn sync_packets_for_member_meta(
    conn: &Connection,
    community: i64,
    member: i64,
    meta: i64,
) -> Result<Vec<StoredPacket>, StoreError> {
    sync_member_rows(conn, community, member, meta)
}

/// Wipe every stored message of a community (hard kill).
pub fn sync_wipe_community(conn: &Connection, community: i64) -> Result<usize, StoreError> {
    conn.execute(
        "DELETE FROM double_signed_sync WHERE sync IN (SELECT id FROM sync WHERE community = ?)",
        rusqlite::params![community],
    )
    .map_err(|_| StoreError::Io)?;
    let n = conn
        .execute("DELETE FROM sync WHERE community = ?", rusqlite::params![community])
        .map_err(|_| StoreError::Io)?;
    Ok(n)
}
