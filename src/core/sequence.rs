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

//! Sequence admission rules for full-sync streams.
//!
//! The stored set per (member, meta) is always a contiguous prefix 1..N with
//! strictly increasing global time. `next_expected` is therefore N + 1.

use crate::core::types::GlobalTime;

/// Admission verdict for a sequence-bearing message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceVerdict {
    /// sequence == next_expected and global time advances: store it.
    Accept,
    /// Sequence already stored with an equal or lower global time.
    Duplicate,
    /// Sequence already stored with a higher global time: the new message
    /// wins; evict the stored suffix starting at this sequence number.
    Replace {
        /// First sequence number to evict (inclusive).
        evict_from: u64,
    },
    /// sequence == next_expected but the global time does not advance.
    Stale,
    /// A gap precedes this message; backfill `low..=high` first.
    Missing {
        /// First missing sequence number.
        low: u64,
        /// Last missing sequence number.
        high: u64,
    },
}

/// Judge an inbound (sequence, global_time) against the stored prefix.
///
/// `stored_max` is the highest stored sequence number (0 when empty),
/// `last_global_time` the global time at `stored_max` (0 when empty), and
/// `stored_global_time_at` resolves the global time of an already stored
/// sequence number.
pub fn judge(
    stored_max: u64,
    last_global_time: GlobalTime,
    stored_global_time_at: impl Fn(u64) -> Option<GlobalTime>,
    sequence: u64,
    global_time: GlobalTime,
) -> SequenceVerdict {
    debug_assert!(sequence >= 1);

    if sequence > stored_max + 1 {
        return SequenceVerdict::Missing {
            low: stored_max + 1,
            high: sequence - 1,
        };
    }

    if sequence == stored_max + 1 {
        return if global_time > last_global_time {
            SequenceVerdict::Accept
        } else {
            SequenceVerdict::Stale
        };
    }

    // The slot is occupied: prefer the lower global time so a malicious
    // signer cannot wedge the stream at a high clock value.
    match stored_global_time_at(sequence) {
        Some(stored) if global_time < stored => SequenceVerdict::Replace {
            evict_from: sequence,
        },
        Some(_) => SequenceVerdict::Duplicate,
        None => SequenceVerdict::Stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn judge_with(stored: &BTreeMap<u64, u64>, seq: u64, gt: u64) -> SequenceVerdict {
        let stored_max = stored.keys().next_back().copied().unwrap_or(0);
        let last_gt = stored.get(&stored_max).copied().unwrap_or(0);
        judge(stored_max, last_gt, |s| stored.get(&s).copied(), seq, gt)
    }

    #[test]
    fn walks_the_conflict_scenario() {
        // Mirrors the broken-peer scenario: M@gt#seq.
        let mut stored: BTreeMap<u64, u64> = BTreeMap::new();

        assert_eq!(judge_with(&stored, 1, 6), SequenceVerdict::Accept);
        stored.insert(1, 6);

        assert_eq!(judge_with(&stored, 1, 6), SequenceVerdict::Duplicate);

        assert_eq!(judge_with(&stored, 1, 5), SequenceVerdict::Replace { evict_from: 1 });
        stored.clear();
        stored.insert(1, 5);

        assert_eq!(judge_with(&stored, 1, 6), SequenceVerdict::Duplicate);
        assert_eq!(judge_with(&stored, 2, 4), SequenceVerdict::Stale);
        assert_eq!(judge_with(&stored, 2, 5), SequenceVerdict::Stale);

        assert_eq!(judge_with(&stored, 2, 6), SequenceVerdict::Accept);
        stored.insert(2, 6);
        assert_eq!(judge_with(&stored, 3, 8), SequenceVerdict::Accept);
        stored.insert(3, 8);
        assert_eq!(judge_with(&stored, 4, 9), SequenceVerdict::Accept);
        stored.insert(4, 9);

        assert_eq!(judge_with(&stored, 3, 7), SequenceVerdict::Replace { evict_from: 3 });
    }

    #[test]
    fn gap_requests_backfill() {
        let stored: BTreeMap<u64, u64> = BTreeMap::new();
        assert_eq!(
            judge_with(&stored, 5, 15),
            SequenceVerdict::Missing { low: 1, high: 4 }
        );
    }
}
