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

//! Delay queue: packets parked on a missing dependency.
//!
//! One outstanding request per missing key; further delays on the same key
//! coalesce. Expired entries are dropped silently.

use crate::core::codec::DelayReason;
use crate::core::types::MemberId;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::time::Instant;

/// Coalescing key of a delay reason.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DelayKey {
    /// Waiting for the identity of a mid.
    Member(MemberId),
    /// Waiting for a sequence range of (member, meta).
    Sequence {
        /// Message author.
        member: MemberId,
        /// Meta-message name.
        meta: String,
        /// First missing sequence number.
        low: u64,
        /// Last missing sequence number.
        high: u64,
    },
    /// Waiting for an authorize chain covering a member.
    Proof(MemberId),
}

impl DelayKey {
    /// Derive the coalescing key of a delay reason.
    pub fn of(reason: &DelayReason) -> Self {
        match reason {
            DelayReason::MissingMember { mid } | DelayReason::UnspecifiedMember { mid } => {
                DelayKey::Member(*mid)
            }
            DelayReason::MissingSequence { member, meta, range } => DelayKey::Sequence {
                member: *member,
                meta: meta.clone(),
                low: range.low,
                high: range.high,
            },
            DelayReason::MissingProof { member, .. } => DelayKey::Proof(*member),
        }
    }
}

struct Parked {
    deadline: Instant,
    packets: Vec<(SocketAddr, Vec<u8>)>,
}

/// Parked packets keyed by their missing dependency.
#[derive(Default)]
pub struct DelayQueue {
    parked: HashMap<DelayKey, Parked>,
}

impl DelayQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a packet. Returns true when this key is new and the caller
    /// should emit the request for the missing dependency.
    pub fn park(
        &mut self,
        key: DelayKey,
        source: SocketAddr,
        packet: Vec<u8>,
        deadline: Instant,
    ) -> bool {
        match self.parked.get_mut(&key) {
            Some(entry) => {
                if !entry.packets.iter().any(|(_, p)| p == &packet) {
                    entry.packets.push((source, packet));
                }
                false
            }
            None => {
                self.parked.insert(
                    key,
                    Parked {
                        deadline,
                        packets: vec![(source, packet)],
                    },
                );
                true
            }
        }
    }

    /// Drop expired entries; returns the number of packets discarded.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut dropped = 0;
        self.parked.retain(|_, entry| {
            if entry.deadline <= now {
                dropped += entry.packets.len();
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Release packets parked on a freshly learned member.
    pub fn on_member_learned(&mut self, mid: MemberId) -> Vec<(SocketAddr, Vec<u8>)> {
        self.take(|key| matches!(key, DelayKey::Member(m) if *m == mid))
    }

    /// Release packets whose sequence gap closed (stored prefix reached
    /// `stored_max`).
    pub fn on_sequence_stored(
        &mut self,
        member: MemberId,
        meta: &str,
        stored_max: u64,
    ) -> Vec<(SocketAddr, Vec<u8>)> {
        self.take(|key| {
            matches!(key, DelayKey::Sequence { member: m, meta: name, high, .. }
                if *m == member && name == meta && *high <= stored_max)
        })
    }

    /// Release packets parked on a proof for a member.
    pub fn on_proof_stored(&mut self, member: MemberId) -> Vec<(SocketAddr, Vec<u8>)> {
        self.take(|key| matches!(key, DelayKey::Proof(m) if *m == member))
    }

    fn take(&mut self, pred: impl Fn(&DelayKey) -> bool) -> Vec<(SocketAddr, Vec<u8>)> {
        let keys: Vec<DelayKey> = self.parked.keys().filter(|k| pred(k)).cloned().collect();
        let mut out = Vec::new();
        for key in keys {
            if let Some(entry) = self.parked.remove(&key) {
                out.extend(entry.packets);
            }
        }
        out
    }

    /// Number of parked keys.
    pub fn len(&self) -> usize {
        self.parked.len()
    }

    /// True when nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }
}
