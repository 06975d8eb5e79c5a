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

//! Wire Bloom filter carried in sync tuples.
//!
//! Requesters advertise the packets they already hold; responders suppress
//! matches. False positives only cost a skipped retransmission, never
//! correctness, so small filters are fine.

use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};

/// Fixed-size Bloom filter with double hashing over SHA-256.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u8>,
    functions: u8,
}

impl BloomFilter {
    /// Create an empty filter of `size_bytes` bytes and `functions` probes.
    pub fn new(size_bytes: usize, functions: u8) -> Self {
        Self {
            bits: vec![0u8; size_bytes.max(1)],
            functions: functions.max(1),
        }
    }

    /// An empty filter that matches nothing (used for "send everything").
    pub fn empty() -> Self {
        Self::new(1, 1)
    }

    fn indexes(&self, item: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let d = digest(&SHA256, item);
        let raw = d.as_ref();
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&raw[0..8]);
        b.copy_from_slice(&raw[8..16]);
        let h1 = u64::from_be_bytes(a);
        let h2 = u64::from_be_bytes(b) | 1;
        let nbits = (self.bits.len() * 8) as u64;
        (0..self.functions as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % nbits) as usize)
    }

    /// Add an item.
    pub fn add(&mut self, item: &[u8]) {
        let idx: Vec<usize> = self.indexes(item).collect();
        for i in idx {
            self.bits[i / 8] |= 1 << (i % 8);
        }
    }

    /// Membership test (may report false positives).
    pub fn contains(&self, item: &[u8]) -> bool {
        self.indexes(item)
            .collect::<Vec<_>>()
            .into_iter()
            .all(|i| self.bits[i / 8] & (1 << (i % 8)) != 0)
    }
}
