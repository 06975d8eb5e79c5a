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

//! Windowed ingestion batches per (community, meta message).
//!
//! A batch opens at the first packet and closes when its window elapses or
//! its size cap is reached; the node loop commits closed batches atomically.

use crate::core::types::CommunityId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Batch window of a meta message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum time the first packet of a batch waits.
    pub max_window: Duration,
    /// Maximum packets per batch.
    pub max_size: usize,
}

impl BatchConfig {
    /// Window with a generous size cap.
    pub fn window(max_window: Duration) -> Self {
        Self {
            max_window,
            max_size: 1024,
        }
    }
}

/// Batch grouping key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BatchKey {
    /// Community the packets belong to.
    pub community: CommunityId,
    /// Declaration index of the meta message.
    pub meta_index: usize,
}

/// A closed batch ready for commit.
#[derive(Debug)]
pub struct ReadyBatch {
    /// Grouping key.
    pub key: BatchKey,
    /// Packets in arrival order.
    pub packets: Vec<(SocketAddr, Vec<u8>)>,
}

struct Open {
    deadline: Instant,
    max_size: usize,
    packets: Vec<(SocketAddr, Vec<u8>)>,
}

/// Scheduler state: one open batch per key.
#[derive(Default)]
pub struct BatchScheduler {
    open: HashMap<BatchKey, Open>,
}

impl BatchScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a packet; returns the batch when the size cap closes it.
    pub fn push(
        &mut self,
        key: BatchKey,
        config: BatchConfig,
        source: SocketAddr,
        packet: Vec<u8>,
        now: Instant,
    ) -> Option<ReadyBatch> {
        let entry = self.open.entry(key).or_insert_with(|| Open {
            deadline: now + config.max_window,
            max_size: config.max_size.max(1),
            packets: Vec::new(),
        });
        entry.packets.push((source, packet));
        if entry.packets.len() >= entry.max_size {
            let open = self.open.remove(&key)?;
            return Some(ReadyBatch {
                key,
                packets: open.packets,
            });
        }
        None
    }

    /// Earliest open-batch deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open.values().map(|o| o.deadline).min()
    }

    /// Close and return every batch whose window elapsed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<ReadyBatch> {
        let keys: Vec<BatchKey> = self
            .open
            .iter()
            .filter(|(_, o)| o.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        let mut out = Vec::new();
        for key in keys {
            if let Some(open) = self.open.remove(&key) {
                out.push(ReadyBatch {
                    key,
                    packets: open.packets,
                });
            }
        }
        out
    }

    /// Close every open batch (shutdown drain).
    pub fn drain(&mut self) -> Vec<ReadyBatch> {
        let keys: Vec<BatchKey> = self.open.keys().copied().collect();
        let mut out = Vec::new();
        for key in keys {
            if let Some(open) = self.open.remove(&key) {
                out.push(ReadyBatch {
                    key,
                    packets: open.packets,
                });
            }
        }
        out
    }

    /// Number of open batches.
    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// True when no batch is open.
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
