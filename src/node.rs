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

//! Node driver: one cooperative event loop over the endpoint inbound stream,
//! batch-window deadlines, and a housekeeping tick.
//!
//! Communities are single-writer: all their state transitions happen on this
//! loop. Store I/O is the only blocking work and runs via `block_in_place`.

use crate::core::batch::{BatchKey, BatchScheduler, ReadyBatch};
use crate::core::community::Community;
use crate::core::message::WirePacket;
use crate::core::types::CommunityId;
use crate::networking::endpoint::PacketRx;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Handle to a running node task.
pub struct NodeHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl NodeHandle {
    /// Request shutdown and wait for the loop to drain and stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

/// The event loop state.
pub struct Node {
    communities: HashMap<CommunityId, Community>,
    scheduler: BatchScheduler,
    inbound: PacketRx,
}

impl Node {
    /// Build a node over an endpoint inbound stream.
    pub fn new(inbound: PacketRx) -> Self {
        Self {
            communities: HashMap::new(),
            scheduler: BatchScheduler::new(),
            inbound,
        }
    }

    /// Attach a community to this loop.
    pub fn add_community(&mut self, community: Community) {
        self.communities.insert(community.id(), community);
    }

    /// Spawn the loop; returns a handle for shutdown.
    pub fn spawn(self) -> NodeHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(self.run(shutdown_rx));
        NodeHandle { shutdown_tx, join }
    }

    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(communities = self.communities.len(), "node loop started");

        loop {
            let deadline = self.scheduler.next_deadline();
            tokio::select! {
                maybe = self.inbound.recv() => {
                    match maybe {
                        Some((source, packet)) => self.on_packet(source, packet),
                        None => {
                            info!("inbound stream closed; draining");
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    for community in self.communities.values_mut() {
                        community.on_tick(now);
                    }
                }
                _ = sleep_until_or_forever(deadline) => {
                    let ready = self.scheduler.take_expired(Instant::now());
                    self.commit_batches(ready);
                }
                _ = &mut shutdown_rx => {
                    info!("shutdown requested; draining");
                    break;
                }
            }
        }

        // In-flight batches are finalised before the store closes.
        let remaining = self.scheduler.drain();
        self.commit_batches(remaining);
        info!("node loop stopped");
    }

    fn on_packet(&mut self, source: SocketAddr, packet: Vec<u8>) {
        let Ok(wire) = WirePacket::decode(&packet) else {
            debug!(%source, "undecodable datagram");
            return;
        };
        let Some(community) = self.communities.get_mut(&wire.community) else {
            debug!(%source, community = ?wire.community, "unknown community");
            return;
        };

        match community.classify_packet(&packet) {
            Some((meta_index, Some(config))) => {
                let key = BatchKey {
                    community: community.id(),
                    meta_index,
                };
                if let Some(ready) =
                    self.scheduler
                        .push(key, config, source, packet, Instant::now())
                {
                    self.commit_batches(vec![ready]);
                }
            }
            Some((_, None)) => {
                let outcome = run_blocking(|| community.handle_packets(source, vec![packet]));
                if let Err(e) = outcome {
                    warn!(%source, err = %e, "packet handling failed");
                }
            }
            None => {
                debug!(%source, "unclassifiable packet");
            }
        }
    }

    fn commit_batches(&mut self, batches: Vec<ReadyBatch>) {
        for batch in batches {
            let Some(community) = self.communities.get_mut(&batch.key.community) else {
                continue;
            };
            let outcome = run_blocking(|| community.handle_batch(batch.packets));
            if let Err(e) = outcome {
                warn!(err = %e, "batch commit failed");
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

/// Keep blocking store I/O off the reactor threads where possible.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle)
            if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread =>
        {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
