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

//! Pluggable packet endpoint.
//!
//! Outbound is the [`Endpoint`] trait; inbound is an mpsc stream of
//! `(source, packet)` tuples owned by the node loop. The UDP endpoint is the
//! real transport; the manual endpoint gives tests deterministic delivery.

use crate::core::types::MAX_PACKET_BYTES;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Endpoint errors.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("io")]
    Io,
    #[error("endpoint closed")]
    Closed,
    #[error("packet too large")]
    TooLarge,
}

/// Inbound packet stream.
pub type PacketRx = mpsc::Receiver<(SocketAddr, Vec<u8>)>;

/// Outbound packet sink.
pub trait Endpoint: Send + Sync {
    /// Send one packet to every address.
    fn send(&self, addresses: &[SocketAddr], packet: &[u8]) -> Result<(), EndpointError>;

    /// Address peers can reach this endpoint on.
    fn local_address(&self) -> SocketAddr;
}

/// UDP endpoint handle; the socket loop runs in a background task.
pub struct UdpEndpoint {
    local: SocketAddr,
    out_tx: mpsc::UnboundedSender<(Vec<SocketAddr>, Vec<u8>)>,
}

impl Endpoint for UdpEndpoint {
    fn send(&self, addresses: &[SocketAddr], packet: &[u8]) -> Result<(), EndpointError> {
        if packet.len() > MAX_PACKET_BYTES {
            return Err(EndpointError::TooLarge);
        }
        self.out_tx
            .send((addresses.to_vec(), packet.to_vec()))
            .map_err(|_| EndpointError::Closed)
    }

    fn local_address(&self) -> SocketAddr {
        self.local
    }
}

/// Bind a UDP socket and spawn its send/receive loop.
pub async fn spawn_udp_endpoint(
    bind: SocketAddr,
) -> Result<(Arc<UdpEndpoint>, PacketRx, tokio::task::JoinHandle<()>), EndpointError> {
    let socket = UdpSocket::bind(bind).await.map_err(|_| EndpointError::Io)?;
    let local = socket.local_addr().map_err(|_| EndpointError::Io)?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(Vec<SocketAddr>, Vec<u8>)>();
    let (in_tx, in_rx) = mpsc::channel::<(SocketAddr, Vec<u8>)>(1024);

    let join = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PACKET_BYTES];
        info!(addr = %local, "udp endpoint listening");
        loop {
            tokio::select! {
                maybe_out = out_rx.recv() => {
                    match maybe_out {
                        Some((addresses, packet)) => {
                            for address in addresses {
                                if let Err(e) = socket.send_to(&packet, address).await {
                                    warn!(addr = %address, err = ?e, "udp send failed");
                                }
                            }
                        }
                        None => {
                            info!("outbound channel closed; stopping udp endpoint");
                            break;
                        }
                    }
                }
                inbound = socket.recv_from(&mut buf) => {
                    match inbound {
                        Ok((len, source)) => {
                            if in_tx.send((source, buf[..len].to_vec())).await.is_err() {
                                info!("inbound channel closed; stopping udp endpoint");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(err = ?e, "udp recv failed");
                        }
                    }
                }
            }
        }
    });

    Ok((Arc::new(UdpEndpoint { local, out_tx }), in_rx, join))
}

/// Deterministic endpoint for tests: records every send.
pub struct ManualEndpoint {
    local: SocketAddr,
    sent: Mutex<Vec<(Vec<SocketAddr>, Vec<u8>)>>,
}

impl ManualEndpoint {
    /// Create a manual endpoint claiming `local` as its address.
    pub fn new(local: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            local,
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Drain every recorded send.
    pub fn drain_sent(&self) -> Vec<(Vec<SocketAddr>, Vec<u8>)> {
        match self.sent.lock() {
            Ok(mut sent) => std::mem::take(&mut *sent),
            Err(_) => Vec::new(),
        }
    }

    /// Drain the packets addressed to one peer.
    pub fn drain_sent_to(&self, peer: SocketAddr) -> Vec<Vec<u8>> {
        let Ok(mut sent) = self.sent.lock() else {
            return Vec::new();
        };
        let mut kept = Vec::new();
        let mut out = Vec::new();
        for (addresses, packet) in sent.drain(..) {
            if addresses.contains(&peer) {
                out.push(packet);
            } else {
                kept.push((addresses, packet));
            }
        }
        *sent = kept;
        out
    }

    /// Number of recorded sends.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Endpoint for ManualEndpoint {
    fn send(&self, addresses: &[SocketAddr], packet: &[u8]) -> Result<(), EndpointError> {
        if packet.len() > MAX_PACKET_BYTES {
            return Err(EndpointError::TooLarge);
        }
        let mut sent = self.sent.lock().map_err(|_| EndpointError::Io)?;
        sent.push((addresses.to_vec(), packet.to_vec()));
        Ok(())
    }

    fn local_address(&self) -> SocketAddr {
        self.local
    }
}
