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

use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Loaded communities gauge.
    pub communities: IntGauge,

    /// Packets parked on a missing dependency.
    pub packets_delayed_total: IntCounter,
    /// Parked packets that expired unresolved.
    pub packets_expired_total: IntCounter,
    /// Packets terminally dropped.
    pub packets_dropped_total: IntCounter,
    /// Batches committed.
    pub batches_committed_total: IntCounter,
    /// Messages admitted into the store.
    pub messages_stored_total: IntCounter,
    /// Packets served in sync responses.
    pub sync_responses_total: IntCounter,
    /// Proof counter-messages sent.
    pub proofs_sent_total: IntCounter,
    /// Proof counter-messages suppressed by the per-origin bucket.
    pub proofs_throttled_total: IntCounter,
    /// Signature requests that timed out.
    pub signature_timeouts_total: IntCounter,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let communities = IntGauge::new("dispersy_communities", "Loaded communities")
            .map_err(|_| MetricsError::Prom)?;
        let packets_delayed_total = IntCounter::new(
            "dispersy_packets_delayed_total",
            "Packets parked on a missing dependency",
        )
        .map_err(|_| MetricsError::Prom)?;
        let packets_expired_total = IntCounter::new(
            "dispersy_packets_expired_total",
            "Parked packets dropped at timeout",
        )
        .map_err(|_| MetricsError::Prom)?;
        let packets_dropped_total =
            IntCounter::new("dispersy_packets_dropped_total", "Packets terminally dropped")
                .map_err(|_| MetricsError::Prom)?;
        let batches_committed_total =
            IntCounter::new("dispersy_batches_committed_total", "Batches committed")
                .map_err(|_| MetricsError::Prom)?;
        let messages_stored_total =
            IntCounter::new("dispersy_messages_stored_total", "Messages admitted")
                .map_err(|_| MetricsError::Prom)?;
        let sync_responses_total = IntCounter::new(
            "dispersy_sync_responses_total",
            "Packets served in sync responses",
        )
        .map_err(|_| MetricsError::Prom)?;
        let proofs_sent_total =
            IntCounter::new("dispersy_proofs_sent_total", "Proof counter-messages sent")
                .map_err(|_| MetricsError::Prom)?;
        let proofs_throttled_total = IntCounter::new(
            "dispersy_proofs_throttled_total",
            "Proof counter-messages suppressed",
        )
        .map_err(|_| MetricsError::Prom)?;
        let signature_timeouts_total = IntCounter::new(
            "dispersy_signature_timeouts_total",
            "Signature requests timed out",
        )
        .map_err(|_| MetricsError::Prom)?;

        registry
            .register(Box::new(communities.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(packets_delayed_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(packets_expired_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(packets_dropped_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(batches_committed_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(messages_stored_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(sync_responses_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(proofs_sent_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(proofs_throttled_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(signature_timeouts_total.clone()))
            .map_err(|_| MetricsError::Prom)?;

        Ok(Self {
            registry,
            communities,
            packets_delayed_total,
            packets_expired_total,
            packets_dropped_total,
            batches_committed_total,
            messages_stored_total,
            sync_responses_total,
            proofs_sent_total,
            proofs_throttled_total,
            signature_timeouts_total,
        })
    }
}
