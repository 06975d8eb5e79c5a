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

//! Policy registry: the four policy axes of a message type and the matrix of
//! legal combinations.

use crate::core::batch::BatchConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default meta-message priority when none is declared.
pub const DEFAULT_PRIORITY: u8 = 128;

/// Who must sign a message of this type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authentication {
    /// Unsigned.
    None,
    /// Exactly one signer.
    Member {
        /// How the signer identifies itself on the wire.
        encoding: AuthEncoding,
    },
    /// Exactly two signers; signature slots follow identity order.
    DoubleMember,
}

/// Wire encoding of a signer identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthEncoding {
    /// 20-byte mid only; the receiver resolves it through the directory.
    Mid,
    /// Full public key; lets receivers learn mid/key bindings.
    FullKey,
}

/// Who is permitted to create a message of this type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Anyone may send.
    Public,
    /// Requires an authorize chain anchored at the master member.
    Linear,
}

/// How a message spreads and how long it is retained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    /// Point-to-point, never stored or synced.
    Relay,
    /// One-shot broadcast, never stored or synced.
    Direct,
    /// Retain everything; sequence-numbered per member.
    FullSync {
        /// Emission order when served over sync.
        order: SyncOrder,
    },
    /// Retain the newest `history` messages per retention key.
    LastSync {
        /// Emission order when served over sync.
        order: SyncOrder,
        /// Messages kept per key; must be at least 1.
        history: u64,
    },
}

impl Distribution {
    /// True for the distributions served by the sync responder.
    pub fn is_synced(&self) -> bool {
        matches!(self, Distribution::FullSync { .. } | Distribution::LastSync { .. })
    }

    /// Emission order, for synced distributions.
    pub fn sync_order(&self) -> Option<SyncOrder> {
        match self {
            Distribution::FullSync { order } | Distribution::LastSync { order, .. } => Some(*order),
            _ => None,
        }
    }
}

/// Order in which stored messages are emitted in a sync response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOrder {
    /// Ascending global time.
    Ascending,
    /// Descending global time.
    Descending,
    /// Shuffled.
    Random,
}

/// Where a message is addressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    /// Explicit UDP endpoints.
    Address,
    /// Specific member ids.
    Member,
    /// Flood to the community.
    Community {
        /// Fan-out when forwarding.
        node_count: u32,
    },
    /// Community subset filtered by feature-vector cluster.
    Similarity {
        /// Cluster selector.
        cluster: u16,
    },
}

/// Policy-mismatch error raised at registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("{0} does not support {1}")]
    Incompatible(&'static str, &'static str),
    #[error("last-sync history must be at least 1")]
    EmptyHistory,
}

fn auth_name(a: &Authentication) -> &'static str {
    match a {
        Authentication::None => "NoAuthentication",
        Authentication::Member { .. } => "MemberAuthentication",
        Authentication::DoubleMember => "DoubleMemberAuthentication",
    }
}

fn dist_name(d: &Distribution) -> &'static str {
    match d {
        Distribution::Relay => "RelayDistribution",
        Distribution::Direct => "DirectDistribution",
        Distribution::FullSync { .. } => "FullSyncDistribution",
        Distribution::LastSync { .. } => "LastSyncDistribution",
    }
}

fn dest_name(d: &Destination) -> &'static str {
    match d {
        Destination::Address => "AddressDestination",
        Destination::Member => "MemberDestination",
        Destination::Community { .. } => "CommunityDestination",
        Destination::Similarity { .. } => "SimilarityDestination",
    }
}

fn res_name(r: &Resolution) -> &'static str {
    match r {
        Resolution::Public => "PublicResolution",
        Resolution::Linear => "LinearResolution",
    }
}

/// Validate one (authentication, resolution, distribution, destination)
/// combination against the legality matrix.
pub fn check_policy_combination(
    authentication: &Authentication,
    resolution: &Resolution,
    distribution: &Distribution,
    destination: &Destination,
) -> Result<(), PolicyError> {
    use Authentication as A;
    use Destination as De;
    use Distribution as Di;
    use Resolution as R;

    match authentication {
        A::None => {
            if !matches!(resolution, R::Public) {
                return Err(PolicyError::Incompatible(auth_name(authentication), res_name(resolution)));
            }
            if !matches!(distribution, Di::Relay | Di::Direct) {
                return Err(PolicyError::Incompatible(auth_name(authentication), dist_name(distribution)));
            }
            if matches!(destination, De::Similarity { .. }) {
                return Err(PolicyError::Incompatible(auth_name(authentication), dest_name(destination)));
            }
        }
        A::Member { .. } => {}
        A::DoubleMember => {
            if matches!(distribution, Di::FullSync { .. }) {
                return Err(PolicyError::Incompatible(auth_name(authentication), dist_name(distribution)));
            }
        }
    }

    if matches!(resolution, R::Linear) && matches!(authentication, A::None) {
        return Err(PolicyError::Incompatible(res_name(resolution), auth_name(authentication)));
    }

    match distribution {
        Di::Relay => {
            if !matches!(destination, De::Address | De::Member) {
                return Err(PolicyError::Incompatible(dist_name(distribution), dest_name(destination)));
            }
        }
        Di::Direct => {
            if matches!(destination, De::Similarity { .. }) {
                return Err(PolicyError::Incompatible(dist_name(distribution), dest_name(destination)));
            }
        }
        Di::FullSync { .. } => {
            if !matches!(authentication, A::Member { .. }) {
                return Err(PolicyError::Incompatible(dist_name(distribution), auth_name(authentication)));
            }
            if !matches!(destination, De::Community { .. } | De::Similarity { .. }) {
                return Err(PolicyError::Incompatible(dist_name(distribution), dest_name(destination)));
            }
        }
        Di::LastSync { history, .. } => {
            if *history == 0 {
                return Err(PolicyError::EmptyHistory);
            }
            if matches!(authentication, A::None) {
                return Err(PolicyError::Incompatible(dist_name(distribution), auth_name(authentication)));
            }
            if !matches!(destination, De::Community { .. } | De::Similarity { .. }) {
                return Err(PolicyError::Incompatible(dist_name(distribution), dest_name(destination)));
            }
        }
    }

    if matches!(destination, De::Similarity { .. }) && !distribution.is_synced() {
        return Err(PolicyError::Incompatible(dest_name(destination), dist_name(distribution)));
    }

    Ok(())
}

/// Immutable template for a message type.
///
/// Registration validates the policy combination; a `MetaMessage` that exists
/// is guaranteed legal (invariant I1).
#[derive(Clone, Debug)]
pub struct MetaMessage {
    /// Unique name within the community schema.
    pub name: String,
    /// Row id in the `meta_message` table.
    pub database_id: i64,
    /// Declaration order within the community schema.
    pub index: usize,
    /// Signing policy.
    pub authentication: Authentication,
    /// Permission policy.
    pub resolution: Resolution,
    /// Spread/retention policy.
    pub distribution: Distribution,
    /// Addressing policy.
    pub destination: Destination,
    /// Optional ingestion batch window.
    pub batch: Option<BatchConfig>,
    /// Sync priority (higher first).
    pub priority: u8,
}

impl MetaMessage {
    /// Validate and build a meta message.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        database_id: i64,
        index: usize,
        authentication: Authentication,
        resolution: Resolution,
        distribution: Distribution,
        destination: Destination,
        batch: Option<BatchConfig>,
        priority: Option<u8>,
    ) -> Result<Self, PolicyError> {
        check_policy_combination(&authentication, &resolution, &distribution, &destination)?;
        Ok(Self {
            name: name.into(),
            database_id,
            index,
            authentication,
            resolution,
            distribution,
            destination,
            batch,
            priority: priority.unwrap_or(DEFAULT_PRIORITY),
        })
    }
}
