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

//! Wire packet layout, signing bytes, and the decoded message instance.

use crate::core::payload::Payload;
use crate::core::policy::MetaMessage;
use crate::core::types::{
    decode_canonical_limited, encode_canonical, CodecError, CommunityId, GlobalTime, MemberId,
    PublicKey, Signature, MAX_PACKET_BYTES,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

/// Domain separation prefix for packet signatures.
const PACKET_SIGNING_PREFIX: &[u8] = b"dispersy-packet-v1";

/// Signer identity as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireIdentity {
    /// 20-byte mid; resolved through the member directory.
    Mid(MemberId),
    /// Full public key; receivers learn the binding.
    FullKey(PublicKey),
}

/// Authentication block of a packet body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireAuthentication {
    /// Unsigned.
    None,
    /// One signer.
    Member(WireIdentity),
    /// Two signers; signature slots follow this order.
    DoubleMember(WireIdentity, WireIdentity),
}

/// Distribution header of a packet body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireDistribution {
    /// Point-to-point.
    Relay {
        /// Claimed community clock value.
        global_time: GlobalTime,
    },
    /// One-shot broadcast.
    Direct {
        /// Claimed community clock value.
        global_time: GlobalTime,
    },
    /// Retain-all with per-member sequence numbers.
    FullSync {
        /// Claimed community clock value.
        global_time: GlobalTime,
        /// Per (member, meta) sequence number, starting at 1.
        sequence_number: u64,
    },
    /// Retain-last-N.
    LastSync {
        /// Claimed community clock value.
        global_time: GlobalTime,
    },
}

impl WireDistribution {
    /// Claimed global time.
    pub fn global_time(&self) -> GlobalTime {
        match self {
            WireDistribution::Relay { global_time }
            | WireDistribution::Direct { global_time }
            | WireDistribution::FullSync { global_time, .. }
            | WireDistribution::LastSync { global_time } => *global_time,
        }
    }

    /// Sequence number, for full-sync packets.
    pub fn sequence_number(&self) -> Option<u64> {
        match self {
            WireDistribution::FullSync { sequence_number, .. } => Some(*sequence_number),
            _ => None,
        }
    }
}

/// Destination block of a packet body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireDestination {
    /// Explicit endpoints.
    Address(Vec<SocketAddr>),
    /// Specific members.
    Member(Vec<MemberId>),
    /// Community flood.
    Community,
    /// Cluster-filtered flood.
    Similarity {
        /// Cluster selector.
        cluster: u16,
    },
}

/// The signed portion of a packet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketBody {
    /// Meta-message name.
    pub meta: String,
    /// Signer identities.
    pub authentication: WireAuthentication,
    /// Distribution header.
    pub distribution: WireDistribution,
    /// Destination header.
    pub destination: WireDestination,
    /// Payload.
    pub payload: Payload,
}

impl PacketBody {
    /// Canonical body bytes (the signed material).
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_canonical(self)
    }

    /// Decode body bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        decode_canonical_limited(bytes, MAX_PACKET_BYTES)
    }
}

/// A full on-wire packet: community routing id, body bytes, signatures.
///
/// The body stays serialized so signatures cover exactly the transmitted
/// bytes; `decode(encode(m)) == m` holds for well-formed messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePacket {
    /// Target community.
    pub community: CommunityId,
    /// Canonical `PacketBody` bytes.
    pub body: Vec<u8>,
    /// Signature per identity; empty vec for unauthenticated packets.
    pub signatures: Vec<Signature>,
}

impl WirePacket {
    /// Canonical packet bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_canonical(self)
    }

    /// Decode packet bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        decode_canonical_limited(bytes, MAX_PACKET_BYTES)
    }
}

/// Bytes each signer signs: domain prefix, community id, body.
pub fn packet_signing_bytes(community: &CommunityId, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PACKET_SIGNING_PREFIX.len() + 20 + body.len());
    out.extend_from_slice(PACKET_SIGNING_PREFIX);
    out.extend_from_slice(community.as_bytes());
    out.extend_from_slice(body);
    out
}

/// A member resolved against the directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberRef {
    /// Row id in the `member` table.
    pub database_id: i64,
    /// 20-byte mid.
    pub mid: MemberId,
    /// Verified public key.
    pub public_key: PublicKey,
}

/// Verified signer(s) of a decoded message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageOrigin {
    /// Unsigned message.
    None,
    /// Single verified signer.
    Member(MemberRef),
    /// Two verified signers, wire order.
    DoubleMember(MemberRef, MemberRef),
}

impl MessageOrigin {
    /// The first signer, when there is one.
    pub fn author(&self) -> Option<&MemberRef> {
        match self {
            MessageOrigin::None => None,
            MessageOrigin::Member(m) => Some(m),
            MessageOrigin::DoubleMember(a, _) => Some(a),
        }
    }

    /// All signers, wire order.
    pub fn members(&self) -> Vec<&MemberRef> {
        match self {
            MessageOrigin::None => Vec::new(),
            MessageOrigin::Member(m) => vec![m],
            MessageOrigin::DoubleMember(a, b) => vec![a, b],
        }
    }
}

/// A decoded, signature-verified message instance.
#[derive(Clone, Debug)]
pub struct Message {
    /// Its type.
    pub meta: Arc<MetaMessage>,
    /// Verified signers.
    pub origin: MessageOrigin,
    /// Distribution header.
    pub distribution: WireDistribution,
    /// Destination header.
    pub destination: WireDestination,
    /// Payload.
    pub payload: Payload,
    /// Canonical wire bytes (stored and forwarded verbatim).
    pub packet: Vec<u8>,
}

impl Message {
    /// Meta-message name.
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Claimed global time.
    pub fn global_time(&self) -> GlobalTime {
        self.distribution.global_time()
    }

    /// Sequence number, for full-sync messages.
    pub fn sequence_number(&self) -> Option<u64> {
        self.distribution.sequence_number()
    }

    /// First signer.
    pub fn author(&self) -> Option<&MemberRef> {
        self.origin.author()
    }
}
