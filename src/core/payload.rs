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

//! Message payload variants: application permits, permission-graph mutations,
//! and the control payloads of the reserved meta messages.

use crate::core::bloom::BloomFilter;
use crate::core::types::{GlobalTime, MemberId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Permission kinds tracked by the permission graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionKind {
    /// May create permit (application) messages of a meta.
    Permit,
    /// May grant permissions for a meta.
    Authorize,
    /// May revoke permissions for a meta.
    Revoke,
}

/// One permission-graph edge: member × meta name × kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Grantee mid.
    pub member: MemberId,
    /// Meta-message name the grant applies to.
    pub meta: String,
    /// Granted kind.
    pub kind: PermissionKind,
}

/// Kill degree of a destroy-community message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillDegree {
    /// Wipe every stored message; only the tombstone remains.
    Hard,
    /// Freeze admission of new messages; retain existing ones.
    Soft,
}

/// Sync tuple carried inside an introduction request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Lower global-time bound (inclusive).
    pub time_low: GlobalTime,
    /// Upper global-time bound (inclusive); 0 means unbounded.
    pub time_high: GlobalTime,
    /// Modulo selector; at least 1.
    pub modulo: u64,
    /// Offset added before the modulo test.
    pub offset: u64,
    /// Packets the requester already holds.
    pub bloom: BloomFilter,
}

/// Introduction request: candidate exchange plus an optional sync tuple.
/// Only the sync portion is interpreted by this core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroductionRequest {
    /// Address the requester believes it is talking to.
    pub destination_address: SocketAddr,
    /// Requester LAN address.
    pub source_lan_address: SocketAddr,
    /// Requester WAN address.
    pub source_wan_address: SocketAddr,
    /// Whether the requester wants an introduction to a third peer.
    pub advice: bool,
    /// Request identifier echoed in responses.
    pub identifier: u16,
    /// Optional sync tuple.
    pub sync: Option<SyncRequest>,
}

/// A contiguous range of missing sequence numbers (inclusive).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    /// First missing sequence number.
    pub low: u64,
    /// Last missing sequence number.
    pub high: u64,
}

/// Message payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Application data.
    Permit(Vec<u8>),
    /// Grant permissions.
    Authorize {
        /// Granted edges.
        grants: Vec<PermissionGrant>,
    },
    /// Revoke permissions.
    Revoke {
        /// Revoked edges.
        grants: Vec<PermissionGrant>,
    },
    /// `dispersy-identity`: announces the signer's key binding. The key
    /// itself travels in the authentication (full-key encoding).
    Identity,
    /// `dispersy-missing-identity`: request the identity messages of a mid.
    MissingIdentity {
        /// The mid whose key bindings are requested.
        mid: MemberId,
    },
    /// `dispersy-missing-sequence`: request a sequence range of a member.
    MissingSequence {
        /// Message author the range refers to.
        member: MemberId,
        /// Meta-message name the range refers to.
        meta: String,
        /// Missing range.
        range: SequenceRange,
    },
    /// `dispersy-missing-message`: request stored packets by global time.
    MissingMessage {
        /// Message author.
        member: MemberId,
        /// Slots requested.
        global_times: Vec<GlobalTime>,
    },
    /// `dispersy-missing-proof`: request the authorize chain that permits a
    /// stored message.
    MissingProof {
        /// Author of the unproven message.
        member: MemberId,
        /// Global time of the unproven message.
        global_time: GlobalTime,
    },
    /// `dispersy-signature-request`: first half of the double-member
    /// handshake. Carries the partially signed packet.
    SignatureRequest {
        /// Handshake identifier.
        identifier: u32,
        /// Canonical wire bytes of the partially signed packet.
        packet: Vec<u8>,
        /// Global time claimed by the initiator.
        global_time: GlobalTime,
    },
    /// `dispersy-signature-response`: second half of the handshake. Carries
    /// the fully signed packet.
    SignatureResponse {
        /// Handshake identifier.
        identifier: u32,
        /// Canonical wire bytes of the fully signed packet.
        packet: Vec<u8>,
    },
    /// `dispersy-introduction-request`: walk step plus sync tuple.
    IntroductionRequest(IntroductionRequest),
    /// `dispersy-destroy-community`: wipe or freeze the community.
    DestroyCommunity {
        /// Kill degree.
        degree: KillDegree,
    },
}

impl Payload {
    /// Permission kind required to create a message carrying this payload
    /// under linear resolution.
    pub fn required_permission(&self) -> PermissionKind {
        match self {
            Payload::Authorize { .. } => PermissionKind::Authorize,
            Payload::Revoke { .. } => PermissionKind::Revoke,
            _ => PermissionKind::Permit,
        }
    }
}
