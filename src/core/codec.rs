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

//! Packet decoder: opaque bytes to a verified [`Message`], a recoverable
//! delay, or a terminal drop. Control flow never unwinds; outcomes are values.

use crate::core::identity::{mid_of, verify};
use crate::core::member::MemberDirectory;
use crate::core::message::{
    packet_signing_bytes, MemberRef, Message, MessageOrigin, PacketBody, WireAuthentication,
    WireDestination, WireDistribution, WireIdentity, WirePacket,
};
use crate::core::payload::SequenceRange;
use crate::core::policy::{AuthEncoding, Authentication, Destination, Distribution, MetaMessage};
use crate::core::types::{CommunityId, GlobalTime, MemberId, Signature};
use crate::store::db::StoreError;
use std::sync::Arc;

/// Recoverable decode/check outcomes; the packet is parked until the missing
/// dependency arrives or the delay times out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DelayReason {
    /// Signer mid is unknown; request its identity.
    MissingMember {
        /// Unknown mid.
        mid: MemberId,
    },
    /// Signer mid is ambiguous (collision) and no known key verifies;
    /// request all bindings.
    UnspecifiedMember {
        /// Ambiguous mid.
        mid: MemberId,
    },
    /// A sequence gap precedes this message.
    MissingSequence {
        /// Message author.
        member: MemberId,
        /// Meta-message name.
        meta: String,
        /// The gap to backfill.
        range: SequenceRange,
    },
    /// Linear resolution found no permitting authorize chain.
    MissingProof {
        /// Message author.
        member: MemberId,
        /// Global time of the unproven message.
        global_time: GlobalTime,
    },
}

/// Terminal decode/check outcomes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Unparseable or structurally invalid.
    Malformed,
    /// No known key verifies the signature.
    BadSignature,
    /// Wire headers contradict the registered policies, or the sender is not
    /// permitted.
    ForbiddenPolicy,
    /// Already stored, or a sequence number we have already passed.
    Duplicate,
    /// Violates global-time monotonicity for the sequence stream.
    StaleGlobalTime,
    /// Community is soft-killed; admission is frozen.
    Frozen,
    /// A previously admitted message proves this one invalid; the proof is
    /// sent back to the origin.
    ByProof {
        /// Canonical wire bytes of the proof message.
        proof: Vec<u8>,
    },
}

/// Decoder outcome.
#[derive(Clone, Debug)]
pub enum Decoded {
    /// Fully decoded and signature-verified.
    Message(Box<Message>),
    /// Park and retry later.
    Delay(DelayReason),
    /// Discard.
    Drop(DropReason),
}

fn auth_matches(meta: &MetaMessage, wire: &WireAuthentication) -> bool {
    match (&meta.authentication, wire) {
        (Authentication::None, WireAuthentication::None) => true,
        (Authentication::Member { encoding }, WireAuthentication::Member(identity)) => {
            match (encoding, identity) {
                (AuthEncoding::Mid, WireIdentity::Mid(_)) => true,
                (AuthEncoding::FullKey, WireIdentity::FullKey(_)) => true,
                _ => false,
            }
        }
        (Authentication::DoubleMember, WireAuthentication::DoubleMember(a, b)) => {
            matches!(a, WireIdentity::Mid(_)) && matches!(b, WireIdentity::Mid(_))
        }
        _ => false,
    }
}

fn dist_matches(meta: &MetaMessage, wire: &WireDistribution) -> bool {
    matches!(
        (&meta.distribution, wire),
        (Distribution::Relay, WireDistribution::Relay { .. })
            | (Distribution::Direct, WireDistribution::Direct { .. })
            | (Distribution::FullSync { .. }, WireDistribution::FullSync { .. })
            | (Distribution::LastSync { .. }, WireDistribution::LastSync { .. })
    )
}

fn dest_matches(meta: &MetaMessage, wire: &WireDestination) -> bool {
    matches!(
        (&meta.destination, wire),
        (Destination::Address, WireDestination::Address(_))
            | (Destination::Member, WireDestination::Member(_))
            | (Destination::Community { .. }, WireDestination::Community)
            | (Destination::Similarity { .. }, WireDestination::Similarity { .. })
    )
}

enum Resolved {
    Member(MemberRef),
    Delay(DelayReason),
    Drop(DropReason),
}

/// Resolve one wire identity and verify its signature slot.
fn resolve_identity(
    directory: &MemberDirectory,
    identity: &WireIdentity,
    signing: &[u8],
    signature: &Signature,
    allow_placeholder: bool,
) -> Result<Resolved, StoreError> {
    match identity {
        WireIdentity::FullKey(key) => {
            if signature.is_placeholder() {
                if !allow_placeholder {
                    return Ok(Resolved::Drop(DropReason::BadSignature));
                }
                // Identity carried in full; trust deferred to the final check.
                let member = directory.learn(key)?;
                return Ok(Resolved::Member(member));
            }
            if !verify(key, signing, signature) {
                return Ok(Resolved::Drop(DropReason::BadSignature));
            }
            // Learning is safe: the key just proved itself.
            let member = directory.learn(key)?;
            Ok(Resolved::Member(member))
        }
        WireIdentity::Mid(mid) => {
            let candidates = directory.resolve(*mid)?;
            if candidates.is_empty() {
                return Ok(Resolved::Delay(DelayReason::MissingMember { mid: *mid }));
            }
            if signature.is_placeholder() {
                if !allow_placeholder {
                    return Ok(Resolved::Drop(DropReason::BadSignature));
                }
                // Placeholder slot: bind to the first candidate; the final
                // fully signed packet re-verifies.
                return Ok(Resolved::Member(candidates[0].clone()));
            }
            for candidate in &candidates {
                if verify(&candidate.public_key, signing, signature) {
                    return Ok(Resolved::Member(candidate.clone()));
                }
            }
            if candidates.len() > 1 {
                Ok(Resolved::Delay(DelayReason::UnspecifiedMember { mid: *mid }))
            } else {
                Ok(Resolved::Drop(DropReason::BadSignature))
            }
        }
    }
}

fn decode_inner(
    community: &CommunityId,
    lookup_meta: &dyn Fn(&str) -> Option<Arc<MetaMessage>>,
    directory: &MemberDirectory,
    bytes: &[u8],
    allow_placeholder: bool,
) -> Result<Decoded, StoreError> {
    let Ok(wire) = WirePacket::decode(bytes) else {
        return Ok(Decoded::Drop(DropReason::Malformed));
    };
    if &wire.community != community {
        return Ok(Decoded::Drop(DropReason::Malformed));
    }
    let Ok(body) = PacketBody::decode(&wire.body) else {
        return Ok(Decoded::Drop(DropReason::Malformed));
    };
    let Some(meta) = lookup_meta(&body.meta) else {
        return Ok(Decoded::Drop(DropReason::Malformed));
    };

    if !auth_matches(&meta, &body.authentication)
        || !dist_matches(&meta, &body.distribution)
        || !dest_matches(&meta, &body.destination)
    {
        return Ok(Decoded::Drop(DropReason::ForbiddenPolicy));
    }
    if body.distribution.global_time() == 0 {
        return Ok(Decoded::Drop(DropReason::Malformed));
    }
    if let Some(seq) = body.distribution.sequence_number() {
        if seq == 0 {
            return Ok(Decoded::Drop(DropReason::Malformed));
        }
    }

    let signing = packet_signing_bytes(community, &wire.body);
    let origin = match &body.authentication {
        WireAuthentication::None => {
            if !wire.signatures.is_empty() {
                return Ok(Decoded::Drop(DropReason::Malformed));
            }
            MessageOrigin::None
        }
        WireAuthentication::Member(identity) => {
            let [signature] = wire.signatures.as_slice() else {
                return Ok(Decoded::Drop(DropReason::Malformed));
            };
            match resolve_identity(directory, identity, &signing, signature, false)? {
                Resolved::Member(m) => MessageOrigin::Member(m),
                Resolved::Delay(d) => return Ok(Decoded::Delay(d)),
                Resolved::Drop(d) => return Ok(Decoded::Drop(d)),
            }
        }
        WireAuthentication::DoubleMember(first, second) => {
            let [sig_a, sig_b] = wire.signatures.as_slice() else {
                return Ok(Decoded::Drop(DropReason::Malformed));
            };
            let a = match resolve_identity(directory, first, &signing, sig_a, allow_placeholder)? {
                Resolved::Member(m) => m,
                Resolved::Delay(d) => return Ok(Decoded::Delay(d)),
                Resolved::Drop(d) => return Ok(Decoded::Drop(d)),
            };
            let b = match resolve_identity(directory, second, &signing, sig_b, allow_placeholder)? {
                Resolved::Member(m) => m,
                Resolved::Delay(d) => return Ok(Decoded::Delay(d)),
                Resolved::Drop(d) => return Ok(Decoded::Drop(d)),
            };
            if a.public_key == b.public_key {
                return Ok(Decoded::Drop(DropReason::Malformed));
            }
            MessageOrigin::DoubleMember(a, b)
        }
    };

    // The signer of an identity message must be the key it announces.
    if let WireAuthentication::Member(WireIdentity::FullKey(key)) = &body.authentication {
        if let Some(author) = origin.author() {
            if author.mid != mid_of(key) {
                return Ok(Decoded::Drop(DropReason::Malformed));
            }
        }
    }

    Ok(Decoded::Message(Box::new(Message {
        meta,
        origin,
        distribution: body.distribution,
        destination: body.destination,
        payload: body.payload,
        packet: bytes.to_vec(),
    })))
}

/// Decode and fully verify a packet.
pub fn decode_packet(
    community: &CommunityId,
    lookup_meta: &dyn Fn(&str) -> Option<Arc<MetaMessage>>,
    directory: &MemberDirectory,
    bytes: &[u8],
) -> Result<Decoded, StoreError> {
    decode_inner(community, lookup_meta, directory, bytes, false)
}

/// Decode a packet that may carry placeholder signature slots (the
/// double-member handshake). Placeholder slots skip verification; the fully
/// signed packet is re-verified before admission.
pub fn decode_partial_packet(
    community: &CommunityId,
    lookup_meta: &dyn Fn(&str) -> Option<Arc<MetaMessage>>,
    directory: &MemberDirectory,
    bytes: &[u8],
) -> Result<Decoded, StoreError> {
    decode_inner(community, lookup_meta, directory, bytes, true)
}
