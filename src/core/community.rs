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
#![allow(missing_docs)]

//! Community: a named group of peers sharing a message schema.
//!
//! Owns the ingestion pipeline (decode, check, commit), the delay queue, the
//! permission graph, the double-member handshake state, and the clock.

use crate::config::CoreConfig;
use crate::core::batch::BatchConfig;
use crate::core::codec::{decode_packet, decode_partial_packet, Decoded, DelayReason, DropReason};
use crate::core::delay::{DelayKey, DelayQueue};
use crate::core::identity::{mid_of, LocalIdentity};
use crate::core::member::MemberDirectory;
use crate::core::message::{
    packet_signing_bytes, MemberRef, Message, MessageOrigin, PacketBody, WireAuthentication,
    WireDestination, WireDistribution, WireIdentity, WirePacket,
};
use crate::core::payload::{
    IntroductionRequest, KillDegree, Payload, PermissionGrant, PermissionKind, SequenceRange,
    SyncRequest,
};
use crate::core::policy::{
    AuthEncoding, Authentication, Destination, Distribution, MetaMessage, PolicyError, SyncOrder,
};
use crate::core::sequence::{self, SequenceVerdict};
use crate::core::signer::{PendingSignature, SignatureCoordinator};
use crate::core::sync;
use crate::core::types::{
    CommunityId, GlobalTime, MemberId, PublicKey, Signature, GLOBAL_TIME_TOMBSTONE,
};
use crate::monitoring::metrics::Metrics;
use crate::networking::endpoint::Endpoint;
use crate::store::db::{Database, StoreError};
use crate::store::messages;
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reserved meta-message names.
pub mod names {
    pub const IDENTITY: &str = "dispersy-identity";
    pub const MISSING_IDENTITY: &str = "dispersy-missing-identity";
    pub const MISSING_SEQUENCE: &str = "dispersy-missing-sequence";
    pub const MISSING_MESSAGE: &str = "dispersy-missing-message";
    pub const MISSING_PROOF: &str = "dispersy-missing-proof";
    pub const SIGNATURE_REQUEST: &str = "dispersy-signature-request";
    pub const SIGNATURE_RESPONSE: &str = "dispersy-signature-response";
    pub const INTRODUCTION_REQUEST: &str = "dispersy-introduction-request";
    pub const DESTROY_COMMUNITY: &str = "dispersy-destroy-community";
    pub const AUTHORIZE: &str = "dispersy-authorize";
    pub const REVOKE: &str = "dispersy-revoke";
}

/// User-visible API errors; returned, never thrown across suspension points.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("policy mismatch")]
    PolicyMismatch,
    #[error("not authorised")]
    NotAuthorised,
    #[error("timeout")]
    Timeout,
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("internal")]
    Internal,
}

impl From<StoreError> for CoreError {
    fn from(_: StoreError) -> Self {
        CoreError::StoreUnavailable
    }
}

impl From<PolicyError> for CoreError {
    fn from(_: PolicyError) -> Self {
        CoreError::PolicyMismatch
    }
}

/// Per-origin token bucket limiting proof counter-messages.
struct ProofBucket {
    tokens: u32,
    last_refill: Instant,
}

impl ProofBucket {
    fn new(burst: u32, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
        }
    }

    fn allow(&mut self, burst: u32, per_sec: u32, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs();
        if elapsed > 0 {
            let refill = elapsed.saturating_mul(per_sec as u64).min(burst as u64) as u32;
            self.tokens = (self.tokens + refill).min(burst);
            self.last_refill = now;
        }
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }
}

/// Deferred commit effects, applied after the transaction: packets to park
/// (with their delay reason) and typed terminal drops.
#[derive(Default)]
struct CommitOutput {
    parks: Vec<(SocketAddr, Vec<u8>, DelayReason)>,
    drops: Vec<(SocketAddr, DropReason)>,
    /// (author mid, meta name, new stored max) for delay-queue release.
    seq_triggers: Vec<(MemberId, String, u64)>,
    grants: Vec<PermissionGrant>,
    revokes: Vec<PermissionGrant>,
    degree: Option<KillDegree>,
    stored: u64,
    max_global_time: GlobalTime,
}

pub struct Community {
    id: CommunityId,
    database_id: i64,
    master: MemberRef,
    my_member: MemberRef,
    identity: Arc<LocalIdentity>,
    metas: Vec<Arc<MetaMessage>>,
    by_name: HashMap<String, usize>,
    global_time: GlobalTime,
    frozen: bool,
    db: Arc<Database>,
    directory: Arc<MemberDirectory>,
    endpoint: Arc<dyn Endpoint>,
    delay: DelayQueue,
    signer: SignatureCoordinator,
    permissions: HashMap<(MemberId, String), HashSet<PermissionKind>>,
    proof_buckets: HashMap<SocketAddr, ProofBucket>,
    metrics: Arc<Metrics>,
    config: CoreConfig,
}

impl Community {
    /// Join (or create) the community anchored at `master_key`.
    pub fn new(
        master_key: PublicKey,
        identity: Arc<LocalIdentity>,
        db: Arc<Database>,
        directory: Arc<MemberDirectory>,
        endpoint: Arc<dyn Endpoint>,
        metrics: Arc<Metrics>,
        config: CoreConfig,
    ) -> Result<Self, CoreError> {
        let master = directory.learn(&master_key)?;
        let my_member = directory.learn(identity.public_key())?;
        let id = CommunityId::from_bytes(*mid_of(&master_key).as_bytes());

        let (database_id, global_time, degree) = db.with_conn(|c| {
            messages::community_register(c, id.as_bytes(), my_member.database_id)
        })?;
        let frozen = degree.is_some();

        let mut community = Self {
            id,
            database_id,
            master,
            my_member,
            identity,
            metas: Vec::new(),
            by_name: HashMap::new(),
            global_time: global_time.max(1),
            frozen,
            db,
            directory,
            endpoint,
            delay: DelayQueue::new(),
            signer: SignatureCoordinator::new(),
            permissions: HashMap::new(),
            proof_buckets: HashMap::new(),
            metrics,
            config,
        };
        community.register_core_metas()?;
        community.metrics.communities.inc();
        info!(community = ?community.id, "community loaded");
        Ok(community)
    }

    fn register_core_metas(&mut self) -> Result<(), CoreError> {
        use names::*;
        let member_mid = Authentication::Member {
            encoding: AuthEncoding::Mid,
        };
        let member_key = Authentication::Member {
            encoding: AuthEncoding::FullKey,
        };
        let direct_address = (Distribution::Direct, Destination::Address);

        self.register_meta(
            IDENTITY,
            member_key,
            crate::core::policy::Resolution::Public,
            Distribution::LastSync {
                order: SyncOrder::Ascending,
                history: 1,
            },
            Destination::Community { node_count: 10 },
            None,
            Some(16),
        )?;
        for name in [
            MISSING_IDENTITY,
            MISSING_SEQUENCE,
            MISSING_MESSAGE,
            MISSING_PROOF,
            SIGNATURE_REQUEST,
            SIGNATURE_RESPONSE,
        ] {
            self.register_meta(
                name,
                Authentication::None,
                crate::core::policy::Resolution::Public,
                direct_address.0,
                direct_address.1,
                None,
                None,
            )?;
        }
        self.register_meta(
            INTRODUCTION_REQUEST,
            member_mid,
            crate::core::policy::Resolution::Public,
            Distribution::Direct,
            Destination::Address,
            None,
            None,
        )?;
        self.register_meta(
            AUTHORIZE,
            member_mid,
            crate::core::policy::Resolution::Linear,
            Distribution::FullSync {
                order: SyncOrder::Ascending,
            },
            Destination::Community { node_count: 10 },
            None,
            Some(160),
        )?;
        self.register_meta(
            REVOKE,
            member_mid,
            crate::core::policy::Resolution::Linear,
            Distribution::FullSync {
                order: SyncOrder::Ascending,
            },
            Destination::Community { node_count: 10 },
            None,
            Some(160),
        )?;
        self.register_meta(
            DESTROY_COMMUNITY,
            member_mid,
            crate::core::policy::Resolution::Linear,
            Distribution::FullSync {
                order: SyncOrder::Ascending,
            },
            Destination::Community { node_count: 10 },
            None,
            Some(192),
        )?;
        Ok(())
    }

    /// Register an application meta message.
    #[allow(clippy::too_many_arguments)]
    pub fn register_meta(
        &mut self,
        name: &str,
        authentication: Authentication,
        resolution: crate::core::policy::Resolution,
        distribution: Distribution,
        destination: Destination,
        batch: Option<BatchConfig>,
        priority: Option<u8>,
    ) -> Result<Arc<MetaMessage>, CoreError> {
        if self.by_name.contains_key(name) {
            return Err(CoreError::PolicyMismatch);
        }
        let database_id = self
            .db
            .with_conn(|c| messages::meta_register(c, self.database_id, name))?;
        let index = self.metas.len();
        let meta = Arc::new(MetaMessage::new(
            name,
            database_id,
            index,
            authentication,
            resolution,
            distribution,
            destination,
            batch,
            priority,
        )?);
        self.metas.push(meta.clone());
        self.by_name.insert(name.to_string(), index);
        Ok(meta)
    }

    // ---- accessors -------------------------------------------------------

    pub fn id(&self) -> CommunityId {
        self.id
    }

    pub fn database_id(&self) -> i64 {
        self.database_id
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    pub fn my_member(&self) -> &MemberRef {
        &self.my_member
    }

    pub fn master(&self) -> &MemberRef {
        &self.master
    }

    pub fn global_time(&self) -> GlobalTime {
        self.global_time
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn meta(&self, name: &str) -> Option<Arc<MetaMessage>> {
        self.by_name.get(name).map(|i| self.metas[*i].clone())
    }

    pub fn metas(&self) -> &[Arc<MetaMessage>] {
        &self.metas
    }

    /// Meta index and batch window of a packet, without verification.
    pub fn classify_packet(&self, bytes: &[u8]) -> Option<(usize, Option<BatchConfig>)> {
        let wire = WirePacket::decode(bytes).ok()?;
        if wire.community != self.id {
            return None;
        }
        let body = PacketBody::decode(&wire.body).ok()?;
        let index = *self.by_name.get(&body.meta)?;
        Some((index, self.metas[index].batch))
    }

    // ---- clock -----------------------------------------------------------

    /// Claim the next global time for a locally authored message.
    pub fn claim_global_time(&mut self) -> Result<GlobalTime, CoreError> {
        self.global_time += 1;
        let gt = self.global_time;
        self.db.with_conn(|c| {
            messages::community_update_global_time(c, self.database_id, gt)
        })?;
        Ok(gt)
    }

    fn merge_global_time(&mut self, observed: GlobalTime) -> Result<(), CoreError> {
        if observed > self.global_time && observed < GLOBAL_TIME_TOMBSTONE {
            self.global_time = observed;
            let gt = self.global_time;
            self.db.with_conn(|c| {
                messages::community_update_global_time(c, self.database_id, gt)
            })?;
        }
        Ok(())
    }

    // ---- permissions -----------------------------------------------------

    fn is_permitted(&self, mid: MemberId, meta_name: &str, kind: PermissionKind) -> bool {
        if mid == self.master.mid {
            return true;
        }
        self.permissions
            .get(&(mid, meta_name.to_string()))
            .map(|kinds| kinds.contains(&kind))
            .unwrap_or(false)
    }

    // ---- message creation ------------------------------------------------

    fn wire_authentication(&self, meta: &MetaMessage) -> Result<WireAuthentication, CoreError> {
        match meta.authentication {
            Authentication::None => Ok(WireAuthentication::None),
            Authentication::Member { encoding: AuthEncoding::Mid } => {
                Ok(WireAuthentication::Member(WireIdentity::Mid(self.my_member.mid)))
            }
            Authentication::Member { encoding: AuthEncoding::FullKey } => Ok(
                WireAuthentication::Member(WireIdentity::FullKey(self.my_member.public_key.clone())),
            ),
            // Double-member messages go through the signature handshake.
            Authentication::DoubleMember => Err(CoreError::PolicyMismatch),
        }
    }

    fn default_destination(&self, meta: &MetaMessage) -> WireDestination {
        match meta.destination {
            Destination::Address => WireDestination::Address(Vec::new()),
            Destination::Member => WireDestination::Member(Vec::new()),
            Destination::Community { .. } => WireDestination::Community,
            Destination::Similarity { cluster } => WireDestination::Similarity { cluster },
        }
    }

    fn build_message(
        &mut self,
        meta: Arc<MetaMessage>,
        payload: Payload,
        global_time: Option<GlobalTime>,
        sequence: Option<u64>,
        destination: Option<WireDestination>,
    ) -> Result<Message, CoreError> {
        if meta.resolution == crate::core::policy::Resolution::Linear
            && !self.is_permitted(
                self.my_member.mid,
                &meta.name,
                payload.required_permission(),
            )
        {
            return Err(CoreError::NotAuthorised);
        }

        let gt = match global_time {
            Some(gt) => {
                self.merge_global_time(gt)?;
                gt
            }
            None => self.claim_global_time()?,
        };

        let distribution = match meta.distribution {
            Distribution::Relay => WireDistribution::Relay { global_time: gt },
            Distribution::Direct => WireDistribution::Direct { global_time: gt },
            Distribution::FullSync { .. } => {
                let seq = match sequence {
                    Some(seq) => seq,
                    None => {
                        let (community, member, meta_id) =
                            (self.database_id, self.my_member.database_id, meta.database_id);
                        self.db
                            .with_conn(|c| messages::sync_count(c, community, member, meta_id))?
                            + 1
                    }
                };
                WireDistribution::FullSync {
                    global_time: gt,
                    sequence_number: seq,
                }
            }
            Distribution::LastSync { .. } => WireDistribution::LastSync { global_time: gt },
        };

        let destination = destination.unwrap_or_else(|| self.default_destination(&meta));
        let authentication = self.wire_authentication(&meta)?;

        let body = PacketBody {
            meta: meta.name.clone(),
            authentication: authentication.clone(),
            distribution,
            destination: destination.clone(),
            payload: payload.clone(),
        };
        let body_bytes = body.encode().map_err(|_| CoreError::Internal)?;
        let signing = packet_signing_bytes(&self.id, &body_bytes);
        let signatures = match authentication {
            WireAuthentication::None => Vec::new(),
            _ => vec![self.identity.sign(&signing)],
        };
        let wire = WirePacket {
            community: self.id,
            body: body_bytes,
            signatures,
        };
        let packet = wire.encode().map_err(|_| CoreError::Internal)?;

        let origin = match meta.authentication {
            Authentication::None => MessageOrigin::None,
            _ => MessageOrigin::Member(self.my_member.clone()),
        };

        Ok(Message {
            meta,
            origin,
            distribution,
            destination,
            payload,
            packet,
        })
    }

    /// Create a message for a community-destined meta.
    pub fn create_message(
        &mut self,
        name: &str,
        payload: Payload,
        global_time: Option<GlobalTime>,
        sequence: Option<u64>,
    ) -> Result<Message, CoreError> {
        let meta = self.meta(name).ok_or(CoreError::PolicyMismatch)?;
        self.build_message(meta, payload, global_time, sequence, None)
    }

    /// Create a message addressed to explicit endpoints.
    pub fn create_addressed(
        &mut self,
        name: &str,
        payload: Payload,
        addresses: Vec<SocketAddr>,
    ) -> Result<Message, CoreError> {
        let meta = self.meta(name).ok_or(CoreError::PolicyMismatch)?;
        self.build_message(
            meta,
            payload,
            None,
            None,
            Some(WireDestination::Address(addresses)),
        )
    }

    /// Create our identity announcement.
    pub fn create_identity(&mut self) -> Result<Message, CoreError> {
        self.create_message(names::IDENTITY, Payload::Identity, None, None)
    }

    /// Create an introduction request carrying an optional sync tuple.
    pub fn create_introduction_request(
        &mut self,
        destination: SocketAddr,
        identifier: u16,
        sync: Option<SyncRequest>,
    ) -> Result<Message, CoreError> {
        let local = self.endpoint.local_address();
        self.create_addressed(
            names::INTRODUCTION_REQUEST,
            Payload::IntroductionRequest(IntroductionRequest {
                destination_address: destination,
                source_lan_address: local,
                source_wan_address: local,
                advice: false,
                identifier,
                sync,
            }),
            vec![destination],
        )
    }

    /// Create a missing-sequence request.
    pub fn create_missing_sequence(
        &mut self,
        member: MemberId,
        meta_name: &str,
        range: SequenceRange,
        to: SocketAddr,
    ) -> Result<Message, CoreError> {
        self.create_addressed(
            names::MISSING_SEQUENCE,
            Payload::MissingSequence {
                member,
                meta: meta_name.to_string(),
                range,
            },
            vec![to],
        )
    }

    /// Create a missing-message request for explicit global times.
    pub fn create_missing_message(
        &mut self,
        member: MemberId,
        global_times: Vec<GlobalTime>,
        to: SocketAddr,
    ) -> Result<Message, CoreError> {
        self.create_addressed(
            names::MISSING_MESSAGE,
            Payload::MissingMessage {
                member,
                global_times,
            },
            vec![to],
        )
    }

    /// Create a destroy-community message (master or authorised members).
    pub fn create_destroy(&mut self, degree: KillDegree) -> Result<Message, CoreError> {
        self.create_message(
            names::DESTROY_COMMUNITY,
            Payload::DestroyCommunity { degree },
            None,
            None,
        )
    }

    /// Build the partially signed submessage of a double-member meta: our
    /// slot is signed, the counter-signer slot is a placeholder.
    pub fn create_double_signed_submessage(
        &mut self,
        name: &str,
        payload: Payload,
        counter_signer: MemberId,
        global_time: Option<GlobalTime>,
    ) -> Result<Vec<u8>, CoreError> {
        let meta = self.meta(name).ok_or(CoreError::PolicyMismatch)?;
        if meta.authentication != Authentication::DoubleMember {
            return Err(CoreError::PolicyMismatch);
        }
        let gt = match global_time {
            Some(gt) => {
                self.merge_global_time(gt)?;
                gt
            }
            None => self.claim_global_time()?,
        };
        let body = PacketBody {
            meta: meta.name.clone(),
            authentication: WireAuthentication::DoubleMember(
                WireIdentity::Mid(self.my_member.mid),
                WireIdentity::Mid(counter_signer),
            ),
            distribution: WireDistribution::LastSync { global_time: gt },
            destination: self.default_destination(&meta),
            payload,
        };
        let body_bytes = body.encode().map_err(|_| CoreError::Internal)?;
        let signing = packet_signing_bytes(&self.id, &body_bytes);
        let wire = WirePacket {
            community: self.id,
            body: body_bytes,
            signatures: vec![self.identity.sign(&signing), Signature::placeholder()],
        };
        wire.encode().map_err(|_| CoreError::Internal)
    }

    /// Wrap a partially signed submessage into a signature request and track
    /// it until the response or the timeout.
    pub fn create_signature_request(
        &mut self,
        identifier: u32,
        submessage: Vec<u8>,
        to: SocketAddr,
    ) -> Result<Message, CoreError> {
        let wire = WirePacket::decode(&submessage).map_err(|_| CoreError::PolicyMismatch)?;
        let body = PacketBody::decode(&wire.body).map_err(|_| CoreError::PolicyMismatch)?;
        let global_time = body.distribution.global_time();
        if !self.signer.register(
            identifier,
            PendingSignature {
                deadline: Instant::now() + self.config.signature_timeout,
                body: wire.body.clone(),
            },
        ) {
            return Err(CoreError::PolicyMismatch);
        }
        self.create_addressed(
            names::SIGNATURE_REQUEST,
            Payload::SignatureRequest {
                identifier,
                packet: submessage,
                global_time,
            },
            vec![to],
        )
    }

    // ---- ingestion pipeline ---------------------------------------------

    /// Decode, check, and commit a burst of packets from one source.
    pub fn handle_packets(
        &mut self,
        source: SocketAddr,
        packets: Vec<Vec<u8>>,
    ) -> Result<(), CoreError> {
        self.handle_batch(packets.into_iter().map(|p| (source, p)).collect())
    }

    /// Decode, check, and commit one batch of (source, packet) pairs.
    ///
    /// Control responses, backfill requests, and proof counter-messages go
    /// out through the endpoint; released parked packets re-enter the
    /// pipeline until a fixed point.
    pub fn handle_batch(
        &mut self,
        packets: Vec<(SocketAddr, Vec<u8>)>,
    ) -> Result<(), CoreError> {
        let mut worklist: Vec<Vec<(SocketAddr, Vec<u8>)>> = vec![packets];
        let mut rounds = 0usize;
        while let Some(pairs) = worklist.pop() {
            rounds += 1;
            if rounds > 64 {
                warn!(community = ?self.id, "ingestion fixed point not reached; deferring");
                break;
            }
            let released = self.process_round(pairs)?;
            if !released.is_empty() {
                worklist.push(released);
            }
        }
        Ok(())
    }

    fn process_round(
        &mut self,
        packets: Vec<(SocketAddr, Vec<u8>)>,
    ) -> Result<Vec<(SocketAddr, Vec<u8>)>, CoreError> {
        let mut released: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let mut storable: BTreeMap<usize, Vec<(SocketAddr, Message)>> = BTreeMap::new();
        let mut transient: Vec<(SocketAddr, Message)> = Vec::new();

        let metas = self.metas.clone();
        let by_name = self.by_name.clone();
        let lookup = move |name: &str| by_name.get(name).map(|i| metas[*i].clone());

        for (source, packet) in packets {
            let decoded = decode_packet(&self.id, &lookup, &self.directory, &packet)?;
            match decoded {
                Decoded::Message(msg) => {
                    if msg.name() == names::IDENTITY {
                        if let Some(author) = msg.author() {
                            released.extend(self.delay.on_member_learned(author.mid));
                        }
                    }
                    if msg.meta.distribution.is_synced() {
                        storable.entry(msg.meta.index).or_default().push((source, *msg));
                    } else {
                        transient.push((source, *msg));
                    }
                }
                Decoded::Delay(reason) => {
                    self.park_and_request(source, packet, reason)?;
                }
                Decoded::Drop(reason) => {
                    self.metrics.packets_dropped_total.inc();
                    debug!(community = ?self.id, ?reason, "packet dropped");
                }
            }
        }

        // Storable groups commit per (community, meta message), atomically.
        for (meta_index, mut group) in storable {
            let meta = self.metas[meta_index].clone();
            dedup_in_batch(&mut group);
            sort_for_commit(&meta, &mut group);

            let db = self.db.clone();
            let output = db.with_tx(|conn| self.commit_group(conn, &meta, &group))?;
            self.metrics.batches_committed_total.inc();
            self.metrics.messages_stored_total.inc_by(output.stored);
            released.extend(self.apply_output(output)?);
        }

        // Transient (relay/direct) messages are handled outside any batch.
        let mut seq_requests: Vec<(SocketAddr, MemberId, String, SequenceRange)> = Vec::new();
        for (source, msg) in transient {
            self.merge_global_time(msg.global_time())?;
            released.extend(self.handle_transient(source, &msg, &mut seq_requests)?);
        }
        if !seq_requests.is_empty() {
            self.respond_missing_sequences(seq_requests)?;
        }

        Ok(released)
    }

    fn park_and_request(
        &mut self,
        source: SocketAddr,
        packet: Vec<u8>,
        reason: DelayReason,
    ) -> Result<(), CoreError> {
        self.metrics.packets_delayed_total.inc();
        let key = DelayKey::of(&reason);
        let deadline = Instant::now() + self.config.delay_timeout;
        let is_new = self.delay.park(key, source, packet, deadline);
        if !is_new {
            return Ok(());
        }
        // First park of this key: emit the request for the dependency.
        let request = match &reason {
            DelayReason::MissingMember { mid } | DelayReason::UnspecifiedMember { mid } => self
                .create_addressed(
                    names::MISSING_IDENTITY,
                    Payload::MissingIdentity { mid: *mid },
                    vec![source],
                )?,
            DelayReason::MissingSequence { member, meta, range } => {
                self.create_missing_sequence(*member, &meta.clone(), *range, source)?
            }
            DelayReason::MissingProof { member, global_time } => self.create_addressed(
                names::MISSING_PROOF,
                Payload::MissingProof {
                    member: *member,
                    global_time: *global_time,
                },
                vec![source],
            )?,
        };
        debug!(community = ?self.id, ?reason, "packet delayed; dependency requested");
        self.send(&[source], &request.packet);
        Ok(())
    }

    /// Admit one storable group inside a transaction.
    fn commit_group(
        &self,
        conn: &Connection,
        meta: &Arc<MetaMessage>,
        group: &[(SocketAddr, Message)],
    ) -> Result<CommitOutput, StoreError> {
        let mut out = CommitOutput::default();
        for (source, msg) in group {
            self.admit(conn, meta, msg, *source, &mut out)?;
        }
        if out.max_global_time > self.global_time {
            let observed = out.max_global_time.min(GLOBAL_TIME_TOMBSTONE - 1);
            messages::community_update_global_time(conn, self.database_id, observed)?;
        }
        Ok(out)
    }

    fn admit(
        &self,
        conn: &Connection,
        meta: &Arc<MetaMessage>,
        msg: &Message,
        source: SocketAddr,
        out: &mut CommitOutput,
    ) -> Result<(), StoreError> {
        let strict = matches!(
            meta.name.as_str(),
            names::DESTROY_COMMUNITY | names::AUTHORIZE | names::REVOKE
        );

        if self.frozen && meta.name != names::DESTROY_COMMUNITY {
            out.drops.push((source, DropReason::Frozen));
            return Ok(());
        }

        let Some(author) = msg.author() else {
            out.drops.push((source, DropReason::Malformed));
            return Ok(());
        };

        // Linear resolution: the author needs a permitting chain.
        if meta.resolution == crate::core::policy::Resolution::Linear
            && !self.is_permitted(author.mid, &meta.name, msg.payload.required_permission())
        {
            if strict {
                out.drops.push((source, DropReason::ForbiddenPolicy));
            } else {
                out.parks.push((
                    source,
                    msg.packet.clone(),
                    DelayReason::MissingProof {
                        member: author.mid,
                        global_time: msg.global_time(),
                    },
                ));
            }
            return Ok(());
        }

        match meta.distribution {
            Distribution::FullSync { .. } => {
                self.admit_full_sync(conn, meta, msg, author.clone(), source, out)?
            }
            Distribution::LastSync { history, .. } => {
                self.admit_last_sync(conn, meta, msg, history, source, out)?
            }
            // Storable groups never carry relay/direct metas.
            _ => {}
        }
        Ok(())
    }

    fn admit_full_sync(
        &self,
        conn: &Connection,
        meta: &Arc<MetaMessage>,
        msg: &Message,
        author: MemberRef,
        source: SocketAddr,
        out: &mut CommitOutput,
    ) -> Result<(), StoreError> {
        let Some(seq) = msg.sequence_number() else {
            out.drops.push((source, DropReason::Malformed));
            return Ok(());
        };
        let gt = msg.global_time();
        let (community, member, meta_id) = (self.database_id, author.database_id, meta.database_id);

        if messages::sync_packet_stored(conn, community, member, meta_id, &msg.packet)? {
            out.drops.push((source, DropReason::Duplicate));
            return Ok(());
        }

        let stored_max = messages::sync_count(conn, community, member, meta_id)?;
        let last_gt = messages::sync_max_global_time(conn, community, member, meta_id)?.unwrap_or(0);
        let verdict = sequence::judge(
            stored_max,
            last_gt,
            |s| {
                messages::sync_global_time_at_seq(conn, community, member, meta_id, s)
                    .ok()
                    .flatten()
            },
            seq,
            gt,
        );

        match verdict {
            SequenceVerdict::Accept => {
                messages::sync_insert(conn, community, member, meta_id, gt, &msg.packet)?;
                out.stored += 1;
                out.max_global_time = out.max_global_time.max(gt);
                out.seq_triggers.push((author.mid, meta.name.clone(), seq));
                self.on_stored(conn, meta, msg, out)?;
            }
            SequenceVerdict::Replace { evict_from } => {
                messages::sync_delete_from_seq(conn, community, member, meta_id, evict_from)?;
                messages::sync_insert(conn, community, member, meta_id, gt, &msg.packet)?;
                out.stored += 1;
                out.max_global_time = out.max_global_time.max(gt);
                self.on_stored(conn, meta, msg, out)?;
            }
            SequenceVerdict::Duplicate => {
                out.drops.push((source, DropReason::Duplicate));
            }
            SequenceVerdict::Stale => {
                out.drops.push((source, DropReason::StaleGlobalTime));
            }
            SequenceVerdict::Missing { low, high } => {
                out.parks.push((
                    source,
                    msg.packet.clone(),
                    DelayReason::MissingSequence {
                        member: author.mid,
                        meta: meta.name.clone(),
                        range: SequenceRange { low, high },
                    },
                ));
            }
        }
        Ok(())
    }

    fn admit_last_sync(
        &self,
        conn: &Connection,
        meta: &Arc<MetaMessage>,
        msg: &Message,
        history: u64,
        source: SocketAddr,
        out: &mut CommitOutput,
    ) -> Result<(), StoreError> {
        let gt = msg.global_time();
        let (community, meta_id) = (self.database_id, meta.database_id);

        let (rows, author_id, pair) = match &msg.origin {
            MessageOrigin::Member(m) => (
                messages::sync_member_rows(conn, community, m.database_id, meta_id)?,
                m.database_id,
                None,
            ),
            MessageOrigin::DoubleMember(a, b) => (
                messages::sync_pair_rows(conn, community, meta_id, a.database_id, b.database_id)?,
                a.database_id,
                Some((a.database_id, b.database_id)),
            ),
            MessageOrigin::None => {
                out.drops.push((source, DropReason::Malformed));
                return Ok(());
            }
        };

        if rows.iter().any(|r| r.packet == msg.packet) {
            out.drops.push((source, DropReason::Duplicate));
            return Ok(());
        }

        let newest = rows.last().cloned();
        let duplicate_time = rows.iter().any(|r| r.global_time == gt);
        let full = rows.len() as u64 >= history;
        let too_old = full && rows.first().map(|r| gt <= r.global_time).unwrap_or(false);

        if duplicate_time || too_old {
            // The newest stored message proves the drop to the origin.
            let reason = match newest {
                Some(proof) => DropReason::ByProof {
                    proof: proof.packet,
                },
                None => DropReason::Duplicate,
            };
            out.drops.push((source, reason));
            return Ok(());
        }

        let sync_id = messages::sync_insert(conn, community, author_id, meta_id, gt, &msg.packet)?;
        if let Some((a, b)) = pair {
            messages::double_signed_insert(conn, sync_id, a, b)?;
        }
        out.stored += 1;
        out.max_global_time = out.max_global_time.max(gt);

        // Retention: evict the oldest entries beyond the history.
        let mut count = rows.len() as u64 + 1;
        for row in rows {
            if count <= history {
                break;
            }
            messages::sync_delete_by_id(conn, row.sync_id)?;
            count -= 1;
        }

        self.on_stored(conn, meta, msg, out)?;
        Ok(())
    }

    /// Post-store hooks for the reserved metas, inside the transaction.
    fn on_stored(
        &self,
        conn: &Connection,
        meta: &Arc<MetaMessage>,
        msg: &Message,
        out: &mut CommitOutput,
    ) -> Result<(), StoreError> {
        match (&meta.name[..], &msg.payload) {
            (names::DESTROY_COMMUNITY, Payload::DestroyCommunity { degree }) => {
                match degree {
                    KillDegree::Hard => {
                        let wiped = messages::sync_wipe_community(conn, self.database_id)?;
                        // The destroy message itself survives as a tombstone.
                        if let Some(author) = msg.author() {
                            messages::sync_insert(
                                conn,
                                self.database_id,
                                author.database_id,
                                meta.database_id,
                                GLOBAL_TIME_TOMBSTONE,
                                &msg.packet,
                            )?;
                        }
                        messages::community_set_degree(conn, self.database_id, "hard-kill")?;
                        info!(community = ?self.id, wiped, "community hard-killed");
                    }
                    KillDegree::Soft => {
                        messages::community_set_degree(conn, self.database_id, "soft-kill")?;
                        info!(community = ?self.id, "community soft-killed");
                    }
                }
                out.degree = Some(*degree);
            }
            (names::AUTHORIZE, Payload::Authorize { grants }) => {
                out.grants.extend(grants.iter().cloned());
            }
            (names::REVOKE, Payload::Revoke { grants }) => {
                out.revokes.extend(grants.iter().cloned());
            }
            _ => {}
        }
        Ok(())
    }

    /// Apply deferred commit effects; returns packets released for re-entry.
    fn apply_output(&mut self, output: CommitOutput) -> Result<Vec<(SocketAddr, Vec<u8>)>, CoreError> {
        let mut released = Vec::new();

        self.merge_global_time(output.max_global_time)?;

        for grant in output.grants {
            self.permissions
                .entry((grant.member, grant.meta.clone()))
                .or_default()
                .insert(grant.kind);
            released.extend(self.delay.on_proof_stored(grant.member));
        }
        for grant in output.revokes {
            if let Some(kinds) = self.permissions.get_mut(&(grant.member, grant.meta.clone())) {
                kinds.remove(&grant.kind);
            }
        }
        if let Some(degree) = output.degree {
            self.frozen = true;
            if matches!(degree, KillDegree::Hard) {
                self.delay = DelayQueue::new();
            }
        }

        for (mid, meta_name, _seq) in &output.seq_triggers {
            let stored_max = {
                let meta = self.meta(meta_name).ok_or(CoreError::Internal)?;
                let members = self.directory.resolve(*mid)?;
                let mut max = 0u64;
                for member in members {
                    let count = self.db.with_conn(|c| {
                        messages::sync_count(
                            c,
                            self.database_id,
                            member.database_id,
                            meta.database_id,
                        )
                    })?;
                    max = max.max(count);
                }
                max
            };
            released.extend(self.delay.on_sequence_stored(*mid, meta_name, stored_max));
        }

        for (source, reason) in output.drops {
            self.metrics.packets_dropped_total.inc();
            match reason {
                DropReason::ByProof { proof } => {
                    debug!(community = ?self.id, "message dropped; proof returned");
                    self.send_proof(source, &proof);
                }
                reason => {
                    debug!(community = ?self.id, ?reason, "message dropped");
                }
            }
        }

        for (source, packet, reason) in output.parks {
            self.park_and_request(source, packet, reason)?;
        }

        Ok(released)
    }

    // ---- transient (relay/direct) handlers -------------------------------

    fn handle_transient(
        &mut self,
        source: SocketAddr,
        msg: &Message,
        seq_requests: &mut Vec<(SocketAddr, MemberId, String, SequenceRange)>,
    ) -> Result<Vec<(SocketAddr, Vec<u8>)>, CoreError> {
        let mut released = Vec::new();
        match &msg.payload {
            Payload::MissingIdentity { mid } => {
                self.respond_missing_identity(source, *mid)?;
            }
            Payload::MissingSequence { member, meta, range } => {
                seq_requests.push((source, *member, meta.clone(), *range));
            }
            Payload::MissingMessage { member, global_times } => {
                self.respond_missing_message(source, *member, global_times)?;
            }
            Payload::MissingProof { member, .. } => {
                self.respond_missing_proof(source, *member)?;
            }
            Payload::SignatureRequest { identifier, packet, global_time } => {
                self.merge_global_time(*global_time)?;
                self.respond_signature_request(source, *identifier, packet)?;
            }
            Payload::SignatureResponse { identifier, packet } => {
                if let Some(inner) = self.accept_signature_response(*identifier, packet)? {
                    released.push((source, inner));
                }
            }
            Payload::IntroductionRequest(intro) => {
                if let Some(sync) = &intro.sync {
                    self.respond_sync(source, sync)?;
                }
            }
            _ => {}
        }
        Ok(released)
    }

    fn respond_missing_identity(&self, source: SocketAddr, mid: MemberId) -> Result<(), CoreError> {
        let identity_meta = self.meta(names::IDENTITY).ok_or(CoreError::Internal)?;
        let members = self.directory.resolve(mid)?;
        let mut packets = Vec::new();
        for member in members {
            let rows = self.db.with_conn(|c| {
                messages::sync_packets_for_member_meta(
                    c,
                    self.database_id,
                    member.database_id,
                    identity_meta.database_id,
                )
            })?;
            packets.extend(rows.into_iter().map(|r| r.packet));
        }
        for packet in packets {
            self.send(&[source], &packet);
        }
        Ok(())
    }

    fn respond_missing_sequences(
        &mut self,
        requests: Vec<(SocketAddr, MemberId, String, SequenceRange)>,
    ) -> Result<(), CoreError> {
        // De-duplicate overlapping ranges: each sequence number is served at
        // most once per requester and burst, ascending.
        let mut wanted: BTreeMap<(SocketAddr, MemberId, String), BTreeSet<u64>> = BTreeMap::new();
        for (source, member, meta, range) in requests {
            if range.low == 0 || range.high < range.low {
                continue;
            }
            let entry = wanted.entry((source, member, meta)).or_default();
            for seq in range.low..=range.high {
                entry.insert(seq);
            }
        }

        for ((source, mid, meta_name), seqs) in wanted {
            let Some(meta) = self.meta(&meta_name) else {
                continue;
            };
            for member in self.directory.resolve(mid)? {
                let stored_max = self.db.with_conn(|c| {
                    messages::sync_count(c, self.database_id, member.database_id, meta.database_id)
                })?;
                let mut ranges: Vec<(u64, u64)> = Vec::new();
                for &seq in seqs.iter().filter(|&&s| s <= stored_max) {
                    match ranges.last_mut() {
                        Some((_, high)) if *high + 1 == seq => *high = seq,
                        _ => ranges.push((seq, seq)),
                    }
                }
                for (low, high) in ranges {
                    let rows = self.db.with_conn(|c| {
                        messages::sync_packets_in_seq_range(
                            c,
                            self.database_id,
                            member.database_id,
                            meta.database_id,
                            low,
                            high,
                        )
                    })?;
                    for (_seq, packet) in rows {
                        self.send(&[source], &packet);
                    }
                }
            }
        }
        Ok(())
    }

    fn respond_missing_message(
        &self,
        source: SocketAddr,
        mid: MemberId,
        global_times: &[GlobalTime],
    ) -> Result<(), CoreError> {
        for member in self.directory.resolve(mid)? {
            let rows = self.db.with_conn(|c| {
                messages::sync_packets_at_global_times(
                    c,
                    self.database_id,
                    member.database_id,
                    global_times,
                )
            })?;
            for row in rows {
                self.send(&[source], &row.packet);
            }
        }
        Ok(())
    }

    fn respond_missing_proof(&self, source: SocketAddr, _mid: MemberId) -> Result<(), CoreError> {
        // Serve the stored authorize messages; the requester replays them to
        // rebuild the chain covering the member.
        let authorize = self.meta(names::AUTHORIZE).ok_or(CoreError::Internal)?;
        let rows = self.db.with_conn(|c| {
            messages::sync_select(c, self.database_id, authorize.database_id, 1, 0, 1, 0)
        })?;
        for row in rows {
            self.send(&[source], &row.packet);
        }
        Ok(())
    }

    fn respond_signature_request(
        &mut self,
        source: SocketAddr,
        identifier: u32,
        packet: &[u8],
    ) -> Result<(), CoreError> {
        let metas = self.metas.clone();
        let by_name = self.by_name.clone();
        let lookup = move |name: &str| by_name.get(name).map(|i| metas[*i].clone());

        let decoded = decode_partial_packet(&self.id, &lookup, &self.directory, packet)?;
        let Decoded::Message(submsg) = decoded else {
            debug!(community = ?self.id, identifier, "signature request rejected");
            return Ok(());
        };
        let MessageOrigin::DoubleMember(_, counter) = &submsg.origin else {
            return Ok(());
        };
        if counter.mid != self.my_member.mid {
            return Ok(());
        }

        let wire = WirePacket::decode(packet).map_err(|_| CoreError::Internal)?;
        let [sig_a, sig_b] = wire.signatures.as_slice() else {
            return Ok(());
        };
        if sig_a.is_placeholder() || !sig_b.is_placeholder() {
            return Ok(());
        }

        let signing = packet_signing_bytes(&self.id, &wire.body);
        let full = WirePacket {
            community: self.id,
            body: wire.body.clone(),
            signatures: vec![sig_a.clone(), self.identity.sign(&signing)],
        };
        let full_bytes = full.encode().map_err(|_| CoreError::Internal)?;

        let response = self.create_addressed(
            names::SIGNATURE_RESPONSE,
            Payload::SignatureResponse {
                identifier,
                packet: full_bytes,
            },
            vec![source],
        )?;
        self.send(&[source], &response.packet);
        Ok(())
    }

    fn accept_signature_response(
        &mut self,
        identifier: u32,
        packet: &[u8],
    ) -> Result<Option<Vec<u8>>, CoreError> {
        let Some(pending) = self.signer.take(identifier) else {
            // Expired or unsolicited: silently ignored.
            return Ok(None);
        };
        let Ok(wire) = WirePacket::decode(packet) else {
            return Ok(None);
        };
        if wire.body != pending.body {
            warn!(community = ?self.id, identifier, "signature response body mismatch");
            return Ok(None);
        }
        Ok(Some(packet.to_vec()))
    }

    fn respond_sync(&mut self, source: SocketAddr, request: &SyncRequest) -> Result<(), CoreError> {
        let metas = self.metas.clone();
        let limit = self.config.sync_response_limit;
        let packets = self.db.with_conn(|c| {
            sync::respond(c, self.database_id, &metas, request, limit)
        })?;
        self.metrics.sync_responses_total.inc_by(packets.len() as u64);
        for packet in packets {
            self.send(&[source], &packet);
        }
        Ok(())
    }

    // ---- sending ---------------------------------------------------------

    fn send(&self, addresses: &[SocketAddr], packet: &[u8]) {
        if let Err(e) = self.endpoint.send(addresses, packet) {
            warn!(community = ?self.id, err = ?e, "endpoint send failed");
        }
    }

    fn send_proof(&mut self, to: SocketAddr, packet: &[u8]) {
        let now = Instant::now();
        let burst = self.config.proof_burst;
        let per_sec = self.config.proof_per_sec;
        let bucket = self
            .proof_buckets
            .entry(to)
            .or_insert_with(|| ProofBucket::new(burst, now));
        if bucket.allow(burst, per_sec, now) {
            self.metrics.proofs_sent_total.inc();
            self.send(&[to], packet);
        } else {
            self.metrics.proofs_throttled_total.inc();
        }
    }

    // ---- housekeeping ----------------------------------------------------

    /// Cooperative timer tick: expire parked packets and pending signatures.
    pub fn on_tick(&mut self, now: Instant) {
        let expired = self.delay.expire(now);
        if expired > 0 {
            self.metrics.packets_expired_total.inc_by(expired as u64);
        }
        let timeouts = self.signer.expire(now);
        if timeouts > 0 {
            self.metrics
                .signature_timeouts_total
                .inc_by(timeouts as u64);
        }
    }

    // ---- store inspection (used by tests and operators) ------------------

    /// Stored message count for a meta.
    pub fn stored_count(&self, name: &str) -> Result<u64, CoreError> {
        let meta = self.meta(name).ok_or(CoreError::PolicyMismatch)?;
        Ok(self
            .db
            .with_conn(|c| messages::sync_count_meta(c, self.database_id, meta.database_id))?)
    }

    /// Stored global times for a meta, ascending.
    pub fn stored_global_times(&self, name: &str) -> Result<Vec<GlobalTime>, CoreError> {
        let meta = self.meta(name).ok_or(CoreError::PolicyMismatch)?;
        let rows = self.db.with_conn(|c| {
            messages::sync_select(c, self.database_id, meta.database_id, 1, 0, 1, 0)
        })?;
        Ok(rows.into_iter().map(|r| r.global_time).collect())
    }

    /// True when this exact packet is stored.
    pub fn packet_stored(&self, packet: &[u8]) -> Result<bool, CoreError> {
        let community = self.database_id;
        let blob = packet.to_vec();
        let args: [&dyn rusqlite::ToSql; 2] = [&community, &blob];
        let found = self.db.fetchone(
            "SELECT 1 FROM sync WHERE community = ? AND packet = ?",
            &args,
            |row| row.get::<_, i64>(0),
        )?;
        Ok(found.is_some())
    }
}

/// Collapse duplicate packets inside one batch.
fn dedup_in_batch(group: &mut Vec<(SocketAddr, Message)>) {
    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    group.retain(|(_, msg)| seen.insert(msg.packet.clone()));
}

/// Deterministic commit order inside one batch.
fn sort_for_commit(meta: &MetaMessage, group: &mut [(SocketAddr, Message)]) {
    match meta.distribution {
        Distribution::FullSync { .. } => {
            group.sort_by(|(_, a), (_, b)| {
                let ka = (
                    a.author().map(|m| m.database_id).unwrap_or(0),
                    a.sequence_number().unwrap_or(0),
                    a.global_time(),
                );
                let kb = (
                    b.author().map(|m| m.database_id).unwrap_or(0),
                    b.sequence_number().unwrap_or(0),
                    b.global_time(),
                );
                ka.cmp(&kb)
            });
        }
        _ => group.sort_by_key(|(_, m)| m.global_time()),
    }
}
