//! # Community Base
//!
//! State and behavior shared by every overlay: the identifier, the local
//! member, global time, conversions, the candidate table, the packet store,
//! and the default handling of introduction and plumbing messages.
//!
//! Overlay-specific engines ([`crate::discovery::DiscoveryCommunity`], the
//! tracker overlays) *compose* a [`CommunityBase`] rather than inherit from
//! it, and decide per message which default behaviors to invoke.
//!
//! Handlers never perform I/O. They return [`Outgoing`] actions; the owning
//! runtime serializes them onto the socket. This keeps every handler
//! synchronous, deterministic, and testable with nothing but an `Instant`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::candidate::{CandidateRegistry, WalkCandidate};
use crate::config::COMMUNITY_VERSION;
use crate::identity::{Cid, CryptoPolicy, Mid, PrivateMember};
use crate::timeline::Timeline;
use crate::wire::{
    Conversion, IntroductionResponsePayload, Message, MessageKind, Payload, PuncturePayload,
    PunctureRequestPayload, WireError,
};

/// Global-time window accepted by ordinary overlays. The tracker overrides
/// this with an effectively infinite range.
pub const ACCEPTABLE_GLOBAL_TIME_RANGE: u64 = 100_000;

// ---------------------------------------------------------------------------
// Outgoing
// ---------------------------------------------------------------------------

/// A packet the runtime must transmit: the one action handlers produce.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub targets: Vec<SocketAddr>,
    pub kind: MessageKind,
    pub packet: Bytes,
}

impl Outgoing {
    pub fn to_one(target: SocketAddr, kind: MessageKind, packet: Bytes) -> Self {
        Self {
            targets: vec![target],
            kind,
            packet,
        }
    }
}

// ---------------------------------------------------------------------------
// SyncStore
// ---------------------------------------------------------------------------

/// Retained packets, keyed by message kind and signer. Backs
/// `missing-identity` answers and the destroy-evidence identity lookup.
#[derive(Debug, Default)]
pub struct SyncStore {
    packets: HashMap<(MessageKind, Mid), Bytes>,
}

impl SyncStore {
    /// Retains an authenticated message, replacing any previous packet of
    /// the same kind from the same signer.
    pub fn store(&mut self, message: &Message) {
        if let Some(mid) = message.sender_mid() {
            self.packets
                .insert((message.kind(), mid), message.packet.clone());
        }
    }

    pub fn get(&self, kind: MessageKind, mid: Mid) -> Option<&Bytes> {
        self.packets.get(&(kind, mid))
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

// ---------------------------------------------------------------------------
// CommunityBase
// ---------------------------------------------------------------------------

/// Per-overlay state shared by all overlay flavors.
#[derive(Debug)]
pub struct CommunityBase {
    cid: Cid,
    my_member: PrivateMember,
    policy: CryptoPolicy,
    global_time: u64,
    conversions: Vec<Conversion>,
    pub candidates: CandidateRegistry,
    pub sync_store: SyncStore,
    pub timeline: Timeline,
}

impl CommunityBase {
    pub fn new(cid: Cid, my_member: PrivateMember, policy: CryptoPolicy) -> Self {
        Self {
            cid,
            my_member,
            policy,
            global_time: 1,
            conversions: vec![Conversion::new(COMMUNITY_VERSION)],
            candidates: CandidateRegistry::new(),
            sync_store: SyncStore::default(),
            timeline: Timeline::new(cid.as_mid()),
        }
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn my_member(&self) -> &PrivateMember {
        &self.my_member
    }

    pub fn my_mid(&self) -> Mid {
        self.my_member.mid()
    }

    pub fn policy(&self) -> CryptoPolicy {
        self.policy
    }

    pub fn global_time(&self) -> u64 {
        self.global_time
    }

    /// Claims a fresh global time for an outgoing message.
    pub fn claim_global_time(&mut self) -> u64 {
        self.global_time += 1;
        self.global_time
    }

    /// Folds a remote global time into ours.
    pub fn update_global_time(&mut self, remote: u64) {
        self.global_time = self.global_time.max(remote);
    }

    /// Whether a message's global time falls in the acceptable window.
    pub fn check_global_time(&self, message: &Message, range: u64) -> bool {
        message.global_time >= 1
            && message.global_time <= self.global_time.saturating_add(range)
    }

    // -- conversions ------------------------------------------------------

    /// The conversion able to decode `packet`, if any is registered for its
    /// version bytes.
    pub fn get_conversion_for_packet(&self, packet: &[u8]) -> Result<Conversion, WireError> {
        self.conversions
            .iter()
            .find(|conversion| conversion.matches(packet))
            .copied()
            .ok_or_else(|| {
                WireError::ConversionNotFound(if packet.len() > 1 { packet[1] } else { 0 })
            })
    }

    /// Registers a conversion. Idempotent: an already-known community
    /// version byte is left untouched.
    pub fn add_conversion(&mut self, conversion: Conversion) {
        if !self
            .conversions
            .iter()
            .any(|c| c.community_version() == conversion.community_version())
        {
            self.conversions.push(conversion);
        }
    }

    /// Decodes an incoming packet with the matching registered conversion.
    pub fn decode(&self, packet: &[u8]) -> Result<Message, WireError> {
        let conversion = self.get_conversion_for_packet(packet)?;
        conversion.decode(packet, self.policy)
    }

    /// Encodes an outgoing payload under our preferred conversion, claiming
    /// a fresh global time.
    pub fn encode(&mut self, payload: &Payload) -> Result<Bytes, WireError> {
        let global_time = self.claim_global_time();
        self.conversions[0].encode(self.cid, global_time, payload, &self.my_member, self.policy)
    }

    // -- default handlers -------------------------------------------------

    /// Bookkeeping shared by every introduction-request handler: refresh
    /// the walk candidate for the sender, associate its MID, and absorb its
    /// global time.
    pub fn note_introduction_request(
        &mut self,
        message: &Message,
        from: SocketAddr,
        now: Instant,
    ) {
        let Payload::IntroductionRequest(ref payload) = message.payload else {
            return;
        };
        self.update_global_time(message.global_time);
        let candidate = self.candidates.create_or_update(
            from,
            payload.source_lan_address,
            payload.source_wan_address,
            false,
            payload.connection_type,
        );
        candidate.stumbled(now);
        if let Some(mid) = message.sender_mid() {
            candidate.associate(mid);
        }
    }

    /// Builds the introduction response (and the puncture request toward
    /// the introduced candidate, when there is one).
    ///
    /// `introduced` is chosen by the caller: the tracker picks a random
    /// verified candidate, the discovery overlay may steer.
    pub fn respond_to_introduction_request(
        &mut self,
        message: &Message,
        from: SocketAddr,
        introduced: Option<WalkCandidate>,
    ) -> Result<Vec<Outgoing>, WireError> {
        let Payload::IntroductionRequest(ref request) = message.payload else {
            return Ok(Vec::new());
        };

        let mut outgoing = Vec::with_capacity(2);

        let response = Payload::IntroductionResponse(IntroductionResponsePayload {
            destination_address: from,
            source_lan_address: request.destination_address,
            source_wan_address: request.destination_address,
            lan_introduction_address: introduced.as_ref().map(|c| c.lan_address),
            wan_introduction_address: introduced.as_ref().map(|c| c.wan_address),
            tunnel: introduced.as_ref().is_some_and(|c| c.tunnel),
            identifier: request.identifier,
        });
        let packet = self.encode(&response)?;
        outgoing.push(Outgoing::to_one(
            from,
            MessageKind::IntroductionResponse,
            packet,
        ));

        if let Some(introduced) = introduced {
            trace!(
                walker = %from,
                introduced = %introduced.sock_addr,
                "puncturing introduced candidate"
            );
            let puncture = Payload::PunctureRequest(PunctureRequestPayload {
                lan_walker_address: request.source_lan_address,
                wan_walker_address: request.source_wan_address,
                identifier: request.identifier,
            });
            let packet = self.encode(&puncture)?;
            outgoing.push(Outgoing::to_one(
                introduced.sock_addr,
                MessageKind::PunctureRequest,
                packet,
            ));
        }

        Ok(outgoing)
    }

    /// Default introduction-response handling: the responder is now a
    /// verified (walked) candidate, and any introduced address becomes a
    /// discovered candidate.
    pub fn on_introduction_response(
        &mut self,
        message: &Message,
        from: SocketAddr,
        now: Instant,
    ) {
        let Payload::IntroductionResponse(ref payload) = message.payload else {
            return;
        };
        self.update_global_time(message.global_time);

        let candidate = self.candidates.create_or_update(
            from,
            payload.source_lan_address,
            payload.source_wan_address,
            false,
            crate::candidate::ConnectionType::Unknown,
        );
        candidate.walked(now);
        if let Some(mid) = message.sender_mid() {
            candidate.associate(mid);
        }

        if let Some(wan) = payload.wan_introduction_address {
            self.candidates
                .add_discovered(crate::candidate::Candidate::new(wan, payload.tunnel), now);
        }
    }

    /// On a puncture request we fire a puncture at the walker so its NAT
    /// learns our mapping.
    pub fn on_puncture_request(
        &mut self,
        message: &Message,
        my_lan: SocketAddr,
        my_wan: SocketAddr,
    ) -> Result<Vec<Outgoing>, WireError> {
        let Payload::PunctureRequest(ref payload) = message.payload else {
            return Ok(Vec::new());
        };
        let puncture = Payload::Puncture(PuncturePayload {
            source_lan_address: my_lan,
            source_wan_address: my_wan,
            identifier: payload.identifier,
        });
        let packet = self.encode(&puncture)?;
        Ok(vec![Outgoing::to_one(
            payload.wan_walker_address,
            MessageKind::Puncture,
            packet,
        )])
    }

    /// Punctures just prove the path exists; note the candidate and move on.
    pub fn on_puncture(&mut self, message: &Message, from: SocketAddr, now: Instant) {
        if let Payload::Puncture(_) = message.payload {
            self.candidates
                .add_discovered(crate::candidate::Candidate::new(from, false), now);
        }
    }

    /// Stores an identity announcement for later `missing-identity` lookups.
    pub fn on_identity(&mut self, message: &Message) {
        self.sync_store.store(message);
    }

    /// Answers a `missing-identity` with the stored identity packet, if we
    /// have one.
    pub fn on_missing_identity(&self, message: &Message, from: SocketAddr) -> Vec<Outgoing> {
        let Payload::MissingIdentity(ref payload) = message.payload else {
            return Vec::new();
        };
        match self.sync_store.get(MessageKind::Identity, payload.mid) {
            Some(packet) => vec![Outgoing::to_one(
                from,
                MessageKind::Identity,
                packet.clone(),
            )],
            None => {
                debug!(mid = %payload.mid, "no stored identity to answer missing-identity");
                Vec::new()
            }
        }
    }

    /// Answers a `missing-proof` with every retained proof packet for the
    /// requested member.
    pub fn on_missing_proof(&self, message: &Message, from: SocketAddr) -> Vec<Outgoing> {
        let Payload::MissingProof(ref payload) = message.payload else {
            return Vec::new();
        };
        self.timeline
            .proofs_for(payload.mid)
            .into_iter()
            .map(|packet| Outgoing::to_one(from, MessageKind::Authorize, packet))
            .collect()
    }
}
