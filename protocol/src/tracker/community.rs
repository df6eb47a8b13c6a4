//! # Tracker Overlays
//!
//! The overlay objects a rendezvous tracker manufactures on demand.
//!
//! A [`TrackerCommunity`] exists to reflect introduction traffic for an
//! overlay the tracker has never heard of: it accepts any global time,
//! answers introduction requests from a pool of verified candidates, and
//! never walks itself. When a valid destroy message arrives it is replaced
//! by a [`TrackerHardKilledCommunity`], which does nothing but decay and
//! hand the destroy packet to anyone still knocking.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::community::{CommunityBase, Outgoing};
use crate::identity::{Cid, CryptoPolicy, PrivateMember};
use crate::wire::{Message, MessageKind, Payload};

/// The message set a tracker community handles; anything else addressed to
/// it is dropped undecoded.
const TRACKER_MESSAGES: &[MessageKind] = &[
    MessageKind::IntroductionRequest,
    MessageKind::IntroductionResponse,
    MessageKind::PunctureRequest,
    MessageKind::Puncture,
    MessageKind::Identity,
    MessageKind::MissingIdentity,
    MessageKind::Authorize,
    MessageKind::Revoke,
    MessageKind::MissingProof,
    MessageKind::DestroyCommunity,
];

/// Prints one telemetry line for an introduction or destroy event.
pub(crate) fn print_telemetry_line(tag: &str, message: &Message, from: SocketAddr) {
    let mid = message
        .sender_mid()
        .map(|mid| mid.to_hex())
        .unwrap_or_default();
    println!(
        "{} {} {} {} {} {} {}",
        tag,
        message.cid().to_hex(),
        mid,
        message.header.wire_version,
        message.header.community_version,
        from.ip(),
        from.port(),
    );
}

// ---------------------------------------------------------------------------
// TrackerCommunity
// ---------------------------------------------------------------------------

/// An overlay synthesized from nothing but an observed CID.
pub struct TrackerCommunity {
    base: CommunityBase,
    strikes: u32,
}

impl TrackerCommunity {
    /// Synthesizes the overlay: the master member is reconstructed from the
    /// CID (key-less), the local member is the tracker's process-wide
    /// identity.
    pub fn new(cid: Cid, my_member: PrivateMember, policy: CryptoPolicy) -> Self {
        Self {
            base: CommunityBase::new(cid, my_member, policy),
            strikes: 0,
        }
    }

    pub fn base(&self) -> &CommunityBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut CommunityBase {
        &mut self.base
    }

    pub fn cid(&self) -> Cid {
        self.base.cid()
    }

    /// Tracker overlays never walk.
    pub fn enable_candidate_walker(&self) -> bool {
        false
    }

    /// Walking a tracker overlay is a programming error, not a runtime
    /// condition.
    pub fn take_step(&self) -> ! {
        panic!("a tracker should not walk");
    }

    pub fn handles(kind: MessageKind) -> bool {
        TRACKER_MESSAGES.contains(&kind)
    }

    /// The tracker accepts the full 64-bit global time range: it relays for
    /// overlays whose clocks it has no opinion about.
    pub fn acceptable_global_time_range(&self) -> u64 {
        u64::MAX - self.base.global_time()
    }

    /// Strike bookkeeping: reset while any verified candidate exists,
    /// increment otherwise. Returns the updated count.
    pub fn update_strikes(&mut self, now: Instant) -> u32 {
        if self.base.candidates.verified(now).next().is_some() {
            self.strikes = 0;
        } else {
            self.strikes += 1;
        }
        self.strikes
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }

    /// Dispatches one decoded message. `DestroyCommunity` is deliberately
    /// absent: the engine intercepts it because handling it replaces this
    /// overlay wholesale.
    pub fn handle_message(
        &mut self,
        message: &Message,
        from: SocketAddr,
        now: Instant,
        silent: bool,
    ) -> Vec<Outgoing> {
        if !Self::handles(message.kind()) {
            debug!(kind = ?message.kind(), "tracker community ignores this kind");
            return Vec::new();
        }
        if !self
            .base
            .check_global_time(message, self.acceptable_global_time_range())
        {
            return Vec::new();
        }

        match message.kind() {
            MessageKind::IntroductionRequest => {
                if !silent {
                    print_telemetry_line("REQ_IN2", message, from);
                }
                self.base.note_introduction_request(message, from, now);
                let introduced = self.base.candidates.introduce_candidate(Some(from), now);
                self.base
                    .respond_to_introduction_request(message, from, introduced)
                    .unwrap_or_else(|error| {
                        warn!(%error, "failed to answer introduction request");
                        Vec::new()
                    })
            }
            MessageKind::IntroductionResponse => {
                if !silent {
                    print_telemetry_line("RES_IN2", message, from);
                }
                self.base.on_introduction_response(message, from, now);
                Vec::new()
            }
            MessageKind::PunctureRequest => {
                let me = self.base.candidates.get(&from).map(|c| c.wan_address);
                let me = me.unwrap_or(from);
                self.base
                    .on_puncture_request(message, me, me)
                    .unwrap_or_default()
            }
            MessageKind::Puncture => {
                self.base.on_puncture(message, from, now);
                Vec::new()
            }
            MessageKind::Identity => {
                self.base.on_identity(message);
                Vec::new()
            }
            MessageKind::MissingIdentity => self.base.on_missing_identity(message, from),
            MessageKind::Authorize => {
                let (accepted, _) = self.base.timeline.check(message);
                if accepted {
                    self.base.timeline.apply_authorize(message);
                    self.base.sync_store.store(message);
                }
                Vec::new()
            }
            MessageKind::Revoke => {
                let (accepted, _) = self.base.timeline.check(message);
                if accepted {
                    self.base.timeline.apply_revoke(message);
                    self.base.sync_store.store(message);
                }
                Vec::new()
            }
            MessageKind::MissingProof => self.base.on_missing_proof(message, from),
            _ => Vec::new(),
        }
    }

    /// Validates a destroy message and assembles the evidence records to
    /// persist: the destroy packet itself, the signer's identity packet
    /// when we hold it, and every timeline proof found recursively, all
    /// deduplicated by packet bytes.
    ///
    /// Returns `None` when the timeline rejects the destroy; the overlay
    /// then stays alive.
    pub fn prepare_destroy(&mut self, message: &Message) -> Option<Vec<(&'static str, Bytes)>> {
        let (accepted, _) = self.base.timeline.check(message);
        if !accepted {
            debug!(cid = %self.cid(), "rejecting unauthorized destroy");
            return None;
        }

        let mut records: Vec<(&'static str, Bytes)> = Vec::new();
        let mut stored: std::collections::HashSet<Bytes> = std::collections::HashSet::new();
        let mut pending: Vec<Message> = vec![message.clone()];

        while let Some(current) = pending.pop() {
            if !stored.insert(current.packet.clone()) {
                continue;
            }
            records.push((current.kind().name(), current.packet.clone()));

            // The signer's identity packet, when the sync store holds one.
            if let Some(mid) = current.sender_mid() {
                if let Some(identity) = self.base.sync_store.get(MessageKind::Identity, mid) {
                    if !stored.contains(identity) {
                        stored.insert(identity.clone());
                        records.push((MessageKind::Identity.name(), identity.clone()));
                    }
                }
            }

            // Recurse into the proofs justifying this message.
            let (_, proofs) = self.base.timeline.check(&current);
            for proof in proofs {
                match self.base.decode(&proof) {
                    Ok(proof_message) => pending.push(proof_message),
                    Err(error) => debug!(%error, "skipping undecodable proof packet"),
                }
            }
        }

        Some(records)
    }

    /// Consumes the overlay into its post-destroy form, retaining the
    /// destroy packet so it can be replayed to late walkers.
    pub fn into_hard_killed(self, destroy_packet: Bytes) -> TrackerHardKilledCommunity {
        TrackerHardKilledCommunity {
            base: self.base,
            strikes: 0,
            destroy_packet: Some(destroy_packet),
        }
    }
}

// ---------------------------------------------------------------------------
// TrackerHardKilledCommunity
// ---------------------------------------------------------------------------

/// The corpse of a destroyed overlay. Never resets its strikes, so the
/// cleanup task purges it after [`crate::config::STRIKE_LIMIT`] ticks; in
/// the meantime it answers introduction requests with the destroy packet
/// so the destruction keeps propagating.
pub struct TrackerHardKilledCommunity {
    base: CommunityBase,
    strikes: u32,
    destroy_packet: Option<Bytes>,
}

impl TrackerHardKilledCommunity {
    /// A killed overlay restored from the evidence log rather than a live
    /// transition.
    pub fn restored(cid: Cid, my_member: PrivateMember, policy: CryptoPolicy) -> Self {
        Self {
            base: CommunityBase::new(cid, my_member, policy),
            strikes: 0,
            destroy_packet: None,
        }
    }

    pub fn base(&self) -> &CommunityBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut CommunityBase {
        &mut self.base
    }

    pub fn cid(&self) -> Cid {
        self.base.cid()
    }

    pub fn set_destroy_packet(&mut self, packet: Bytes) {
        self.destroy_packet = Some(packet);
    }

    /// A dead overlay only ever decays.
    pub fn update_strikes(&mut self, _now: Instant) -> u32 {
        self.strikes += 1;
        self.strikes
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }

    /// Still-arriving introduction requests get the destroy packet back,
    /// and a `DESTROY_OUT` line instead of `REQ_IN2`.
    pub fn handle_message(
        &mut self,
        message: &Message,
        from: SocketAddr,
        _now: Instant,
        silent: bool,
    ) -> Vec<Outgoing> {
        match message.kind() {
            MessageKind::IntroductionRequest => {
                if !silent {
                    print_telemetry_line("DESTROY_OUT", message, from);
                }
                match &self.destroy_packet {
                    Some(packet) => vec![Outgoing::to_one(
                        from,
                        MessageKind::DestroyCommunity,
                        packet.clone(),
                    )],
                    None => Vec::new(),
                }
            }
            MessageKind::Identity => {
                self.base.on_identity(message);
                Vec::new()
            }
            MessageKind::DestroyCommunity => {
                // Replayed or re-received destroys just refresh the packet.
                if let Payload::DestroyCommunity(_) = message.payload {
                    let (accepted, _) = self.base.timeline.check(message);
                    if accepted {
                        self.destroy_packet = Some(message.packet.clone());
                    }
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::ConnectionType;
    use crate::config::COMMUNITY_VERSION;
    use crate::wire::{
        Conversion, DestroyCommunityPayload, DestroyDegree, IdentityPayload,
        IntroductionRequestPayload,
    };
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 5, 0, 1)), port)
    }

    fn encode(member: &PrivateMember, cid: Cid, global_time: u64, payload: Payload) -> Message {
        let conversion = Conversion::new(COMMUNITY_VERSION);
        let packet = conversion
            .encode(cid, global_time, &payload, member, CryptoPolicy::Sign)
            .unwrap();
        conversion.decode(&packet, CryptoPolicy::Sign).unwrap()
    }

    fn intro_request(member: &PrivateMember, cid: Cid) -> Message {
        encode(
            member,
            cid,
            // Far-future global time: the tracker must accept it anyway.
            u64::MAX / 2,
            Payload::IntroductionRequest(IntroductionRequestPayload {
                destination_address: addr(1),
                source_lan_address: addr(2),
                source_wan_address: addr(3),
                advice: true,
                connection_type: ConnectionType::Public,
                sync: None,
                identifier: 11,
                introduce_me_to: None,
            }),
        )
    }

    fn tracker(cid: Cid) -> TrackerCommunity {
        TrackerCommunity::new(cid, PrivateMember::generate(), CryptoPolicy::NoVerify)
    }

    #[test]
    fn any_global_time_is_acceptable() {
        let walker = PrivateMember::generate();
        let cid = Cid([0x31; 20]);
        let mut community = tracker(cid);
        let now = Instant::now();

        let message = intro_request(&walker, cid);
        let outgoing = community.handle_message(&message, addr(9), now, true);

        // An introduction response went out despite the wild global time.
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].kind, MessageKind::IntroductionResponse);
    }

    #[test]
    fn strikes_reset_with_verified_candidates() {
        let cid = Cid([0x32; 20]);
        let mut community = tracker(cid);
        let now = Instant::now();

        assert_eq!(community.update_strikes(now), 1);
        assert_eq!(community.update_strikes(now), 2);

        community
            .base_mut()
            .candidates
            .create_or_update(addr(4), addr(4), addr(4), false, ConnectionType::Public)
            .stumbled(now);
        assert_eq!(community.update_strikes(now), 0);
    }

    #[test]
    fn hard_killed_strikes_never_reset() {
        let cid = Cid([0x33; 20]);
        let mut community = TrackerHardKilledCommunity::restored(
            cid,
            PrivateMember::generate(),
            CryptoPolicy::NoVerify,
        );
        let now = Instant::now();

        community
            .base_mut()
            .candidates
            .create_or_update(addr(4), addr(4), addr(4), false, ConnectionType::Public)
            .stumbled(now);

        assert_eq!(community.update_strikes(now), 1);
        assert_eq!(community.update_strikes(now), 2);
        assert_eq!(community.update_strikes(now), 3);
    }

    #[test]
    fn destroy_by_master_collects_evidence() {
        let master = PrivateMember::generate();
        let cid = Cid::from(master.mid());
        let mut community = tracker(cid);
        let now = Instant::now();

        // The master announced its identity earlier.
        let identity = encode(&master, cid, 2, Payload::Identity(IdentityPayload {}));
        community.handle_message(&identity, addr(5), now, true);

        let destroy = encode(
            &master,
            cid,
            3,
            Payload::DestroyCommunity(DestroyCommunityPayload {
                degree: DestroyDegree::Hard,
            }),
        );
        let records = community.prepare_destroy(&destroy).unwrap();

        let names: Vec<&str> = records.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec!["dispersy-destroy-community", "dispersy-identity"]
        );
        assert_eq!(records[0].1, destroy.packet);
        assert_eq!(records[1].1, identity.packet);
    }

    #[test]
    fn destroy_by_stranger_is_rejected() {
        let master = PrivateMember::generate();
        let stranger = PrivateMember::generate();
        let cid = Cid::from(master.mid());
        let mut community = tracker(cid);

        let destroy = encode(
            &stranger,
            cid,
            3,
            Payload::DestroyCommunity(DestroyCommunityPayload {
                degree: DestroyDegree::Hard,
            }),
        );
        assert!(community.prepare_destroy(&destroy).is_none());
    }

    #[test]
    fn hard_killed_community_replays_the_destroy_packet() {
        let master = PrivateMember::generate();
        let walker = PrivateMember::generate();
        let cid = Cid::from(master.mid());
        let community = tracker(cid);
        let now = Instant::now();

        let destroy = encode(
            &master,
            cid,
            3,
            Payload::DestroyCommunity(DestroyCommunityPayload {
                degree: DestroyDegree::Hard,
            }),
        );
        let mut killed = community.into_hard_killed(destroy.packet.clone());

        let request = intro_request(&walker, cid);
        let outgoing = killed.handle_message(&request, addr(6), now, true);

        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].kind, MessageKind::DestroyCommunity);
        assert_eq!(outgoing[0].packet, destroy.packet);
    }
}
