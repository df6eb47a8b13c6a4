//! # Tracker Engine
//!
//! The process core of the rendezvous tracker: the cid→overlay table, the
//! on-demand overlay factory, packet routing, strike-based aging, startup
//! replay of the destroy-evidence log, and the periodic stdout statistics.
//!
//! All state is owned by the single I/O task driving
//! [`TrackerEngine::handle_packet`] and the tick methods; nothing here
//! needs a lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::candidate::{Candidate, WalkCandidate};
use crate::community::Outgoing;
use crate::config::{STRIKE_LIMIT, WIRE_VERSION};
use crate::discovery::{DiscoveryCommunity, DiscoveryConfig, OverlayDirectory};
use crate::identity::{Cid, CryptoPolicy, PrivateMember};
use crate::tracker::community::{
    print_telemetry_line, TrackerCommunity, TrackerHardKilledCommunity,
};
use crate::tracker::storage::EvidenceLog;
use crate::wire::{peek_header, Conversion, Message, MessageKind, WireError};

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Byte and message counters behind the `BANDWIDTH` / `OUTGOING` telemetry.
#[derive(Debug, Default)]
pub struct Statistics {
    pub total_up: u64,
    pub total_down: u64,
    outgoing: HashMap<&'static str, u64>,
}

impl Statistics {
    fn record_outgoing(&mut self, outgoing: &[Outgoing]) {
        for action in outgoing {
            let copies = action.targets.len() as u64;
            self.total_up += action.packet.len() as u64 * copies;
            *self.outgoing.entry(action.kind.name()).or_default() += copies;
        }
    }

    pub fn outgoing_count(&self, name: &str) -> u64 {
        self.outgoing.get(name).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Overlay table
// ---------------------------------------------------------------------------

/// One slot in the overlay table.
enum TrackerOverlay {
    Tracker(TrackerCommunity),
    HardKilled(TrackerHardKilledCommunity),
}

impl TrackerOverlay {
    fn update_strikes(&mut self, now: Instant) -> u32 {
        match self {
            TrackerOverlay::Tracker(community) => community.update_strikes(now),
            TrackerOverlay::HardKilled(community) => community.update_strikes(now),
        }
    }

    fn verified_count(&self, now: Instant) -> usize {
        match self {
            TrackerOverlay::Tracker(community) => community.base().candidates.verified_count(now),
            TrackerOverlay::HardKilled(community) => {
                community.base().candidates.verified_count(now)
            }
        }
    }

    fn decode(&self, packet: &[u8]) -> Result<Message, WireError> {
        match self {
            TrackerOverlay::Tracker(community) => community.base().decode(packet),
            TrackerOverlay::HardKilled(community) => community.base().decode(packet),
        }
    }

    fn add_conversion(&mut self, conversion: Conversion) {
        match self {
            TrackerOverlay::Tracker(community) => community.base_mut().add_conversion(conversion),
            TrackerOverlay::HardKilled(community) => {
                community.base_mut().add_conversion(conversion)
            }
        }
    }

    fn cleanup_candidates(&mut self, now: Instant) {
        match self {
            TrackerOverlay::Tracker(community) => community.base_mut().candidates.cleanup(now),
            TrackerOverlay::HardKilled(community) => {
                community.base_mut().candidates.cleanup(now)
            }
        }
    }
}

/// Directory view handed to the discovery engine. Cross-wired candidates
/// are collected and applied after the handler returns, because the
/// discovery overlay itself may be among the receivers.
struct CollectingDirectory {
    walker_cids: Vec<Cid>,
    pending: Vec<(Cid, Candidate, Instant)>,
}

impl OverlayDirectory for CollectingDirectory {
    fn walker_cids(&self) -> Vec<Cid> {
        self.walker_cids.clone()
    }

    fn add_discovered_candidate(&mut self, cid: Cid, candidate: Candidate, now: Instant) {
        self.pending.push((cid, candidate, now));
    }
}

// ---------------------------------------------------------------------------
// TrackerEngine
// ---------------------------------------------------------------------------

/// The standalone tracker's in-memory state.
pub struct TrackerEngine {
    my_member: PrivateMember,
    policy: CryptoPolicy,
    silent: bool,
    discovery: DiscoveryCommunity,
    overlays: HashMap<Cid, TrackerOverlay>,
    evidence: EvidenceLog,
    statistics: Statistics,
    /// Set while the evidence log replays: telemetry and evidence writes
    /// are suppressed so a restart neither re-logs nor re-prints history.
    replaying: bool,
}

impl TrackerEngine {
    /// Creates the engine with a fresh process-wide member identity.
    pub fn new(state_dir: &Path, silent: bool, policy: CryptoPolicy) -> Self {
        let my_member = PrivateMember::generate();
        info!(mid = %my_member.mid(), "created tracker member");

        let discovery =
            DiscoveryCommunity::new(my_member.clone(), policy, DiscoveryConfig::default());

        Self {
            my_member,
            policy,
            silent,
            discovery,
            overlays: HashMap::new(),
            evidence: EvidenceLog::new(state_dir),
            statistics: Statistics::default(),
            replaying: false,
        }
    }

    pub fn discovery(&self) -> &DiscoveryCommunity {
        &self.discovery
    }

    pub fn discovery_mut(&mut self) -> &mut DiscoveryCommunity {
        &mut self.discovery
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn evidence_log(&self) -> &EvidenceLog {
        &self.evidence
    }

    /// Number of live tracker overlays (killed ones included, discovery
    /// excluded).
    pub fn overlay_count(&self) -> usize {
        self.overlays.len()
    }

    pub fn has_overlay(&self, cid: Cid) -> bool {
        self.overlays.contains_key(&cid)
    }

    /// Whether `cid` is present in its post-destroy form.
    pub fn is_killed(&self, cid: Cid) -> bool {
        matches!(self.overlays.get(&cid), Some(TrackerOverlay::HardKilled(_)))
    }

    /// Replays the destroy-evidence log through the normal packet path,
    /// newest line first, with a loopback sender. Every line is
    /// best-effort: a bad packet is logged and skipped, and an unreadable
    /// file means starting with an empty destroy history, not refusing to
    /// start.
    pub fn start(&mut self, now: Instant) {
        let packets = match self.evidence.load() {
            Ok(packets) => packets,
            Err(error) => {
                warn!(%error, "failed to load destroy evidence, starting empty");
                return;
            }
        };
        if packets.is_empty() {
            return;
        }
        info!(count = packets.len(), "replaying destroy evidence");

        self.replaying = true;
        let loopback = Candidate::loopback().sock_addr;
        for packet in packets.into_iter().rev() {
            let _ = self.handle_packet(&packet, loopback, now);
        }
        self.replaying = false;
    }

    // -- packet path ------------------------------------------------------

    /// Routes one UDP datagram. Returns the packets to transmit.
    pub fn handle_packet(
        &mut self,
        packet: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        self.statistics.total_down += packet.len() as u64;

        let header = match peek_header(packet) {
            Ok(header) => header,
            Err(error) => {
                debug!(%from, %error, "dropping unroutable packet");
                return Vec::new();
            }
        };

        let outgoing = if header.cid == self.discovery.base().cid() {
            self.handle_discovery_packet(packet, from, now)
        } else {
            self.handle_tracker_packet(header.cid, header.kind, packet, from, now)
        };

        self.statistics.record_outgoing(&outgoing);
        outgoing
    }

    fn handle_discovery_packet(
        &mut self,
        packet: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        let message = match self.discovery.base().decode(packet) {
            Ok(message) => message,
            Err(error) => {
                debug!(%from, %error, "cannot decode discovery packet");
                return Vec::new();
            }
        };

        let mut directory = CollectingDirectory {
            walker_cids: vec![self.discovery.base().cid()],
            pending: Vec::new(),
        };

        let outgoing = match message.kind() {
            MessageKind::SimilarityRequest => {
                self.discovery
                    .on_similarity_request(&message, from, &mut directory, now)
            }
            MessageKind::SimilarityResponse => {
                self.discovery
                    .on_similarity_response(&message, from, &mut directory, now)
            }
            MessageKind::Ping => self.discovery.on_ping(&message, from, now),
            MessageKind::Pong => {
                self.discovery.on_pong(&message, from, now);
                Vec::new()
            }
            MessageKind::IntroductionRequest => {
                self.discovery.on_introduction_request(&message, from, now)
            }
            MessageKind::IntroductionResponse => {
                self.discovery.on_introduction_response(&message, from, now);
                Vec::new()
            }
            MessageKind::PunctureRequest => self.discovery.on_puncture_request(&message),
            MessageKind::Puncture => {
                self.discovery.on_puncture(&message, from, now);
                Vec::new()
            }
            MessageKind::Identity => {
                self.discovery.base_mut().on_identity(&message);
                Vec::new()
            }
            MessageKind::MissingIdentity => {
                self.discovery.base().on_missing_identity(&message, from)
            }
            other => {
                debug!(kind = ?other, "discovery overlay ignores this kind");
                Vec::new()
            }
        };

        // Apply the collected cross-wires. On a tracker only the discovery
        // overlay walks, so they all route back to it.
        let discovery_cid = self.discovery.base().cid();
        for (cid, candidate, at) in directory.pending {
            if cid == discovery_cid {
                self.discovery
                    .base_mut()
                    .candidates
                    .add_discovered(candidate, at);
            }
        }

        outgoing
    }

    fn handle_tracker_packet(
        &mut self,
        cid: Cid,
        kind: MessageKind,
        packet: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        if !TrackerCommunity::handles(kind) {
            debug!(%cid, ?kind, "dropping kind outside the tracker message set");
            return Vec::new();
        }

        let overlay = self.get_or_create(cid);

        // Lazy conversion install: an unseen community version byte under
        // our wire version gets a conversion manufactured on the spot and
        // the decode retried once.
        let message = match overlay.decode(packet) {
            Ok(message) => message,
            Err(WireError::ConversionNotFound(version)) if packet[0] == WIRE_VERSION => {
                overlay.add_conversion(Conversion::new(version));
                match overlay.decode(packet) {
                    Ok(message) => message,
                    Err(error) => {
                        debug!(%cid, %error, "cannot decode");
                        return Vec::new();
                    }
                }
            }
            Err(error) => {
                debug!(%cid, %error, "cannot decode");
                return Vec::new();
            }
        };

        if kind == MessageKind::DestroyCommunity {
            return self.handle_destroy(cid, &message, from, now);
        }

        let silent = self.silent || self.replaying;
        match self.overlays.get_mut(&cid).expect("created above") {
            TrackerOverlay::Tracker(community) => {
                community.handle_message(&message, from, now, silent)
            }
            TrackerOverlay::HardKilled(community) => {
                community.handle_message(&message, from, now, silent)
            }
        }
    }

    /// The on-demand factory: any CID we have never seen gets a freshly
    /// synthesized overlay.
    fn get_or_create(&mut self, cid: Cid) -> &mut TrackerOverlay {
        self.overlays.entry(cid).or_insert_with(|| {
            debug!(%cid, "synthesizing tracker community");
            TrackerOverlay::Tracker(TrackerCommunity::new(
                cid,
                self.my_member.clone(),
                self.policy,
            ))
        })
    }

    /// The destroy transition: validate, persist evidence, then replace the
    /// overlay with its hard-killed form.
    fn handle_destroy(
        &mut self,
        cid: Cid,
        message: &Message,
        from: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        let Some(overlay) = self.overlays.remove(&cid) else {
            return Vec::new();
        };

        match overlay {
            TrackerOverlay::Tracker(mut community) => {
                match community.prepare_destroy(message) {
                    Some(records) => {
                        if !self.silent && !self.replaying {
                            print_telemetry_line("DESTROY_IN", message, from);
                        }
                        if !self.replaying {
                            if let Err(error) = self.evidence.append(&from.to_string(), &records)
                            {
                                warn!(%error, "failed to persist destroy evidence");
                            }
                        }
                        info!(%cid, "community destroyed, replacing with hard-killed form");
                        let killed = community.into_hard_killed(message.packet.clone());
                        self.overlays.insert(cid, TrackerOverlay::HardKilled(killed));
                    }
                    None => {
                        // Unauthorized: the overlay lives on untouched.
                        self.overlays.insert(cid, TrackerOverlay::Tracker(community));
                    }
                }
                Vec::new()
            }
            TrackerOverlay::HardKilled(mut killed) => {
                let outgoing = killed.handle_message(message, from, now, true);
                self.overlays.insert(cid, TrackerOverlay::HardKilled(killed));
                outgoing
            }
        }
    }

    // -- periodic tasks ---------------------------------------------------

    /// The strike tick: every overlay is asked to update its strikes, and
    /// those at the limit are unloaded. The discovery overlay is exempt;
    /// it is always active.
    pub fn unload_inactive_communities(&mut self, now: Instant) {
        // Expired candidate entries go first; overlays that survive the
        // strike pass keep only live table entries.
        self.discovery.base_mut().candidates.cleanup(now);

        let total = self.overlays.len() + 1;
        let inactive: Vec<Cid> = self
            .overlays
            .iter_mut()
            .filter_map(|(cid, overlay)| {
                overlay.cleanup_candidates(now);
                (overlay.update_strikes(now) >= STRIKE_LIMIT).then_some(*cid)
            })
            .collect();

        if !self.silent {
            println!("#cleaned {}/{} communities", inactive.len(), total);
        }
        for cid in inactive {
            info!(%cid, "unloading inactive community");
            self.overlays.remove(&cid);
        }
    }

    /// Emits the periodic statistics block on stdout.
    pub fn report_statistics(&self, now: Instant) {
        let trackers = self
            .overlays
            .values()
            .filter(|overlay| matches!(overlay, TrackerOverlay::Tracker(_)))
            .count();
        let killed = self.overlays.len() - trackers;

        println!(
            "BANDWIDTH {} {}",
            self.statistics.total_up, self.statistics.total_down
        );
        println!("COMMUNITY {} {} {}", trackers, killed, 1);

        let verified: usize = self
            .overlays
            .values()
            .map(|overlay| overlay.verified_count(now))
            .sum::<usize>()
            + self.discovery.base().candidates.verified_count(now);
        println!("CANDIDATE2 {verified}");

        for (name, count) in &self.statistics.outgoing {
            println!("OUTGOING {name} {count}");
        }
    }

    /// Request-cache expiry for the discovery overlay.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<Outgoing> {
        let outgoing = self.discovery.poll_timeouts(now);
        self.statistics.record_outgoing(&outgoing);
        outgoing
    }

    /// The discovery overlay's liveness tick.
    pub fn create_ping_requests(&mut self, now: Instant) -> Vec<Outgoing> {
        let outgoing = self.discovery.create_ping_requests(now);
        self.statistics.record_outgoing(&outgoing);
        outgoing
    }

    /// Exposes a walk candidate snapshot for tests and diagnostics.
    pub fn verified_candidate(&self, cid: Cid, sock_addr: SocketAddr) -> Option<WalkCandidate> {
        match self.overlays.get(&cid)? {
            TrackerOverlay::Tracker(community) => {
                community.base().candidates.get(&sock_addr).cloned()
            }
            TrackerOverlay::HardKilled(community) => {
                community.base().candidates.get(&sock_addr).cloned()
            }
        }
    }

    /// Strike count of an overlay, if loaded.
    pub fn strikes(&self, cid: Cid) -> Option<u32> {
        match self.overlays.get(&cid)? {
            TrackerOverlay::Tracker(community) => Some(community.strikes()),
            TrackerOverlay::HardKilled(community) => Some(community.strikes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::ConnectionType;
    use crate::config::COMMUNITY_VERSION;
    use crate::wire::{
        DestroyCommunityPayload, DestroyDegree, IntroductionRequestPayload, Payload,
    };
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 7, 0, 1)), port)
    }

    fn engine(dir: &Path) -> TrackerEngine {
        TrackerEngine::new(dir, true, CryptoPolicy::NoVerify)
    }

    fn encode_with_version(
        member: &PrivateMember,
        cid: Cid,
        community_version: u8,
        payload: Payload,
    ) -> bytes::Bytes {
        Conversion::new(community_version)
            .encode(cid, 10, &payload, member, CryptoPolicy::NoVerify)
            .unwrap()
    }

    fn intro_request(member: &PrivateMember, cid: Cid, community_version: u8) -> bytes::Bytes {
        encode_with_version(
            member,
            cid,
            community_version,
            Payload::IntroductionRequest(IntroductionRequestPayload {
                destination_address: addr(1),
                source_lan_address: addr(2),
                source_wan_address: addr(3),
                advice: true,
                connection_type: ConnectionType::Public,
                sync: None,
                identifier: 7,
                introduce_me_to: None,
            }),
        )
    }

    #[test]
    fn unknown_cid_synthesizes_an_overlay_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        let walker = PrivateMember::generate();
        let cid = Cid([0x44; 20]);
        let now = Instant::now();

        assert_eq!(engine.overlay_count(), 0);
        let outgoing = engine.handle_packet(
            &intro_request(&walker, cid, COMMUNITY_VERSION),
            addr(9),
            now,
        );

        assert_eq!(engine.overlay_count(), 1);
        assert!(engine.has_overlay(cid));
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].kind, MessageKind::IntroductionResponse);
    }

    #[test]
    fn unseen_community_version_installs_a_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        let walker = PrivateMember::generate();
        let cid = Cid([0x45; 20]);
        let now = Instant::now();

        let packet = intro_request(&walker, cid, 0x07);
        let outgoing = engine.handle_packet(&packet, addr(9), now);
        assert_eq!(outgoing.len(), 1);

        // And again: the installed conversion is reused, not duplicated.
        let outgoing = engine.handle_packet(&packet, addr(9), now);
        assert_eq!(outgoing.len(), 1);
    }

    #[test]
    fn strike_aging_unloads_idle_overlays_after_three_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        let walker = PrivateMember::generate();
        let cid = Cid([0x46; 20]);
        let now = Instant::now();

        engine.handle_packet(&intro_request(&walker, cid, COMMUNITY_VERSION), addr(9), now);

        // The walker keeps the overlay alive while verified.
        engine.unload_inactive_communities(now);
        assert_eq!(engine.strikes(cid), Some(0));

        // Once the candidate expires, three silent ticks kill it.
        let later = now + crate::config::CANDIDATE_WALK_LIFETIME + std::time::Duration::from_secs(1);
        engine.unload_inactive_communities(later);
        engine.unload_inactive_communities(later);
        assert!(engine.has_overlay(cid));
        engine.unload_inactive_communities(later);
        assert!(!engine.has_overlay(cid));
    }

    #[test]
    fn destroy_persists_evidence_and_swaps_to_hard_killed() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        let master = PrivateMember::generate();
        let walker = PrivateMember::generate();
        let cid = Cid::from(master.mid());
        let now = Instant::now();

        engine.handle_packet(&intro_request(&walker, cid, COMMUNITY_VERSION), addr(9), now);

        let destroy = encode_with_version(
            &master,
            cid,
            COMMUNITY_VERSION,
            Payload::DestroyCommunity(DestroyCommunityPayload {
                degree: DestroyDegree::Hard,
            }),
        );
        engine.handle_packet(&destroy, addr(10), now);

        assert!(engine.is_killed(cid));
        let contents = std::fs::read_to_string(engine.evidence_log().path()).unwrap();
        assert!(contents.contains("# received dispersy-destroy-community from"));
        assert!(contents.contains(&format!(
            "dispersy-destroy-community {}",
            hex::encode(&destroy)
        )));

        // A late walker now receives the destroy packet back.
        let outgoing = engine.handle_packet(
            &intro_request(&walker, cid, COMMUNITY_VERSION),
            addr(11),
            now,
        );
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].kind, MessageKind::DestroyCommunity);
        assert_eq!(&outgoing[0].packet[..], &destroy[..]);
    }

    #[test]
    fn restart_replays_the_killed_state_without_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let master = PrivateMember::generate();
        let walker = PrivateMember::generate();
        let cid = Cid::from(master.mid());
        let now = Instant::now();

        {
            let mut engine = engine(dir.path());
            engine.handle_packet(&intro_request(&walker, cid, COMMUNITY_VERSION), addr(9), now);
            let destroy = encode_with_version(
                &master,
                cid,
                COMMUNITY_VERSION,
                Payload::DestroyCommunity(DestroyCommunityPayload {
                    degree: DestroyDegree::Hard,
                }),
            );
            engine.handle_packet(&destroy, addr(10), now);
            assert!(engine.is_killed(cid));
        }

        // A fresh process, same state dir: the overlay comes back killed.
        let mut engine = engine(dir.path());
        engine.start(now);
        assert!(engine.is_killed(cid));

        // And the replay did not double the evidence file.
        let lines = std::fs::read_to_string(engine.evidence_log().path())
            .unwrap()
            .lines()
            .filter(|line| line.starts_with("dispersy-destroy-community"))
            .count();
        assert_eq!(lines, 1);
    }

    #[test]
    fn bandwidth_counters_track_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        let walker = PrivateMember::generate();
        let cid = Cid([0x47; 20]);
        let now = Instant::now();

        let packet = intro_request(&walker, cid, COMMUNITY_VERSION);
        let outgoing = engine.handle_packet(&packet, addr(9), now);

        assert_eq!(engine.statistics().total_down, packet.len() as u64);
        assert_eq!(
            engine.statistics().total_up,
            outgoing.iter().map(|o| o.packet.len() as u64).sum::<u64>()
        );
        assert_eq!(
            engine
                .statistics()
                .outgoing_count("dispersy-introduction-response"),
            1
        );
    }
}
