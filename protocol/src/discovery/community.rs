//! # Discovery Community
//!
//! The similarity-driven discovery engine. For the local peer it
//! continuously finds other peers sharing overlay memberships ("taste
//! buddies"), keeps them ranked and alive, and steers the introduction walk
//! toward them.
//!
//! The engine is sans-I/O: every handler takes the current [`Instant`] and
//! returns the packets to transmit as [`Outgoing`] actions. Time-driven
//! behavior happens in two tick methods the runtime calls:
//! [`DiscoveryCommunity::create_ping_requests`] every [`PING_INTERVAL`] and
//! [`DiscoveryCommunity::poll_timeouts`] for request-cache expiry.
//!
//! ## The walk, steered
//!
//! ```text
//!  walker about to visit D ──► D already a buddy / advertised / seed? ──► plain introduction-request
//!                      │ no
//!                      ▼
//!             similarity-request ──► response: D's preferences + per-buddy
//!                      │              32-bit overlap bitfields
//!                      ▼
//!             record ATB for D, PTBs for advertised third parties
//!                      ▼
//!             introduction-request to most similar, introduce_me_to=<its MID>
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use rand::seq::SliceRandom;
use tracing::{debug, trace, warn};

use crate::candidate::{Candidate, ConnectionType, WalkCandidate};
use crate::community::{CommunityBase, Outgoing, ACCEPTABLE_GLOBAL_TIME_RANGE};
use crate::config::{
    DEFAULT_MAX_PREFERENCES, DEFAULT_MAX_TASTE_BUDDIES, OVERLAP_BITFIELD_BITS, PING_INTERVAL,
    REQUEST_TIMEOUT,
};
use crate::discovery::buddies::{ActualTasteBuddy, PossibleTasteBuddy};
use crate::identity::{Cid, CryptoPolicy, Mid, PrivateMember};
use crate::requestcache::RequestCache;
use crate::wire::{
    BuddyOverlap, IntroductionRequestPayload, Message, MessageKind, Payload, PingPayload,
    PongPayload, SimilarityRequestPayload, SimilarityResponsePayload,
};

/// Tag from which the well-known discovery overlay identifier is derived.
const DISCOVERY_MASTER_TAG: &[u8] = b"kindred-discovery-overlay-v1";

/// The compiled-in identifier of the discovery overlay itself.
pub fn discovery_cid() -> Cid {
    Cid::from(Mid::from_public_key_bytes(DISCOVERY_MASTER_TAG))
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// The discovery engine's view of the other overlays loaded in this
/// process: which ones walk (their CIDs are our preferences), and a way to
/// hand a candidate to an overlay's own table when a taste buddy turns out
/// to share it.
pub trait OverlayDirectory {
    /// CIDs of the local overlays that enable candidate walking.
    fn walker_cids(&self) -> Vec<Cid>;

    /// Cross-wire a discovered candidate into the overlay `cid`.
    fn add_discovered_candidate(&mut self, cid: Cid, candidate: Candidate, now: Instant);
}

// ---------------------------------------------------------------------------
// Request-cache entries
// ---------------------------------------------------------------------------

/// An outstanding similarity request. On timeout the deferred introduction
/// request is sent plain.
#[derive(Debug)]
struct SimilarityAttempt {
    destination: SocketAddr,
    /// Our preference list exactly as transmitted; bitfields in the
    /// response index into it.
    preference_list: Vec<Cid>,
}

/// An outstanding introduction request; completion marks the destination
/// walked. Retries are the walker's business, not ours.
#[derive(Debug)]
struct IntroductionAttempt {
    destination: SocketAddr,
}

/// One round of pings sharing an identifier. Carries candidate addresses,
/// never references into the buddy registry.
#[derive(Debug)]
struct PingRequestCache {
    requested: Vec<SocketAddr>,
    received: HashSet<SocketAddr>,
}

impl PingRequestCache {
    fn did_request(&self, sock_addr: SocketAddr) -> bool {
        self.requested.contains(&sock_addr)
    }

    /// Records a pong. Returns true when every requested candidate has
    /// answered.
    fn on_success(&mut self, sock_addr: SocketAddr) -> bool {
        if self.did_request(sock_addr) {
            self.received.insert(sock_addr);
        }
        self.is_complete()
    }

    fn is_complete(&self) -> bool {
        self.received.len() == self.requested.len()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables of the discovery engine.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Maximum preferences transmitted per similarity message.
    pub max_prefs: usize,
    /// Maximum buddy bitfields per similarity response.
    pub max_tbs: usize,
    /// Our own addressing, echoed in similarity and introduction requests.
    pub lan_address: SocketAddr,
    pub wan_address: SocketAddr,
    pub connection_type: ConnectionType,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_prefs: DEFAULT_MAX_PREFERENCES,
            max_tbs: DEFAULT_MAX_TASTE_BUDDIES,
            lan_address: "0.0.0.0:0".parse().expect("static address"),
            wan_address: "0.0.0.0:0".parse().expect("static address"),
            connection_type: ConnectionType::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// DiscoveryCommunity
// ---------------------------------------------------------------------------

/// The discovery overlay engine.
pub struct DiscoveryCommunity {
    base: CommunityBase,
    config: DiscoveryConfig,
    taste_buddies: Vec<ActualTasteBuddy>,
    possible_taste_buddies: Vec<PossibleTasteBuddy>,
    /// Steering state: who asked to be introduced to whom. Consumed on the
    /// next introduction involving that member.
    requested_introductions: HashMap<Mid, Option<WalkCandidate>>,
    similarity_attempts: RequestCache<SimilarityAttempt>,
    introduction_attempts: RequestCache<IntroductionAttempt>,
    ping_requests: RequestCache<PingRequestCache>,
    /// Resolved bootstrap seeds; similarity is never attempted on these.
    bootstrap_candidates: HashSet<SocketAddr>,
    /// Set once the first buddy exists; tells the runtime the periodic
    /// ping task is wanted.
    ping_task_scheduled: bool,
    /// Bytes of similarity requests sent / responses received.
    pub send_packet_size: usize,
    pub reply_packet_size: usize,
}

impl DiscoveryCommunity {
    pub fn new(my_member: PrivateMember, policy: CryptoPolicy, config: DiscoveryConfig) -> Self {
        Self {
            base: CommunityBase::new(discovery_cid(), my_member, policy),
            config,
            taste_buddies: Vec::new(),
            possible_taste_buddies: Vec::new(),
            requested_introductions: HashMap::new(),
            similarity_attempts: RequestCache::new("similarity", REQUEST_TIMEOUT),
            introduction_attempts: RequestCache::new("introduction", REQUEST_TIMEOUT),
            ping_requests: RequestCache::new("ping", REQUEST_TIMEOUT),
            bootstrap_candidates: HashSet::new(),
            ping_task_scheduled: false,
            send_packet_size: 0,
            reply_packet_size: 0,
        }
    }

    pub fn base(&self) -> &CommunityBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut CommunityBase {
        &mut self.base
    }

    /// The discovery overlay always participates in the walk.
    pub fn enable_candidate_walker(&self) -> bool {
        true
    }

    /// True once the periodic ping task should be running.
    pub fn ping_task_scheduled(&self) -> bool {
        self.ping_task_scheduled
    }

    /// Injects freshly resolved bootstrap seeds: they become discovered
    /// candidates and are exempted from similarity probing.
    pub fn add_bootstrap_candidates(&mut self, seeds: &[SocketAddr], now: Instant) {
        for sock_addr in seeds {
            trace!(%sock_addr, "adding resolved seed as discovered candidate");
            self.bootstrap_candidates.insert(*sock_addr);
            self.base
                .candidates
                .add_discovered(Candidate::new(*sock_addr, false), now);
        }
    }

    // -- preferences ------------------------------------------------------

    /// Our preference list: the walker-enabled overlays of this process.
    fn my_preferences(&self, directory: &dyn OverlayDirectory) -> Vec<Cid> {
        directory.walker_cids()
    }

    /// `|his ∩ mine|` — the similarity measure everything here ranks by.
    pub fn compute_overlap(his: &HashSet<Cid>, mine: &[Cid]) -> usize {
        mine.iter().filter(|cid| his.contains(cid)).count()
    }

    // -- taste-buddy registry (4.C) ---------------------------------------

    /// Folds confirmed buddies into the ranked registry.
    pub fn add_taste_buddies(
        &mut self,
        new_buddies: Vec<ActualTasteBuddy>,
        directory: &mut dyn OverlayDirectory,
        now: Instant,
    ) {
        let my_communities = self.my_preferences(directory);

        for new_buddy in new_buddies {
            let merged = match self.taste_buddies.iter_mut().find(|buddy| {
                buddy.matches_sock_addr(new_buddy.sock_addr()) || buddy.matches_mid(new_buddy.mid)
            }) {
                Some(existing) => {
                    trace!(buddy = %new_buddy, "merging known taste buddy");
                    existing.update_overlap(&new_buddy, |prefs| {
                        Self::compute_overlap(prefs, &my_communities)
                    });
                    existing.timestamp = now;
                    true
                }
                None => false,
            };

            if !merged {
                debug!(buddy = %new_buddy, "new taste buddy");
                // The member is confirmed now; any third-party advertisement
                // of it is obsolete.
                let mid = new_buddy.mid;
                self.possible_taste_buddies
                    .retain(|possible| !possible.matches_mid(mid));
                self.taste_buddies.push(new_buddy.clone());

                if !self.ping_task_scheduled {
                    self.ping_task_scheduled = true;
                }
            }

            // Cross-wire: hand the candidate to every local overlay the
            // buddy shares with us.
            for cid in &new_buddy.preferences {
                if my_communities.contains(cid) {
                    directory.add_discovered_candidate(
                        *cid,
                        Candidate::new(new_buddy.sock_addr(), new_buddy.candidate.tunnel),
                        now,
                    );
                }
            }
        }

        self.taste_buddies
            .sort_by(|a, b| b.overlap.cmp(&a.overlap));
        debug!(count = self.taste_buddies.len(), "taste buddy registry updated");
    }

    /// Prunes stale buddies, then returns a shuffled snapshot of those with
    /// nonzero overlap, skipping `ignore`.
    ///
    /// Every read of the registry funnels through here, so staleness
    /// pruning rides along with reading. There is no separate sweep.
    pub fn yield_taste_buddies(
        &mut self,
        now: Instant,
        ignore: Option<SocketAddr>,
    ) -> Vec<ActualTasteBuddy> {
        self.taste_buddies.retain(|buddy| {
            if buddy.is_stale(now) {
                debug!(buddy = %buddy, "removing stale taste buddy");
                false
            } else {
                true
            }
        });

        let mut snapshot: Vec<ActualTasteBuddy> = self
            .taste_buddies
            .iter()
            .filter(|buddy| buddy.overlap > 0 && Some(buddy.sock_addr()) != ignore)
            .cloned()
            .collect();
        snapshot.shuffle(&mut rand::thread_rng());
        snapshot
    }

    /// Is this candidate a confirmed buddy?
    pub fn is_taste_buddy(&mut self, candidate: &WalkCandidate, now: Instant) -> bool {
        self.yield_taste_buddies(now, None)
            .iter()
            .any(|buddy| buddy.matches_candidate(candidate))
    }

    /// Is this member a confirmed buddy?
    pub fn is_taste_buddy_mid(&mut self, mid: Mid, now: Instant) -> Option<ActualTasteBuddy> {
        self.yield_taste_buddies(now, None)
            .into_iter()
            .find(|buddy| buddy.matches_mid(mid))
    }

    /// Refreshes the buddy behind `sock_addr` after any sign of life.
    pub fn reset_taste_buddy(&mut self, sock_addr: SocketAddr, now: Instant) {
        // Prune first: a buddy that already went stale does not get revived.
        self.yield_taste_buddies(now, None);
        if let Some(buddy) = self
            .taste_buddies
            .iter_mut()
            .find(|buddy| buddy.matches_sock_addr(sock_addr))
        {
            buddy.timestamp = now;
        }
    }

    /// Drops the buddy behind `sock_addr`.
    pub fn remove_taste_buddy(&mut self, sock_addr: SocketAddr, now: Instant) {
        self.yield_taste_buddies(now, None);
        self.taste_buddies
            .retain(|buddy| !buddy.matches_sock_addr(sock_addr));
    }

    /// Number of live buddies (without pruning).
    pub fn taste_buddy_count(&self) -> usize {
        self.taste_buddies.len()
    }

    /// The ranked registry, highest overlap first. Read-only view; all
    /// mutation goes through the operations above.
    pub fn taste_buddies(&self) -> &[ActualTasteBuddy] {
        &self.taste_buddies
    }

    /// The ranked possible-buddy list, highest overlap first.
    pub fn possible_taste_buddies(&self) -> &[PossibleTasteBuddy] {
        &self.possible_taste_buddies
    }

    /// Folds advertised buddies into the possible list.
    pub fn add_possible_taste_buddies(
        &mut self,
        possibles: Vec<PossibleTasteBuddy>,
        directory: &dyn OverlayDirectory,
        now: Instant,
    ) {
        let my_communities = self.my_preferences(directory);
        let my_mid = self.base.my_mid();

        for mut new_possible in possibles {
            if new_possible.mid == my_mid
                || self.is_taste_buddy_mid(new_possible.mid, now).is_some()
            {
                trace!(possible = %new_possible, "ignoring possible buddy (self or confirmed)");
                continue;
            }

            match self
                .possible_taste_buddies
                .iter()
                .position(|possible| possible.matches_mid(new_possible.mid))
            {
                Some(index) => {
                    // The fresh advertisement wins: it keeps the newer
                    // timestamp and relay, absorbing the old preferences.
                    new_possible.update_overlap(&self.possible_taste_buddies[index], |prefs| {
                        Self::compute_overlap(prefs, &my_communities)
                    });
                    self.possible_taste_buddies[index] = new_possible;
                }
                None => self.possible_taste_buddies.push(new_possible),
            }
        }

        self.possible_taste_buddies
            .sort_by(|a, b| b.overlap.cmp(&a.overlap));
        debug!(
            count = self.possible_taste_buddies.len(),
            "possible taste buddies updated"
        );
    }

    /// Drops stale possibles and any whose member has since been confirmed.
    pub fn clean_possible_taste_buddies(&mut self, now: Instant) {
        let confirmed: HashSet<Mid> = self
            .yield_taste_buddies(now, None)
            .iter()
            .map(|buddy| buddy.mid)
            .collect();

        self.possible_taste_buddies.retain(|possible| {
            let too_old = possible.is_stale(now);
            let is_buddy = confirmed.contains(&possible.mid);
            if too_old || is_buddy {
                debug!(%too_old, %is_buddy, possible = %possible, "removing possible taste buddy");
            }
            !(too_old || is_buddy)
        });
    }

    /// Does any possible buddy originate from this candidate?
    pub fn has_possible_taste_buddies(&self, sock_addr: SocketAddr) -> bool {
        self.possible_taste_buddies
            .iter()
            .any(|possible| possible.received_from_addr(sock_addr))
    }

    pub fn possible_taste_buddy_count(&self) -> usize {
        self.possible_taste_buddies.len()
    }

    /// The steering decision: pop the most similar advertised buddy and
    /// route the walk through whoever advertised it, or fall back to
    /// `fallback`.
    pub fn get_most_similar(
        &mut self,
        fallback: SocketAddr,
        now: Instant,
    ) -> (SocketAddr, Option<Mid>) {
        self.clean_possible_taste_buddies(now);

        if !self.possible_taste_buddies.is_empty() {
            let most_similar = self.possible_taste_buddies.remove(0);
            return (most_similar.received_from.sock_addr, Some(most_similar.mid));
        }

        (fallback, None)
    }

    // -- similarity protocol (4.D) ----------------------------------------

    /// Intercepts the walker's next introduction step toward `destination`:
    /// either a similarity request goes out first (deferring the
    /// introduction), or the introduction request is sent plain.
    pub fn create_introduction_request(
        &mut self,
        destination: &WalkCandidate,
        directory: &mut dyn OverlayDirectory,
        now: Instant,
    ) -> Vec<Outgoing> {
        let skip_similarity = self.is_taste_buddy(destination, now)
            || self.has_possible_taste_buddies(destination.sock_addr)
            || self.bootstrap_candidates.contains(&destination.sock_addr);

        if !skip_similarity {
            if let Some(outgoing) = self.create_similarity_request(destination, directory, now) {
                return outgoing;
            }
        }

        self.send_introduction_request(destination.sock_addr, None, now)
    }

    /// Sends a similarity request carrying our preference list. Returns
    /// `None` when there is nothing to compare (no walker-enabled overlays,
    /// or `max_prefs` of zero); the caller then proceeds with a plain
    /// introduction.
    pub fn create_similarity_request(
        &mut self,
        destination: &WalkCandidate,
        directory: &dyn OverlayDirectory,
        now: Instant,
    ) -> Option<Vec<Outgoing>> {
        let mut preference_list = self.my_preferences(directory);
        preference_list.truncate(self.config.max_prefs);
        if preference_list.is_empty() {
            return None;
        }

        let identifier = self.similarity_attempts.add(
            SimilarityAttempt {
                destination: destination.sock_addr,
                preference_list: preference_list.clone(),
            },
            now,
        );

        let payload = Payload::SimilarityRequest(SimilarityRequestPayload {
            identifier,
            lan_address: self.config.lan_address,
            wan_address: self.config.wan_address,
            connection_type: self.config.connection_type,
            preference_list,
        });
        let packet = self.encode_or_drop(&payload)?;
        self.send_packet_size += packet.len();

        debug!(
            destination = %destination.sock_addr,
            identifier,
            "sending similarity request"
        );
        Some(vec![Outgoing::to_one(
            destination.sock_addr,
            MessageKind::SimilarityRequest,
            packet,
        )])
    }

    /// Emits the (possibly deferred) introduction request.
    pub fn send_introduction_request(
        &mut self,
        destination: SocketAddr,
        introduce_me_to: Option<Mid>,
        now: Instant,
    ) -> Vec<Outgoing> {
        let identifier = self
            .introduction_attempts
            .add(IntroductionAttempt { destination }, now);

        let payload = Payload::IntroductionRequest(IntroductionRequestPayload {
            destination_address: destination,
            source_lan_address: self.config.lan_address,
            source_wan_address: self.config.wan_address,
            advice: true,
            connection_type: self.config.connection_type,
            sync: None,
            identifier,
            introduce_me_to,
        });
        let Some(packet) = self.encode_or_drop(&payload) else {
            return Vec::new();
        };

        self.base
            .candidates
            .add_discovered(Candidate::new(destination, false), now);

        debug!(
            %destination,
            introduce_me_to = introduce_me_to.map(|mid| mid.to_hex()).unwrap_or_default(),
            "sending introduction request"
        );
        vec![Outgoing::to_one(
            destination,
            MessageKind::IntroductionRequest,
            packet,
        )]
    }

    /// Handles an incoming similarity request: record the sender as a
    /// confirmed buddy and answer with our preferences plus per-buddy
    /// overlap bitfields.
    pub fn on_similarity_request(
        &mut self,
        message: &Message,
        from: SocketAddr,
        directory: &mut dyn OverlayDirectory,
        now: Instant,
    ) -> Vec<Outgoing> {
        let Payload::SimilarityRequest(ref payload) = message.payload else {
            return Vec::new();
        };

        let (accepted, _proof) = self.base.timeline.check(message);
        if !accepted {
            debug!(%from, "dropping similarity request pending proof");
            return Vec::new();
        }
        if !self.base.check_global_time(message, ACCEPTABLE_GLOBAL_TIME_RANGE) {
            debug!(%from, "dropping similarity request outside global-time range");
            return Vec::new();
        }
        if self.similarity_attempts.has(payload.identifier) {
            debug!(%from, "got similarity request issued by myself?");
            return Vec::new();
        }
        let Some(sender_mid) = message.sender_mid() else {
            return Vec::new();
        };

        self.base.update_global_time(message.global_time);

        let candidate = self.base.candidates.create_or_update(
            from,
            payload.lan_address,
            payload.wan_address,
            false,
            payload.connection_type,
        );
        candidate.associate(sender_mid);
        let candidate = candidate.clone();

        let his_preferences: Vec<Cid> = payload
            .preference_list
            .iter()
            .copied()
            .take(self.config.max_prefs)
            .collect();
        let preference_set: HashSet<Cid> = his_preferences.iter().copied().collect();

        let my_communities = self.my_preferences(directory);
        let overlap = Self::compute_overlap(&preference_set, &my_communities);
        debug!(%from, overlap, "got similarity request");

        self.add_taste_buddies(
            vec![ActualTasteBuddy::new(
                overlap,
                preference_set,
                now,
                sender_mid,
                candidate,
            )],
            directory,
            now,
        );

        // Rank our confirmed buddies by their overlap with *us*, drop the
        // requester itself, and compress each one's overlap with the
        // requester's preference list into a 32-bit bitfield.
        let mut ranked: Vec<(usize, &ActualTasteBuddy)> = self
            .taste_buddies
            .iter()
            .filter(|buddy| !buddy.matches_mid(sender_mid))
            .map(|buddy| {
                (
                    Self::compute_overlap(&buddy.preferences, &my_communities),
                    buddy,
                )
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        let tb_overlap: Vec<BuddyOverlap> = ranked
            .iter()
            .take(self.config.max_tbs)
            .map(|(_, buddy)| BuddyOverlap {
                mid: buddy.mid,
                bitfield: encode_overlap_bitfield(&his_preferences, |cid| buddy.does_overlap(cid)),
            })
            .collect();

        let mut my_preference_list = my_communities;
        my_preference_list.truncate(self.config.max_prefs);
        let response = Payload::SimilarityResponse(SimilarityResponsePayload {
            identifier: payload.identifier,
            preference_list: my_preference_list,
            tb_overlap,
        });
        let Some(packet) = self.encode_or_drop(&response) else {
            return Vec::new();
        };
        vec![Outgoing::to_one(
            from,
            MessageKind::SimilarityResponse,
            packet,
        )]
    }

    /// Handles a similarity response: confirm the responder, reconstruct
    /// the advertised third parties, then fire the deferred introduction
    /// request toward the most similar destination.
    pub fn on_similarity_response(
        &mut self,
        message: &Message,
        from: SocketAddr,
        directory: &mut dyn OverlayDirectory,
        now: Instant,
    ) -> Vec<Outgoing> {
        let Payload::SimilarityResponse(ref payload) = message.payload else {
            return Vec::new();
        };

        let (accepted, _proof) = self.base.timeline.check(message);
        if !accepted {
            debug!(%from, "dropping similarity response pending proof");
            return Vec::new();
        }
        if !self.similarity_attempts.has(payload.identifier) {
            debug!(%from, identifier = payload.identifier, "unknown identifier");
            return Vec::new();
        }
        let Some(sender_mid) = message.sender_mid() else {
            return Vec::new();
        };

        debug!(%from, "got similarity response");
        self.base.update_global_time(message.global_time);

        let candidate = self.base.candidates.create_or_update(
            from,
            from,
            from,
            false,
            ConnectionType::Unknown,
        );
        candidate.associate(sender_mid);
        let candidate = candidate.clone();

        let his_preferences: HashSet<Cid> = payload
            .preference_list
            .iter()
            .copied()
            .take(self.config.max_prefs)
            .collect();
        let my_communities = self.my_preferences(directory);
        let overlap = Self::compute_overlap(&his_preferences, &my_communities);

        self.add_taste_buddies(
            vec![ActualTasteBuddy::new(
                overlap,
                his_preferences,
                now,
                sender_mid,
                candidate.clone(),
            )],
            directory,
            now,
        );

        // Consume the attempt: its timeout must never fire now.
        let request = self
            .similarity_attempts
            .pop(payload.identifier)
            .expect("presence checked above");

        let possibles: Vec<PossibleTasteBuddy> = payload
            .tb_overlap
            .iter()
            .map(|entry| {
                let preferences =
                    decode_overlap_bitfield(&request.preference_list, entry.bitfield);
                PossibleTasteBuddy::new(
                    preferences.len(),
                    preferences,
                    now,
                    entry.mid,
                    candidate.clone(),
                )
            })
            .collect();
        self.add_possible_taste_buddies(possibles, directory, now);

        self.reply_packet_size += message.packet.len();

        let (destination, introduce_me_to) = self.get_most_similar(from, now);
        self.send_introduction_request(destination, introduce_me_to, now)
    }

    // -- liveness (4.E) ---------------------------------------------------

    /// Periodic tick: ping every buddy that would go stale before the next
    /// tick. All pings of one round share one identifier.
    pub fn create_ping_requests(&mut self, now: Instant) -> Vec<Outgoing> {
        let targets: Vec<SocketAddr> = self
            .yield_taste_buddies(now, None)
            .iter()
            .filter(|buddy| buddy.time_remaining(now) < PING_INTERVAL)
            .map(|buddy| buddy.sock_addr())
            .collect();

        if targets.is_empty() {
            return Vec::new();
        }

        let identifier = self.ping_requests.add(
            PingRequestCache {
                requested: targets.clone(),
                received: HashSet::new(),
            },
            now,
        );

        let payload = Payload::Ping(PingPayload { identifier });
        let Some(packet) = self.encode_or_drop(&payload) else {
            return Vec::new();
        };
        debug!(count = targets.len(), identifier, "pinging taste buddies");
        vec![Outgoing {
            targets,
            kind: MessageKind::Ping,
            packet,
        }]
    }

    /// A ping refreshes the sender and is answered with a pong carrying the
    /// same identifier.
    pub fn on_ping(&mut self, message: &Message, from: SocketAddr, now: Instant) -> Vec<Outgoing> {
        let Payload::Ping(ref payload) = message.payload else {
            return Vec::new();
        };
        trace!(%from, "got ping");

        self.reset_taste_buddy(from, now);

        let pong = Payload::Pong(PongPayload {
            identifier: payload.identifier,
        });
        match self.encode_or_drop(&pong) {
            Some(packet) => vec![Outgoing::to_one(from, MessageKind::Pong, packet)],
            None => Vec::new(),
        }
    }

    /// A pong must match an outstanding ping round *and* come from a
    /// candidate we actually pinged; anything else is dropped.
    pub fn on_pong(&mut self, message: &Message, from: SocketAddr, now: Instant) {
        let Payload::Pong(ref payload) = message.payload else {
            return;
        };

        let Some(request) = self.ping_requests.get_mut(payload.identifier) else {
            debug!(%from, identifier = payload.identifier, "invalid response identifier");
            return;
        };
        if !request.did_request(from) {
            debug!(%from, "did not send ping to this candidate");
            return;
        }

        trace!(%from, "got pong");
        if request.on_success(from) {
            self.ping_requests.pop(payload.identifier);
        }
        self.reset_taste_buddy(from, now);
    }

    // -- introduction steering (4.F) --------------------------------------

    /// Tap on inbound introduction requests: record any `introduce_me_to`
    /// steering, then answer through the default handler with our steered
    /// choice of introduced candidate.
    pub fn on_introduction_request(
        &mut self,
        message: &Message,
        from: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        let Payload::IntroductionRequest(ref payload) = message.payload else {
            return Vec::new();
        };

        if let (Some(introduce_me_to), Some(sender_mid)) =
            (payload.introduce_me_to, message.sender_mid())
        {
            let target = self.get_tb_or_candidate(introduce_me_to, now);
            debug!(
                %from,
                introduce_me_to = %introduce_me_to,
                resolved = target.is_some(),
                "recording requested introduction"
            );
            self.requested_introductions.insert(sender_mid, target);
        }

        self.base.note_introduction_request(message, from, now);

        let exclude = self.base.candidates.get(&from).cloned();
        let introduced = self.get_introduce_candidate(exclude.as_ref(), now);
        match self
            .base
            .respond_to_introduction_request(message, from, introduced)
        {
            Ok(outgoing) => outgoing,
            Err(error) => {
                warn!(%error, "failed to answer introduction request");
                Vec::new()
            }
        }
    }

    /// Completion of one of our own introduction requests.
    pub fn on_introduction_response(
        &mut self,
        message: &Message,
        from: SocketAddr,
        now: Instant,
    ) {
        if let Payload::IntroductionResponse(ref payload) = message.payload {
            self.introduction_attempts.pop(payload.identifier);
        }
        self.base.on_introduction_response(message, from, now);
    }

    /// The introduce-candidate hook: a pending requested introduction for
    /// `exclude`'s member wins over the walker's random choice.
    pub fn get_introduce_candidate(
        &mut self,
        exclude: Option<&WalkCandidate>,
        now: Instant,
    ) -> Option<WalkCandidate> {
        if let Some(mid) = exclude.and_then(|candidate| candidate.mid()) {
            if let Some(target) = self.requested_introductions.remove(&mid) {
                trace!(%mid, "consuming requested introduction");
                return target;
            }
        }

        self.base
            .candidates
            .introduce_candidate(exclude.map(|candidate| candidate.sock_addr), now)
    }

    /// A requested introduction target: the confirmed buddy's candidate if
    /// the member is one of ours, a plain candidate-table lookup otherwise.
    fn get_tb_or_candidate(&mut self, mid: Mid, now: Instant) -> Option<WalkCandidate> {
        if let Some(buddy) = self.is_taste_buddy_mid(mid, now) {
            return Some(buddy.candidate);
        }
        self.base.candidates.get_by_mid(mid).cloned()
    }

    /// Plumbing: punctures and identity traffic go straight to the shared
    /// default handlers.
    pub fn on_puncture_request(&mut self, message: &Message) -> Vec<Outgoing> {
        let (lan, wan) = (self.config.lan_address, self.config.wan_address);
        self.base
            .on_puncture_request(message, lan, wan)
            .unwrap_or_else(|error| {
                warn!(%error, "failed to answer puncture request");
                Vec::new()
            })
    }

    pub fn on_puncture(&mut self, message: &Message, from: SocketAddr, now: Instant) {
        self.base.on_puncture(message, from, now);
    }

    // -- timer-driven state (4.B timeouts) --------------------------------

    /// Collects every expired request-cache entry and runs its timeout
    /// behavior. The runtime calls this at least once per second.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut outgoing = Vec::new();

        // A timed-out similarity attempt falls back to the plain
        // introduction request it deferred.
        for (identifier, attempt) in self.similarity_attempts.take_expired(now) {
            debug!(
                identifier,
                destination = %attempt.destination,
                "similarity attempt timed out, walking anyway"
            );
            outgoing.extend(self.send_introduction_request(attempt.destination, None, now));
        }

        // A timed-out ping round evicts every buddy that stayed silent.
        for (identifier, round) in self.ping_requests.take_expired(now) {
            for sock_addr in &round.requested {
                if !round.received.contains(sock_addr) {
                    debug!(identifier, %sock_addr, "no response on ping, removing taste buddy");
                    self.remove_taste_buddy(*sock_addr, now);
                }
            }
        }

        // Walk retries are the walker's concern, not ours.
        self.introduction_attempts.take_expired(now);

        outgoing
    }

    // -- helpers ----------------------------------------------------------

    /// Encodes through the community base; errors are logged and swallowed,
    /// never propagated across the event-loop turn.
    fn encode_or_drop(&mut self, payload: &Payload) -> Option<Bytes> {
        match self.base.encode(payload) {
            Ok(packet) => Some(packet),
            Err(error) => {
                warn!(%error, kind = ?payload.kind(), "failed to encode outgoing message");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bitfield codec
// ---------------------------------------------------------------------------

/// Compresses which of the first 32 `request_preferences` satisfy
/// `shared`: bit `i` set iff preference `i` is shared.
fn encode_overlap_bitfield(request_preferences: &[Cid], shared: impl Fn(Cid) -> bool) -> u32 {
    request_preferences
        .iter()
        .take(OVERLAP_BITFIELD_BITS)
        .enumerate()
        .filter(|(_, cid)| shared(**cid))
        .fold(0u32, |bits, (index, _)| bits | (1 << index))
}

/// Reconstructs the preference subset a bitfield described, relative to the
/// original request's preference list.
fn decode_overlap_bitfield(request_preferences: &[Cid], bitfield: u32) -> HashSet<Cid> {
    request_preferences
        .iter()
        .take(OVERLAP_BITFIELD_BITS)
        .enumerate()
        .filter(|(index, _)| bitfield & (1 << index) != 0)
        .map(|(_, cid)| *cid)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    struct StubDirectory {
        cids: Vec<Cid>,
        cross_wired: Vec<(Cid, SocketAddr)>,
    }

    impl StubDirectory {
        fn new(cids: Vec<Cid>) -> Self {
            Self {
                cids,
                cross_wired: Vec::new(),
            }
        }
    }

    impl OverlayDirectory for StubDirectory {
        fn walker_cids(&self) -> Vec<Cid> {
            self.cids.clone()
        }

        fn add_discovered_candidate(&mut self, cid: Cid, candidate: Candidate, _now: Instant) {
            self.cross_wired.push((cid, candidate.sock_addr));
        }
    }

    fn cid(tag: u8) -> Cid {
        Cid([tag; 20])
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 3, 0, 1)), port)
    }

    fn community() -> DiscoveryCommunity {
        DiscoveryCommunity::new(
            PrivateMember::generate(),
            CryptoPolicy::Sign,
            DiscoveryConfig::default(),
        )
    }

    fn buddy(overlap: usize, tags: &[u8], port: u16, now: Instant) -> ActualTasteBuddy {
        let mut candidate = WalkCandidate::new(addr(port), false);
        candidate.associate(Mid([port as u8; 20]));
        ActualTasteBuddy::new(
            overlap,
            tags.iter().map(|t| cid(*t)).collect(),
            now,
            Mid([port as u8; 20]),
            candidate,
        )
    }

    #[test]
    fn compute_overlap_is_symmetric_intersection_size() {
        let a: HashSet<Cid> = [cid(1), cid(2), cid(3)].into();
        let b = vec![cid(2), cid(3), cid(4)];
        let b_set: HashSet<Cid> = b.iter().copied().collect();
        let a_list: Vec<Cid> = a.iter().copied().collect();

        assert_eq!(DiscoveryCommunity::compute_overlap(&a, &b), 2);
        assert_eq!(
            DiscoveryCommunity::compute_overlap(&a, &b),
            DiscoveryCommunity::compute_overlap(&b_set, &a_list)
        );
    }

    #[test]
    fn taste_buddies_stay_sorted_by_overlap() {
        let now = Instant::now();
        let mut community = community();
        let mut directory = StubDirectory::new(vec![cid(1), cid(2), cid(3)]);

        community.add_taste_buddies(vec![buddy(1, &[1], 1, now)], &mut directory, now);
        community.add_taste_buddies(vec![buddy(3, &[1, 2, 3], 2, now)], &mut directory, now);
        community.add_taste_buddies(vec![buddy(2, &[1, 2], 3, now)], &mut directory, now);

        let overlaps: Vec<usize> = community.taste_buddies.iter().map(|b| b.overlap).collect();
        assert_eq!(overlaps, vec![3, 2, 1]);
    }

    #[test]
    fn same_endpoint_merges_instead_of_duplicating() {
        let now = Instant::now();
        let mut community = community();
        let mut directory = StubDirectory::new(vec![cid(1), cid(2)]);

        community.add_taste_buddies(vec![buddy(1, &[1], 5, now)], &mut directory, now);
        community.add_taste_buddies(vec![buddy(1, &[2], 5, now)], &mut directory, now);

        assert_eq!(community.taste_buddy_count(), 1);
        // Union of preferences, overlap recomputed against our overlays.
        assert_eq!(community.taste_buddies[0].overlap, 2);
    }

    #[test]
    fn cross_wiring_hands_candidates_to_shared_overlays() {
        let now = Instant::now();
        let mut community = community();
        let mut directory = StubDirectory::new(vec![cid(1), cid(9)]);

        community.add_taste_buddies(vec![buddy(1, &[1, 4], 6, now)], &mut directory, now);

        // Only the shared overlay sees the candidate; cid(4) is not ours.
        assert_eq!(directory.cross_wired, vec![(cid(1), addr(6))]);
    }

    #[test]
    fn yield_prunes_stale_and_skips_zero_overlap() {
        let now = Instant::now();
        let mut community = community();
        let mut directory = StubDirectory::new(vec![cid(1)]);

        community.add_taste_buddies(
            vec![buddy(1, &[1], 1, now), buddy(0, &[9], 2, now)],
            &mut directory,
            now,
        );

        let later = now + crate::config::PING_TIMEOUT + std::time::Duration::from_secs(1);
        assert!(community.yield_taste_buddies(later, None).is_empty());
        assert_eq!(community.taste_buddy_count(), 0);

        community.add_taste_buddies(
            vec![buddy(1, &[1], 1, later), buddy(0, &[9], 2, later)],
            &mut directory,
            later,
        );
        let yielded = community.yield_taste_buddies(later, None);
        assert_eq!(yielded.len(), 1);
        assert_eq!(yielded[0].overlap, 1);
    }

    #[test]
    fn confirmed_member_is_dropped_from_possibles() {
        let now = Instant::now();
        let mut community = community();
        let mut directory = StubDirectory::new(vec![cid(1)]);

        let relay = WalkCandidate::new(addr(40), false);
        community.add_possible_taste_buddies(
            vec![PossibleTasteBuddy::new(
                1,
                [cid(1)].into(),
                now,
                Mid([8; 20]),
                relay,
            )],
            &directory,
            now,
        );
        assert_eq!(community.possible_taste_buddy_count(), 1);

        // The member gets confirmed: the possible entry must go.
        community.add_taste_buddies(vec![buddy(1, &[1], 8, now)], &mut directory, now);
        assert_eq!(community.possible_taste_buddy_count(), 0);
    }

    #[test]
    fn own_member_is_never_a_possible_buddy() {
        let now = Instant::now();
        let mut community = community();
        let directory = StubDirectory::new(vec![cid(1)]);

        let my_mid = community.base().my_mid();
        let relay = WalkCandidate::new(addr(41), false);
        community.add_possible_taste_buddies(
            vec![PossibleTasteBuddy::new(
                1,
                [cid(1)].into(),
                now,
                my_mid,
                relay,
            )],
            &directory,
            now,
        );
        assert_eq!(community.possible_taste_buddy_count(), 0);
    }

    #[test]
    fn get_most_similar_pops_the_best_possible() {
        let now = Instant::now();
        let mut community = community();
        let directory = StubDirectory::new(vec![cid(1), cid(2)]);

        let relay_low = WalkCandidate::new(addr(50), false);
        let relay_high = WalkCandidate::new(addr(51), false);
        community.add_possible_taste_buddies(
            vec![
                PossibleTasteBuddy::new(1, [cid(1)].into(), now, Mid([1; 20]), relay_low),
                PossibleTasteBuddy::new(2, [cid(1), cid(2)].into(), now, Mid([2; 20]), relay_high),
            ],
            &directory,
            now,
        );

        let (destination, mid) = community.get_most_similar(addr(99), now);
        assert_eq!(destination, addr(51));
        assert_eq!(mid, Some(Mid([2; 20])));
        assert_eq!(community.possible_taste_buddy_count(), 1);

        // Exhausted: falls back to the given candidate.
        let (destination, mid) = community.get_most_similar(addr(99), now);
        assert_eq!(destination, addr(50));
        assert!(mid.is_some());
        let (destination, mid) = community.get_most_similar(addr(99), now);
        assert_eq!(destination, addr(99));
        assert_eq!(mid, None);
    }

    #[test]
    fn no_preferences_means_no_similarity_traffic() {
        let now = Instant::now();
        let mut community = community();
        let mut directory = StubDirectory::new(vec![]);

        let destination = WalkCandidate::new(addr(60), false);
        assert!(community
            .create_similarity_request(&destination, &directory, now)
            .is_none());

        // The walk proceeds with a plain introduction request instead.
        let outgoing = community.create_introduction_request(&destination, &mut directory, now);
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].kind, MessageKind::IntroductionRequest);
        assert!(community.similarity_attempts.is_empty());
    }

    #[test]
    fn max_prefs_zero_means_no_similarity_traffic() {
        let now = Instant::now();
        let mut community = DiscoveryCommunity::new(
            PrivateMember::generate(),
            CryptoPolicy::Sign,
            DiscoveryConfig {
                max_prefs: 0,
                ..DiscoveryConfig::default()
            },
        );
        let directory = StubDirectory::new(vec![cid(1)]);

        let destination = WalkCandidate::new(addr(61), false);
        assert!(community
            .create_similarity_request(&destination, &directory, now)
            .is_none());
    }

    #[test]
    fn bootstrap_seeds_are_not_probed_for_similarity() {
        let now = Instant::now();
        let mut community = community();
        let mut directory = StubDirectory::new(vec![cid(1)]);

        community.add_bootstrap_candidates(&[addr(70)], now);
        let destination = WalkCandidate::new(addr(70), false);
        let outgoing = community.create_introduction_request(&destination, &mut directory, now);

        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].kind, MessageKind::IntroductionRequest);
    }

    #[test]
    fn similarity_timeout_falls_back_to_plain_introduction() {
        let now = Instant::now();
        let mut community = community();
        let mut directory = StubDirectory::new(vec![cid(1)]);

        let destination = WalkCandidate::new(addr(80), false);
        let outgoing = community.create_introduction_request(&destination, &mut directory, now);
        assert_eq!(outgoing[0].kind, MessageKind::SimilarityRequest);

        let fired = community.poll_timeouts(now + REQUEST_TIMEOUT);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, MessageKind::IntroductionRequest);
        assert_eq!(fired[0].targets, vec![addr(80)]);

        // At-most-once: the timeout cannot fire twice.
        assert!(community
            .poll_timeouts(now + REQUEST_TIMEOUT * 2)
            .is_empty());
    }

    #[test]
    fn bitfield_caps_at_32_preferences() {
        let prefs: Vec<Cid> = (0..40u8).map(cid).collect();

        // Everything shared: only the first 32 bits can ever be set.
        let bits = encode_overlap_bitfield(&prefs, |_| true);
        assert_eq!(bits, u32::MAX);

        let decoded = decode_overlap_bitfield(&prefs, bits);
        assert_eq!(decoded.len(), 32);
        assert!(decoded.contains(&cid(31)));
        assert!(!decoded.contains(&cid(32)));
    }

    #[test]
    fn bitfield_round_trip_reflects_shared_prefix() {
        let request: Vec<Cid> = vec![cid(1), cid(2), cid(3)];
        let buddy_prefs: HashSet<Cid> = [cid(2), cid(3), cid(9)].into();

        let bits = encode_overlap_bitfield(&request, |c| buddy_prefs.contains(&c));
        assert_eq!(bits, 0b110);

        let decoded = decode_overlap_bitfield(&request, bits);
        assert_eq!(decoded, [cid(2), cid(3)].into());
    }

    #[test]
    fn requested_introduction_is_consumed_once() {
        let now = Instant::now();
        let mut community = community();
        let mut directory = StubDirectory::new(vec![cid(1)]);

        // X is a confirmed buddy with a known candidate.
        community.add_taste_buddies(vec![buddy(1, &[1], 30, now)], &mut directory, now);
        let x_mid = Mid([30; 20]);

        let asker_mid = Mid([77; 20]);
        let candidate = community.get_tb_or_candidate(x_mid, now);
        community
            .requested_introductions
            .insert(asker_mid, candidate);

        let mut asker = WalkCandidate::new(addr(77), false);
        asker.associate(asker_mid);

        let introduced = community.get_introduce_candidate(Some(&asker), now).unwrap();
        assert_eq!(introduced.sock_addr, addr(30));

        // Second read falls through to the default (empty) pool.
        assert!(community.get_introduce_candidate(Some(&asker), now).is_none());
    }

    #[test]
    fn ping_task_is_scheduled_with_the_first_buddy() {
        let now = Instant::now();
        let mut community = community();
        let mut directory = StubDirectory::new(vec![cid(1)]);

        assert!(!community.ping_task_scheduled());
        community.add_taste_buddies(vec![buddy(1, &[1], 1, now)], &mut directory, now);
        assert!(community.ping_task_scheduled());
    }

    #[test]
    fn ping_round_targets_only_soon_stale_buddies() {
        let start = Instant::now();
        let now = start + crate::config::PING_TIMEOUT;
        let mut community = community();
        let mut directory = StubDirectory::new(vec![cid(1)]);

        // One buddy about to go stale, one fresh.
        community.add_taste_buddies(
            vec![
                buddy(1, &[1], 2, start + std::time::Duration::from_millis(100)),
                buddy(1, &[1], 1, now),
            ],
            &mut directory,
            now,
        );

        let outgoing = community.create_ping_requests(now);
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].kind, MessageKind::Ping);
        assert_eq!(outgoing[0].targets, vec![addr(2)]);
    }

    #[test]
    fn silent_ping_round_evicts_the_silent_buddy_only() {
        let start = Instant::now();
        let now = start + crate::config::PING_TIMEOUT;
        let mut community = community();
        let mut directory = StubDirectory::new(vec![cid(1)]);

        community.add_taste_buddies(
            vec![
                buddy(1, &[1], 2, start + std::time::Duration::from_millis(100)),
                buddy(1, &[1], 3, start + std::time::Duration::from_millis(100)),
            ],
            &mut directory,
            now,
        );

        let outgoing = community.create_ping_requests(now);
        assert_eq!(outgoing[0].targets.len(), 2);
        let packet = &outgoing[0].packet;
        let message = community.base().decode(packet).unwrap();

        // Only addr(3) answers in time.
        community.on_pong(&message, addr(3), now);

        community.poll_timeouts(now + REQUEST_TIMEOUT);
        assert!(community
            .taste_buddies
            .iter()
            .all(|buddy| buddy.sock_addr() != addr(2)));
        assert!(community
            .taste_buddies
            .iter()
            .any(|buddy| buddy.sock_addr() == addr(3)));
    }
}
