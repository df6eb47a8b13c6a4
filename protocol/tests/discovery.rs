//! End-to-end discovery scenarios.
//!
//! These tests drive two or three `DiscoveryCommunity` instances against
//! each other by feeding each engine's outgoing packets into the other
//! side's handlers — the full wire path, minus the socket. Each test owns
//! its peers and its clock; nothing here sleeps.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use kindred_protocol::candidate::{Candidate, WalkCandidate};
use kindred_protocol::community::Outgoing;
use kindred_protocol::config::{PING_TIMEOUT, REQUEST_TIMEOUT};
use kindred_protocol::discovery::{
    ActualTasteBuddy, DiscoveryCommunity, DiscoveryConfig, OverlayDirectory,
};
use kindred_protocol::identity::{Cid, CryptoPolicy, Mid, PrivateMember};
use kindred_protocol::wire::{Message, MessageKind, Payload};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// A fixed set of walker-enabled overlays, plus a record of cross-wired
/// candidates.
struct Directory {
    cids: Vec<Cid>,
    cross_wired: Vec<(Cid, SocketAddr)>,
}

impl Directory {
    fn new(tags: &[u8]) -> Self {
        Self {
            cids: tags.iter().map(|t| cid(*t)).collect(),
            cross_wired: Vec::new(),
        }
    }
}

impl OverlayDirectory for Directory {
    fn walker_cids(&self) -> Vec<Cid> {
        self.cids.clone()
    }

    fn add_discovered_candidate(&mut self, cid: Cid, candidate: Candidate, _now: Instant) {
        self.cross_wired.push((cid, candidate.sock_addr));
    }
}

/// One peer under test: engine, directory, and its address.
struct Peer {
    community: DiscoveryCommunity,
    directory: Directory,
    addr: SocketAddr,
}

impl Peer {
    fn new(port: u16, preference_tags: &[u8]) -> Self {
        let addr = addr(port);
        Self {
            community: DiscoveryCommunity::new(
                PrivateMember::generate(),
                CryptoPolicy::Sign,
                DiscoveryConfig {
                    lan_address: addr,
                    wan_address: addr,
                    ..DiscoveryConfig::default()
                },
            ),
            directory: Directory::new(preference_tags),
            addr,
        }
    }

    fn mid(&self) -> Mid {
        self.community.base().my_mid()
    }

    fn decode(&self, outgoing: &Outgoing) -> Message {
        self.community
            .base()
            .decode(&outgoing.packet)
            .expect("peer packets decode on the shared conversion")
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 20, 0, 1)), port)
}

fn cid(tag: u8) -> Cid {
    Cid([tag; 20])
}

/// Seeds `peer` with a confirmed buddy at `port` holding `preference_tags`.
fn seed_buddy(peer: &mut Peer, port: u16, preference_tags: &[u8], now: Instant) -> Mid {
    let mid = Mid([port as u8; 20]);
    let mut candidate = WalkCandidate::new(addr(port), false);
    candidate.associate(mid);
    let preferences: HashSet<Cid> = preference_tags.iter().map(|t| cid(*t)).collect();
    let overlap = preferences.len();
    peer.community.add_taste_buddies(
        vec![ActualTasteBuddy::new(overlap, preferences, now, mid, candidate)],
        &mut peer.directory,
        now,
    );
    mid
}

// ---------------------------------------------------------------------------
// 1. Similarity handshake leads to a deferred introduction (S1)
// ---------------------------------------------------------------------------

#[test]
fn similarity_exchange_confirms_buddies_and_defers_the_introduction() {
    let now = Instant::now();
    let mut a = Peer::new(1, &[1, 2, 3]);
    let mut b = Peer::new(2, &[2, 3, 4]);

    // A is about to walk to B: the introduction is intercepted and a
    // similarity request goes out instead.
    let destination = WalkCandidate::new(b.addr, false);
    let from_a = a
        .community
        .create_introduction_request(&destination, &mut a.directory, now);
    assert_eq!(from_a.len(), 1);
    assert_eq!(from_a[0].kind, MessageKind::SimilarityRequest);
    assert_eq!(from_a[0].targets, vec![b.addr]);

    // B handles the request: A becomes a confirmed buddy with overlap 2.
    let request = b.decode(&from_a[0]);
    let from_b = b
        .community
        .on_similarity_request(&request, a.addr, &mut b.directory, now);
    let buddy_of_b = b.community.is_taste_buddy_mid(a.mid(), now).unwrap();
    assert_eq!(buddy_of_b.overlap, 2);

    assert_eq!(from_b.len(), 1);
    assert_eq!(from_b[0].kind, MessageKind::SimilarityResponse);

    // A handles the response: B becomes a confirmed buddy with overlap 2,
    // and the deferred introduction request finally goes to B.
    let response = a.decode(&from_b[0]);
    let deferred = a
        .community
        .on_similarity_response(&response, b.addr, &mut a.directory, now);
    let buddy_of_a = a.community.is_taste_buddy_mid(b.mid(), now).unwrap();
    assert_eq!(buddy_of_a.overlap, 2);

    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].kind, MessageKind::IntroductionRequest);
    assert_eq!(deferred[0].targets, vec![b.addr]);
    let Payload::IntroductionRequest(ref payload) = a.decode(&deferred[0]).payload else {
        panic!("expected an introduction request");
    };
    assert_eq!(payload.introduce_me_to, None);

    // Walking B again skips similarity: B is a buddy now.
    let again = a
        .community
        .create_introduction_request(&destination, &mut a.directory, now);
    assert_eq!(again[0].kind, MessageKind::IntroductionRequest);

    // The similarity byte counters saw one request out and one reply in.
    assert_eq!(a.community.send_packet_size, from_a[0].packet.len());
    assert_eq!(a.community.reply_packet_size, from_b[0].packet.len());
}

// ---------------------------------------------------------------------------
// 2. Possible-buddy promotion steers the walk (S2)
// ---------------------------------------------------------------------------

#[test]
fn advertised_buddy_steers_the_deferred_introduction() {
    let now = Instant::now();
    let mut a = Peer::new(1, &[1, 2, 3]);
    let mut b = Peer::new(2, &[2, 3, 4]);

    // B already knows X, who shares c2 and c3 with B.
    let x_mid = seed_buddy(&mut b, 30, &[2, 3], now);

    // A walks B through the similarity exchange.
    let destination = WalkCandidate::new(b.addr, false);
    let from_a = a
        .community
        .create_introduction_request(&destination, &mut a.directory, now);
    let request = b.decode(&from_a[0]);
    let from_b = b
        .community
        .on_similarity_request(&request, a.addr, &mut b.directory, now);

    // B's response advertises X with a bitfield against A's request
    // [c1, c2, c3]: c2 and c3 shared.
    let response = a.decode(&from_b[0]);
    let Payload::SimilarityResponse(ref payload) = response.payload else {
        panic!("expected a similarity response");
    };
    assert_eq!(payload.tb_overlap.len(), 1);
    assert_eq!(payload.tb_overlap[0].mid, x_mid);
    assert_eq!(payload.tb_overlap[0].bitfield, 0b110);

    // A reconstructs PTB(X) and steers the deferred introduction through
    // B, asking to meet X.
    let deferred = a
        .community
        .on_similarity_response(&response, b.addr, &mut a.directory, now);
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].targets, vec![b.addr]);
    let Payload::IntroductionRequest(ref payload) = a.decode(&deferred[0]).payload else {
        panic!("expected an introduction request");
    };
    assert_eq!(payload.introduce_me_to, Some(x_mid));

    // The PTB was consumed by the steering step.
    assert_eq!(a.community.possible_taste_buddy_count(), 0);

    // B honors the request: the response introduces X's endpoint and a
    // puncture request goes to X.
    let intro = b.decode(&deferred[0]);
    let reply = b.community.on_introduction_request(&intro, a.addr, now);
    assert_eq!(reply.len(), 2);
    assert_eq!(reply[0].kind, MessageKind::IntroductionResponse);
    assert_eq!(reply[0].targets, vec![a.addr]);
    let Payload::IntroductionResponse(ref payload) = b.decode(&reply[0]).payload else {
        panic!("expected an introduction response");
    };
    assert_eq!(payload.wan_introduction_address, Some(addr(30)));
    assert_eq!(reply[1].kind, MessageKind::PunctureRequest);
    assert_eq!(reply[1].targets, vec![addr(30)]);
}

// ---------------------------------------------------------------------------
// 3. Ping keeps buddies alive; silence evicts them (S3)
// ---------------------------------------------------------------------------

#[test]
fn unanswered_ping_evicts_the_buddy() {
    let start = Instant::now();
    let mut a = Peer::new(1, &[1]);

    // B was confirmed almost a full timeout ago.
    let b_mid = seed_buddy(&mut a, 2, &[1], start);
    let now = start + PING_TIMEOUT - Duration::from_millis(100);

    // The next ping tick targets B.
    let pings = a.community.create_ping_requests(now);
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].kind, MessageKind::Ping);
    assert_eq!(pings[0].targets, vec![addr(2)]);

    // B never answers: the ping round times out and B is gone.
    a.community.poll_timeouts(now + REQUEST_TIMEOUT);
    assert!(a.community.is_taste_buddy_mid(b_mid, now).is_none());
}

#[test]
fn answered_ping_refreshes_the_buddy() {
    let start = Instant::now();
    let mut a = Peer::new(1, &[1]);
    let mut b = Peer::new(2, &[1]);

    seed_buddy(&mut a, 2, &[1], start);
    let b_mid = Mid([2; 20]);
    let now = start + PING_TIMEOUT - Duration::from_millis(100);

    let pings = a.community.create_ping_requests(now);
    let ping = b.decode(&pings[0]);

    // B answers; the pong refreshes A's registry entry.
    let pongs = b.community.on_ping(&ping, a.addr, now);
    assert_eq!(pongs[0].kind, MessageKind::Pong);
    let pong = a.decode(&pongs[0]);
    a.community.on_pong(&pong, addr(2), now);

    // The round completed: its timeout must evict nobody.
    a.community.poll_timeouts(now + REQUEST_TIMEOUT);
    let buddy = a.community.is_taste_buddy_mid(b_mid, now).unwrap();
    assert_eq!(buddy.time_remaining(now), PING_TIMEOUT);
}

#[test]
fn pong_from_wrong_sender_is_ignored() {
    let start = Instant::now();
    let mut a = Peer::new(1, &[1]);
    let mut intruder = Peer::new(9, &[1]);

    seed_buddy(&mut a, 2, &[1], start);
    let now = start + PING_TIMEOUT - Duration::from_millis(100);

    let pings = a.community.create_ping_requests(now);
    let ping = intruder.decode(&pings[0]);

    // The intruder echoes a pong with the right identifier but from the
    // wrong endpoint; the round must still time out and evict B.
    let pongs = intruder.community.on_ping(&ping, a.addr, now);
    let pong = a.decode(&pongs[0]);
    a.community.on_pong(&pong, intruder.addr, now);

    a.community.poll_timeouts(now + REQUEST_TIMEOUT);
    assert!(a.community.is_taste_buddy_mid(Mid([2; 20]), now).is_none());
}

// ---------------------------------------------------------------------------
// 4. Registry invariants hold across a busy exchange
// ---------------------------------------------------------------------------

#[test]
fn registry_invariants_hold_after_mixed_traffic() {
    let now = Instant::now();
    let mut a = Peer::new(1, &[1, 2, 3, 4]);
    let mut b = Peer::new(2, &[2, 3]);

    for port in 10u16..16 {
        seed_buddy(&mut b, port, &[2, 3], now);
    }

    // Full similarity exchange to populate both sides.
    let destination = WalkCandidate::new(b.addr, false);
    let from_a = a
        .community
        .create_introduction_request(&destination, &mut a.directory, now);
    let request = b.decode(&from_a[0]);
    let from_b = b
        .community
        .on_similarity_request(&request, a.addr, &mut b.directory, now);
    let response = a.decode(&from_b[0]);
    a.community
        .on_similarity_response(&response, b.addr, &mut a.directory, now);

    for peer in [&a, &b] {
        // Sorted descending by overlap.
        let overlaps: Vec<usize> = peer
            .community
            .taste_buddies()
            .iter()
            .map(|buddy| buddy.overlap)
            .collect();
        let mut sorted = overlaps.clone();
        sorted.sort_by(|x, y| y.cmp(x));
        assert_eq!(overlaps, sorted);

        let possible_overlaps: Vec<usize> = peer
            .community
            .possible_taste_buddies()
            .iter()
            .map(|possible| possible.overlap)
            .collect();
        let mut sorted = possible_overlaps.clone();
        sorted.sort_by(|x, y| y.cmp(x));
        assert_eq!(possible_overlaps, sorted);

        // No MID in both registries, and no MID twice among buddies.
        let buddy_mids: Vec<Mid> = peer
            .community
            .taste_buddies()
            .iter()
            .map(|buddy| buddy.mid)
            .collect();
        let unique: HashSet<Mid> = buddy_mids.iter().copied().collect();
        assert_eq!(unique.len(), buddy_mids.len());
        for possible in peer.community.possible_taste_buddies() {
            assert!(!unique.contains(&possible.mid));
        }

        // Every retained buddy is non-stale.
        for buddy in peer.community.taste_buddies() {
            assert!(buddy.time_remaining(now) > Duration::ZERO);
        }
    }
}

// ---------------------------------------------------------------------------
// 5. Long preference lists cap at the bitfield width
// ---------------------------------------------------------------------------

#[test]
fn responses_to_long_requests_stay_within_32_bits() {
    let now = Instant::now();
    // 25 preferences transmitted (max_prefs), all shared with B's buddy.
    let tags: Vec<u8> = (1..=40).collect();
    let mut a = Peer::new(1, &tags);
    let mut b = Peer::new(2, &tags);

    seed_buddy(&mut b, 30, &tags, now);

    let destination = WalkCandidate::new(b.addr, false);
    let from_a = a
        .community
        .create_introduction_request(&destination, &mut a.directory, now);
    let request = b.decode(&from_a[0]);
    let Payload::SimilarityRequest(ref request_payload) = request.payload else {
        panic!("expected a similarity request");
    };
    assert_eq!(request_payload.preference_list.len(), 25);

    let from_b = b
        .community
        .on_similarity_request(&request, a.addr, &mut b.directory, now);
    let response = a.decode(&from_b[0]);
    let Payload::SimilarityResponse(ref payload) = response.payload else {
        panic!("expected a similarity response");
    };

    // All 25 transmitted preferences are shared; bits 25..32 stay clear.
    assert_eq!(payload.tb_overlap[0].bitfield, (1u32 << 25) - 1);

    let deferred = a
        .community
        .on_similarity_response(&response, b.addr, &mut a.directory, now);
    assert_eq!(deferred.len(), 1);
}
