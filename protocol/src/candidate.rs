//! # Candidates
//!
//! Addresses we can walk to, and what we know about them.
//!
//! A [`Candidate`] is a bare UDP endpoint. A [`WalkCandidate`] is an endpoint
//! we have exchanged traffic with: it carries the peer's self-declared LAN
//! and WAN addresses, its NAT situation, and timestamps for the three ways
//! we can have met it (we walked to it, it stumbled onto us, or a third
//! party introduced it). Only walked or stumbled candidates are *verified*;
//! introductions are hearsay until a round-trip confirms them.
//!
//! The [`CandidateRegistry`] owns all candidate state for one overlay.
//! Protocol engines hold socket addresses and cloned snapshots, never
//! references into the table.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::CANDIDATE_WALK_LIFETIME;
use crate::identity::Mid;

// ---------------------------------------------------------------------------
// Connection Type
// ---------------------------------------------------------------------------

/// The NAT situation a peer declares for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionType {
    /// Reachable directly on its WAN address.
    Public,
    /// Behind a symmetric NAT; puncturing required per destination.
    SymmetricNat,
    /// The peer has not (yet) determined its situation.
    #[default]
    Unknown,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionType::Public => "public",
            ConnectionType::SymmetricNat => "symmetric-NAT",
            ConnectionType::Unknown => "unknown",
        })
    }
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// A bare endpoint: everything we know about a peer before meeting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub sock_addr: SocketAddr,
    pub tunnel: bool,
}

impl Candidate {
    pub fn new(sock_addr: SocketAddr, tunnel: bool) -> Self {
        Self { sock_addr, tunnel }
    }

    /// The synthetic sender used when replaying the destroy-evidence log:
    /// packets fed back into the incoming path did not arrive from the
    /// network at all.
    pub fn loopback() -> Self {
        Self {
            sock_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            tunnel: false,
        }
    }
}

impl fmt::Display for Candidate {
    // Candidates render as their socket address, the form used by the
    // evidence-log header and telemetry lines.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sock_addr)
    }
}

// ---------------------------------------------------------------------------
// WalkCandidate
// ---------------------------------------------------------------------------

/// An endpoint we have exchanged traffic with.
#[derive(Debug, Clone)]
pub struct WalkCandidate {
    pub sock_addr: SocketAddr,
    pub lan_address: SocketAddr,
    pub wan_address: SocketAddr,
    pub tunnel: bool,
    pub connection_type: ConnectionType,
    /// MID of the member last seen authenticating from this endpoint.
    associated_mid: Option<Mid>,
    last_walk: Option<Instant>,
    last_stumble: Option<Instant>,
    last_intro: Option<Instant>,
}

impl WalkCandidate {
    pub fn new(sock_addr: SocketAddr, tunnel: bool) -> Self {
        Self {
            sock_addr,
            lan_address: sock_addr,
            wan_address: sock_addr,
            tunnel,
            connection_type: ConnectionType::Unknown,
            associated_mid: None,
            last_walk: None,
            last_stumble: None,
            last_intro: None,
        }
    }

    /// The member MID associated with this endpoint, if any message has
    /// authenticated it yet.
    pub fn mid(&self) -> Option<Mid> {
        self.associated_mid
    }

    pub fn associate(&mut self, mid: Mid) {
        self.associated_mid = Some(mid);
    }

    /// We completed a walk to this candidate.
    pub fn walked(&mut self, now: Instant) {
        self.last_walk = Some(now);
    }

    /// The candidate walked onto us.
    pub fn stumbled(&mut self, now: Instant) {
        self.last_stumble = Some(now);
    }

    /// A third party introduced this candidate to us.
    pub fn introduced(&mut self, now: Instant) {
        self.last_intro = Some(now);
    }

    fn within_lifetime(stamp: Option<Instant>, now: Instant) -> bool {
        stamp.is_some_and(|at| now.duration_since(at) < CANDIDATE_WALK_LIFETIME)
    }

    pub fn is_walked(&self, now: Instant) -> bool {
        Self::within_lifetime(self.last_walk, now)
    }

    pub fn is_stumbled(&self, now: Instant) -> bool {
        Self::within_lifetime(self.last_stumble, now)
    }

    /// Verified means a recent round-trip proved the endpoint real: we
    /// walked to it, or it walked to us.
    pub fn is_verified(&self, now: Instant) -> bool {
        self.is_walked(now) || self.is_stumbled(now)
    }

    /// True while any timestamp is recent enough to keep the entry around.
    fn is_alive(&self, now: Instant) -> bool {
        self.is_verified(now) || Self::within_lifetime(self.last_intro, now)
    }
}

impl fmt::Display for WalkCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sock_addr)
    }
}

// ---------------------------------------------------------------------------
// CandidateRegistry
// ---------------------------------------------------------------------------

/// The candidate table of one overlay.
#[derive(Debug, Default)]
pub struct CandidateRegistry {
    candidates: HashMap<SocketAddr, WalkCandidate>,
}

impl CandidateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or refreshes the walk candidate for `sock_addr` with the
    /// peer's self-declared addressing information.
    #[allow(clippy::too_many_arguments)]
    pub fn create_or_update(
        &mut self,
        sock_addr: SocketAddr,
        lan_address: SocketAddr,
        wan_address: SocketAddr,
        tunnel: bool,
        connection_type: ConnectionType,
    ) -> &mut WalkCandidate {
        let candidate = self
            .candidates
            .entry(sock_addr)
            .or_insert_with(|| WalkCandidate::new(sock_addr, tunnel));
        candidate.lan_address = lan_address;
        candidate.wan_address = wan_address;
        candidate.tunnel = tunnel;
        candidate.connection_type = connection_type;
        candidate
    }

    /// Records a candidate learned out-of-band (bootstrap seed, taste-buddy
    /// cross-wiring, introduction). Not verified until it round-trips.
    pub fn add_discovered(&mut self, candidate: Candidate, now: Instant) -> &mut WalkCandidate {
        let entry = self
            .candidates
            .entry(candidate.sock_addr)
            .or_insert_with(|| WalkCandidate::new(candidate.sock_addr, candidate.tunnel));
        entry.introduced(now);
        entry
    }

    pub fn get(&self, sock_addr: &SocketAddr) -> Option<&WalkCandidate> {
        self.candidates.get(sock_addr)
    }

    pub fn get_mut(&mut self, sock_addr: &SocketAddr) -> Option<&mut WalkCandidate> {
        self.candidates.get_mut(sock_addr)
    }

    /// Looks a candidate up by the member MID last seen on its endpoint.
    pub fn get_by_mid(&self, mid: Mid) -> Option<&WalkCandidate> {
        self.candidates.values().find(|c| c.mid() == Some(mid))
    }

    /// All currently verified candidates.
    pub fn verified(&self, now: Instant) -> impl Iterator<Item = &WalkCandidate> {
        self.candidates.values().filter(move |c| c.is_verified(now))
    }

    pub fn verified_count(&self, now: Instant) -> usize {
        self.verified(now).count()
    }

    /// Picks a uniformly random verified candidate to introduce, excluding
    /// the asking endpoint. Returns a snapshot.
    pub fn introduce_candidate(
        &self,
        exclude: Option<SocketAddr>,
        now: Instant,
    ) -> Option<WalkCandidate> {
        self.verified(now)
            .filter(|c| Some(c.sock_addr) != exclude)
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Drops entries whose every timestamp has aged out.
    pub fn cleanup(&mut self, now: Instant) {
        self.candidates.retain(|sock_addr, candidate| {
            let keep = candidate.is_alive(now);
            if !keep {
                trace!(%sock_addr, "evicting expired candidate");
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
