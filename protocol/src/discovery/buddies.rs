//! Taste buddies: peers ranked by how many overlay memberships they share
//! with us.
//!
//! A buddy is *actual* once we have exchanged similarity traffic with it
//! directly, and *possible* while we only know of it through a third
//! party's similarity response. The two kinds deliberately do not share a
//! trait: matching and promotion differ in exactly the places a common
//! abstraction would have to paper over. What they do share is the
//! preference-union overlap update.
//!
//! Identity is looked up through explicit `matches_*` methods rather than
//! one overloaded equality: "same endpoint" and "same member" are different
//! questions with different answers.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use crate::candidate::{ConnectionType, WalkCandidate};
use crate::config::PING_TIMEOUT;
use crate::identity::{Cid, Mid};

/// Remaining freshness of a timestamp under the ping-timeout window.
fn time_remaining(timestamp: Instant, now: Instant) -> Duration {
    PING_TIMEOUT.saturating_sub(now.saturating_duration_since(timestamp))
}

// ---------------------------------------------------------------------------
// ActualTasteBuddy
// ---------------------------------------------------------------------------

/// A confirmed taste buddy: we have measured the overlap ourselves.
#[derive(Debug, Clone)]
pub struct ActualTasteBuddy {
    /// Cardinality of the preference intersection with our own overlays.
    pub overlap: usize,
    /// Everything we know this peer participates in. Grows by union on
    /// every merge; the overlap is recomputed from it.
    pub preferences: HashSet<Cid>,
    /// Last time any message refreshed this buddy.
    pub timestamp: Instant,
    /// The buddy's member identifier.
    pub mid: Mid,
    /// Snapshot of the buddy's walk candidate at last contact.
    pub candidate: WalkCandidate,
}

impl ActualTasteBuddy {
    pub fn new(
        overlap: usize,
        preferences: HashSet<Cid>,
        timestamp: Instant,
        mid: Mid,
        candidate: WalkCandidate,
    ) -> Self {
        Self {
            overlap,
            preferences,
            timestamp,
            mid,
            candidate,
        }
    }

    pub fn sock_addr(&self) -> std::net::SocketAddr {
        self.candidate.sock_addr
    }

    /// Merges another sighting of the same peer: preferences are unioned
    /// and the overlap recomputed by `compute`.
    pub fn update_overlap(
        &mut self,
        other: &ActualTasteBuddy,
        compute: impl FnOnce(&HashSet<Cid>) -> usize,
    ) {
        self.preferences.extend(other.preferences.iter().copied());
        self.overlap = compute(&self.preferences);
    }

    pub fn does_overlap(&self, preference: Cid) -> bool {
        self.preferences.contains(&preference)
    }

    /// How much longer this buddy stays fresh without being refreshed.
    pub fn time_remaining(&self, now: Instant) -> Duration {
        time_remaining(self.timestamp, now)
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.time_remaining(now) == Duration::ZERO
    }

    /// Only buddies on publicly reachable endpoints are worth caching
    /// across sessions.
    pub fn should_cache(&self) -> bool {
        self.candidate.connection_type == ConnectionType::Public
    }

    // -- identity ---------------------------------------------------------

    /// Same peer endpoint?
    pub fn matches_sock_addr(&self, sock_addr: std::net::SocketAddr) -> bool {
        self.sock_addr() == sock_addr
    }

    /// Same member?
    pub fn matches_mid(&self, mid: Mid) -> bool {
        self.mid == mid
    }

    /// Same peer as `candidate`? Compared by member when the candidate has
    /// an associated MID, by endpoint otherwise.
    pub fn matches_candidate(&self, candidate: &WalkCandidate) -> bool {
        match candidate.mid() {
            Some(mid) => self.mid == mid,
            None => self.sock_addr() == candidate.sock_addr,
        }
    }
}

impl fmt::Display for ActualTasteBuddy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ATB_{}_{}_{}", self.overlap, self.mid, self.candidate)
    }
}

// ---------------------------------------------------------------------------
// PossibleTasteBuddy
// ---------------------------------------------------------------------------

/// A taste buddy we have not contacted: advertised in somebody else's
/// similarity response.
#[derive(Debug, Clone)]
pub struct PossibleTasteBuddy {
    /// Overlap as reconstructed from the advertised bitfield.
    pub overlap: usize,
    pub preferences: HashSet<Cid>,
    pub timestamp: Instant,
    /// The advertised member. This is the buddy's identity: two
    /// advertisements with the same MID describe the same peer, whoever
    /// relayed them.
    pub mid: Mid,
    /// The peer that advertised this buddy; introduction requests are
    /// routed through it.
    pub received_from: WalkCandidate,
}

impl PossibleTasteBuddy {
    pub fn new(
        overlap: usize,
        preferences: HashSet<Cid>,
        timestamp: Instant,
        mid: Mid,
        received_from: WalkCandidate,
    ) -> Self {
        Self {
            overlap,
            preferences,
            timestamp,
            mid,
            received_from,
        }
    }

    /// Merges an older sighting of the same advertised peer into this one.
    pub fn update_overlap(
        &mut self,
        other: &PossibleTasteBuddy,
        compute: impl FnOnce(&HashSet<Cid>) -> usize,
    ) {
        self.preferences.extend(other.preferences.iter().copied());
        self.overlap = compute(&self.preferences);
    }

    pub fn time_remaining(&self, now: Instant) -> Duration {
        time_remaining(self.timestamp, now)
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.time_remaining(now) == Duration::ZERO
    }

    pub fn matches_mid(&self, mid: Mid) -> bool {
        self.mid == mid
    }

    /// Was this buddy advertised by `sock_addr`?
    pub fn received_from_addr(&self, sock_addr: std::net::SocketAddr) -> bool {
        self.received_from.sock_addr == sock_addr
    }
}

impl fmt::Display for PossibleTasteBuddy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PTB_{}_{}_{}",
            self.overlap, self.mid, self.received_from
        )
    }
}
