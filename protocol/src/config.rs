//! # Protocol Configuration & Constants
//!
//! Every magic number in Kindred lives here. The walker timing constants in
//! particular are load-bearing: peers that disagree on `CANDIDATE_WALK_LIFETIME`
//! will evict each other at different rates and the overlay degrades into
//! mutual ghosting. Change them network-wide or not at all.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Length in bytes of an overlay identifier (CID). A CID is an opaque
/// 20-byte tag; equality is byte equality.
pub const CID_LENGTH: usize = 20;

/// Length in bytes of a member identifier (MID) — the truncated digest of
/// a member's public key.
pub const MID_LENGTH: usize = 20;

// ---------------------------------------------------------------------------
// Wire Format
// ---------------------------------------------------------------------------

/// The wire-format generation byte. Every Kindred packet starts with this.
/// Peers speaking a different generation are rejected before any decoding.
pub const WIRE_VERSION: u8 = 0x01;

/// The community version byte our own conversions emit. Remote overlays may
/// run other versions; the tracker installs conversions for those lazily.
pub const COMMUNITY_VERSION: u8 = 0x01;

/// Size of the packet header: wire version, community version, 20-byte CID,
/// message kind.
pub const HEADER_LENGTH: usize = 1 + 1 + CID_LENGTH + 1;

/// Ed25519 signature length for member-authenticated messages.
pub const SIGNATURE_LENGTH: usize = 64;

/// Per-buddy overlap bitfields in similarity responses are fixed at 4 bytes,
/// so only the first 32 preferences of a request are ever compared. Both
/// encoding and decoding MUST cap at this width to stay bit-exact with
/// existing peers.
pub const OVERLAP_BITFIELD_BITS: usize = 32;

// ---------------------------------------------------------------------------
// Walker Timing
// ---------------------------------------------------------------------------

/// How long a walked candidate stays verified. Inherited from the classic
/// overlay walker: 57.5 seconds, deliberately just under a minute so NAT
/// mappings are refreshed before routers forget them.
pub const CANDIDATE_WALK_LIFETIME: Duration = Duration::from_millis(57_500);

/// Interval of the taste-buddy ping task: a fifth of the walk lifetime.
pub const PING_INTERVAL: Duration = Duration::from_millis(11_500);

/// A taste buddy is stale when nothing refreshed it for half the walk
/// lifetime.
pub const PING_TIMEOUT: Duration = Duration::from_millis(28_750);

/// How long we wait for the response to a correlated request (similarity,
/// ping) before the cache entry times out. Slightly above 10 seconds to
/// survive one full retransmit cycle of a slow peer.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(10_500);

// ---------------------------------------------------------------------------
// Discovery Parameters
// ---------------------------------------------------------------------------

/// Maximum number of preferences (overlay CIDs) carried in a similarity
/// request or response.
pub const DEFAULT_MAX_PREFERENCES: usize = 25;

/// Maximum number of taste-buddy bitfield entries in a similarity response.
pub const DEFAULT_MAX_TASTE_BUDDIES: usize = 25;

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Default UDP port of the rendezvous tracker.
pub const DEFAULT_TRACKER_PORT: u16 = 6421;

/// Interval of the strike-based overlay cleanup task.
pub const COMMUNITY_CLEANUP_INTERVAL: Duration = Duration::from_secs(180);

/// Number of consecutive inactive cleanup ticks before an overlay is
/// unloaded.
pub const STRIKE_LIMIT: u32 = 3;

/// Interval of the stdout statistics report (`BANDWIDTH`, `COMMUNITY`, ...).
pub const STATISTICS_INTERVAL: Duration = Duration::from_secs(300);

/// File name of the destroy-evidence log inside the state directory.
pub const PERSISTENT_STORAGE_FILENAME: &str = "persistent-storage.data";

/// File name of the optional bootstrap seed list inside the state directory.
pub const BOOTSTRAP_FILENAME: &str = "bootstrap.txt";

/// Fixed back-off between bootstrap resolution attempts.
pub const BOOTSTRAP_RETRY_INTERVAL: Duration = Duration::from_secs(10);
