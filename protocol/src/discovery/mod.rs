//! # Discovery Module
//!
//! Similarity-driven peer discovery: finds peers sharing overlay
//! memberships, ranks them, keeps them alive, and steers the introduction
//! walk toward them.
//!
//! ```text
//! community.rs  — the DiscoveryCommunity engine (similarity, liveness,
//!                 steering, the taste-buddy registry)
//! buddies.rs    — ActualTasteBuddy / PossibleTasteBuddy
//! bootstrap.rs  — seed list loading and DNS resolution
//! ```

pub mod bootstrap;
pub mod buddies;
pub mod community;

pub use bootstrap::{Bootstrap, BootstrapError, ResolveOutcome};
pub use buddies::{ActualTasteBuddy, PossibleTasteBuddy};
pub use community::{discovery_cid, DiscoveryCommunity, DiscoveryConfig, OverlayDirectory};
