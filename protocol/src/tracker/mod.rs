//! # Tracker Module
//!
//! Everything behind the standalone rendezvous tracker: overlays
//! manufactured per observed CID, the engine routing packets between them,
//! and the destroy-evidence log that outlives the in-memory overlay table.
//!
//! ```text
//! engine.rs     — cid→overlay table, on-demand factory, routing, aging,
//!                 statistics, evidence replay
//! community.rs  — TrackerCommunity / TrackerHardKilledCommunity
//! storage.rs    — the append-only destroy-evidence log
//! ```

pub mod community;
pub mod engine;
pub mod storage;

pub use community::{TrackerCommunity, TrackerHardKilledCommunity};
pub use engine::{Statistics, TrackerEngine};
pub use storage::{EvidenceLog, TrackerError, TrackerResult};
