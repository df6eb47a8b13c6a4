//! # Identity Module
//!
//! Members, member identifiers, overlay identifiers, and the pluggable
//! signature policy.
//!
//! A *member* is a peer identity backed by an Ed25519 public key. Its MID is
//! the truncated SHA-256 digest of that key. An *overlay identifier* (CID)
//! is the MID of the overlay's master member, which is why a tracker can
//! reconstruct a placeholder master member from nothing but an observed CID.
//!
//! ## Signature policy
//!
//! Rendezvous trackers relay introduction traffic for overlays they know
//! nothing about; verifying every signature would burn CPU for no trust
//! gain. [`CryptoPolicy`] therefore ranges from full verification down to
//! `NoCrypto`, where keys are mere identifiers and signature bytes are
//! zero-filled padding.

pub mod crypto;
pub mod member;

pub use crypto::CryptoPolicy;
pub use member::{Cid, Member, Mid, PrivateMember};
