// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Kindred Protocol — Core Library
//!
//! Kindred is the peer-discovery and overlay-tracking core of a
//! gossip-based peer-to-peer system. It answers two questions that every
//! overlay network eventually asks: *which peers are worth walking to*,
//! and *where does a brand-new peer knock first*.
//!
//! The first is the business of the discovery overlay: peers exchange
//! their overlay memberships, measure the intersection ("taste"), keep a
//! ranked registry of the most similar peers alive with pings, and steer
//! the introduction walk toward them. The second is the business of the
//! tracker: a rendezvous process that reflects introductions for overlays
//! it has never seen, aging each one out on a strike counter and keeping
//! durable evidence of the ones that were destroyed.
//!
//! ## Architecture
//!
//! - **identity** — members, MIDs, CIDs, and the signature policy.
//! - **candidate** — endpoints we can walk to, and the per-overlay table.
//! - **wire** — payloads and the versioned packet codec.
//! - **requestcache** — 16-bit correlation tokens with expiry.
//! - **timeline** — the permission check and its proof chains.
//! - **community** — state and default handlers shared by all overlays.
//! - **discovery** — the similarity/introduction-steering engine.
//! - **tracker** — the rendezvous engine and its evidence log.
//! - **config** — every protocol constant.
//!
//! ## Design Philosophy
//!
//! 1. Protocol engines are sans-I/O: handlers take `Instant`, return the
//!    packets to send, and can be unit-tested without a socket in sight.
//! 2. One task owns all core state. No locks, no lock-ordering bugs.
//! 3. Malformed traffic is dropped with a reason, never an error that
//!    crosses the event-loop turn.

pub mod candidate;
pub mod community;
pub mod config;
pub mod discovery;
pub mod identity;
pub mod requestcache;
pub mod timeline;
pub mod tracker;
pub mod wire;
