//! # Wire Messages
//!
//! Payload definitions for every message kind the overlay speaks, plus the
//! versioned packet codec ([`conversion`]).
//!
//! ## Packet layout
//!
//! ```text
//! ┌──────────────┬───────────────────┬──────────┬────────┬─────────────────┐
//! │ wire version │ community version │ cid      │ kind   │ body            │
//! │ 1 byte       │ 1 byte            │ 20 bytes │ 1 byte │ bincode         │
//! └──────────────┴───────────────────┴──────────┴────────┴─────────────────┘
//!                                 member-authenticated kinds append a
//!                                 64-byte Ed25519 signature over all
//!                                 preceding bytes
//! ```
//!
//! The body carries the sender's global time, the sender's public key for
//! authenticated kinds, and the kind-specific payload. `ping`, `pong`,
//! `puncture`, and `puncture-request` are unauthenticated; everything else
//! is member-signed.

pub mod conversion;

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

pub use conversion::{peek_header, Conversion, Header, Message, WireError};

use crate::candidate::ConnectionType;
use crate::identity::{Cid, Mid};

// ---------------------------------------------------------------------------
// Message Kind
// ---------------------------------------------------------------------------

/// Discriminant of every message the overlay speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    IntroductionRequest = 1,
    IntroductionResponse = 2,
    PunctureRequest = 3,
    Puncture = 4,
    Identity = 5,
    MissingIdentity = 6,
    Authorize = 7,
    Revoke = 8,
    MissingProof = 9,
    DestroyCommunity = 10,
    SimilarityRequest = 11,
    SimilarityResponse = 12,
    Ping = 13,
    Pong = 14,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::IntroductionRequest),
            2 => Some(Self::IntroductionResponse),
            3 => Some(Self::PunctureRequest),
            4 => Some(Self::Puncture),
            5 => Some(Self::Identity),
            6 => Some(Self::MissingIdentity),
            7 => Some(Self::Authorize),
            8 => Some(Self::Revoke),
            9 => Some(Self::MissingProof),
            10 => Some(Self::DestroyCommunity),
            11 => Some(Self::SimilarityRequest),
            12 => Some(Self::SimilarityResponse),
            13 => Some(Self::Ping),
            14 => Some(Self::Pong),
            _ => None,
        }
    }

    /// The canonical message name, as used in telemetry (`OUTGOING`) and in
    /// the destroy-evidence log.
    pub fn name(&self) -> &'static str {
        match self {
            Self::IntroductionRequest => "dispersy-introduction-request",
            Self::IntroductionResponse => "dispersy-introduction-response",
            Self::PunctureRequest => "dispersy-puncture-request",
            Self::Puncture => "dispersy-puncture",
            Self::Identity => "dispersy-identity",
            Self::MissingIdentity => "dispersy-missing-identity",
            Self::Authorize => "dispersy-authorize",
            Self::Revoke => "dispersy-revoke",
            Self::MissingProof => "dispersy-missing-proof",
            Self::DestroyCommunity => "dispersy-destroy-community",
            Self::SimilarityRequest => "similarity-request",
            Self::SimilarityResponse => "similarity-response",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Whether packets of this kind end in a member signature.
    pub fn is_authenticated(&self) -> bool {
        !matches!(
            self,
            Self::PunctureRequest | Self::Puncture | Self::Ping | Self::Pong
        )
    }
}

// ---------------------------------------------------------------------------
// Introduction / Puncture Payloads
// ---------------------------------------------------------------------------

/// The walker's introduction request, extended with the similarity
/// steering field: `introduce_me_to` asks the receiver to introduce us to a
/// specific member instead of a random verified candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroductionRequestPayload {
    /// The destination address as the sender believes it to be. Lets the
    /// receiver detect that its WAN address changed.
    pub destination_address: SocketAddr,
    pub source_lan_address: SocketAddr,
    pub source_wan_address: SocketAddr,
    /// When false the receiver should not introduce anyone back.
    pub advice: bool,
    pub connection_type: ConnectionType,
    /// Opaque synchronization carrier. Content synchronization is outside
    /// this overlay; the field is never populated, only carried.
    pub sync: Option<Vec<u8>>,
    pub identifier: u16,
    /// Steering: the member we would like to be introduced to.
    pub introduce_me_to: Option<Mid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroductionResponsePayload {
    pub destination_address: SocketAddr,
    pub source_lan_address: SocketAddr,
    pub source_wan_address: SocketAddr,
    /// The candidate being introduced, when there is one.
    pub lan_introduction_address: Option<SocketAddr>,
    pub wan_introduction_address: Option<SocketAddr>,
    pub tunnel: bool,
    pub identifier: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunctureRequestPayload {
    /// Where the walker that asked for the introduction can be punctured.
    pub lan_walker_address: SocketAddr,
    pub wan_walker_address: SocketAddr,
    pub identifier: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuncturePayload {
    pub source_lan_address: SocketAddr,
    pub source_wan_address: SocketAddr,
    pub identifier: u16,
}

// ---------------------------------------------------------------------------
// Identity / Permission Payloads
// ---------------------------------------------------------------------------

/// Announces the sender's identity. The body is empty on purpose: the
/// authentication layer already carries the public key, which is the whole
/// message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPayload {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingIdentityPayload {
    /// The member whose identity packet we want.
    pub mid: Mid,
}

/// One permission granted or revoked: `member` may produce messages of
/// `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionTriple {
    pub member: Mid,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizePayload {
    pub grants: Vec<PermissionTriple>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokePayload {
    pub revocations: Vec<PermissionTriple>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingProofPayload {
    pub mid: Mid,
    pub global_time: u64,
}

/// How thoroughly the overlay is being destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestroyDegree {
    /// Members should stop participating but may keep data.
    Soft,
    /// The overlay is dead; drop everything and refuse new traffic.
    Hard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyCommunityPayload {
    pub degree: DestroyDegree,
}

// ---------------------------------------------------------------------------
// Similarity Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimilarityRequestPayload {
    pub identifier: u16,
    pub lan_address: SocketAddr,
    pub wan_address: SocketAddr,
    pub connection_type: ConnectionType,
    /// The sender's walker-enabled overlay memberships, capped at
    /// `max_prefs`.
    pub preference_list: Vec<Cid>,
}

/// Per-buddy overlap against the *requester's* preference list, compressed
/// to a 32-bit bitfield: bit `i` is set iff the requester's `i`-th
/// preference is shared by this buddy. Only the first 32 preferences of the
/// request participate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyOverlap {
    pub mid: Mid,
    pub bitfield: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimilarityResponsePayload {
    pub identifier: u16,
    pub preference_list: Vec<Cid>,
    pub tb_overlap: Vec<BuddyOverlap>,
}

// ---------------------------------------------------------------------------
// Liveness Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub identifier: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    pub identifier: u16,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// The kind-specific body of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    IntroductionRequest(IntroductionRequestPayload),
    IntroductionResponse(IntroductionResponsePayload),
    PunctureRequest(PunctureRequestPayload),
    Puncture(PuncturePayload),
    Identity(IdentityPayload),
    MissingIdentity(MissingIdentityPayload),
    Authorize(AuthorizePayload),
    Revoke(RevokePayload),
    MissingProof(MissingProofPayload),
    DestroyCommunity(DestroyCommunityPayload),
    SimilarityRequest(SimilarityRequestPayload),
    SimilarityResponse(SimilarityResponsePayload),
    Ping(PingPayload),
    Pong(PongPayload),
}

impl Payload {
    /// The message kind this payload belongs to.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::IntroductionRequest(_) => MessageKind::IntroductionRequest,
            Payload::IntroductionResponse(_) => MessageKind::IntroductionResponse,
            Payload::PunctureRequest(_) => MessageKind::PunctureRequest,
            Payload::Puncture(_) => MessageKind::Puncture,
            Payload::Identity(_) => MessageKind::Identity,
            Payload::MissingIdentity(_) => MessageKind::MissingIdentity,
            Payload::Authorize(_) => MessageKind::Authorize,
            Payload::Revoke(_) => MessageKind::Revoke,
            Payload::MissingProof(_) => MessageKind::MissingProof,
            Payload::DestroyCommunity(_) => MessageKind::DestroyCommunity,
            Payload::SimilarityRequest(_) => MessageKind::SimilarityRequest,
            Payload::SimilarityResponse(_) => MessageKind::SimilarityResponse,
            Payload::Ping(_) => MessageKind::Ping,
            Payload::Pong(_) => MessageKind::Pong,
        }
    }
}
