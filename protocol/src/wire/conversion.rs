//! Versioned packet codec.
//!
//! A [`Conversion`] encodes and decodes packets for one community version
//! byte. Overlays register one conversion per version they speak; the
//! tracker additionally installs conversions lazily when it observes an
//! unknown community version under a wire version it understands.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::{HEADER_LENGTH, SIGNATURE_LENGTH, WIRE_VERSION};
use crate::identity::{Cid, CryptoPolicy, Member, PrivateMember};
use crate::wire::{MessageKind, Payload};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Decoding and encoding failures.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("unsupported wire version: 0x{0:02x}")]
    UnsupportedWireVersion(u8),

    #[error("no conversion for community version 0x{0:02x}")]
    ConversionNotFound(u8),

    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("body codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("payload variant {payload:?} does not match header kind {header:?}")]
    KindMismatch {
        header: MessageKind,
        payload: MessageKind,
    },

    #[error("malformed public key")]
    MalformedKey,

    #[error("signature verification failed")]
    InvalidSignature,
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The fixed 23-byte packet prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub wire_version: u8,
    pub community_version: u8,
    pub cid: Cid,
    pub kind: MessageKind,
}

/// Parses the header without touching the body. The tracker routes on the
/// CID before it knows which overlay (and thus which conversion) applies.
pub fn peek_header(packet: &[u8]) -> Result<Header, WireError> {
    if packet.len() < HEADER_LENGTH {
        return Err(WireError::PacketTooShort(packet.len()));
    }
    if packet[0] != WIRE_VERSION {
        return Err(WireError::UnsupportedWireVersion(packet[0]));
    }
    let mut cid = [0u8; 20];
    cid.copy_from_slice(&packet[2..22]);
    let kind = MessageKind::from_u8(packet[22]).ok_or(WireError::UnknownKind(packet[22]))?;
    Ok(Header {
        wire_version: packet[0],
        community_version: packet[1],
        cid: Cid(cid),
        kind,
    })
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A fully decoded packet.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub global_time: u64,
    /// The authenticated sender; `None` for unauthenticated kinds.
    pub auth: Option<Member>,
    pub payload: Payload,
    /// The raw packet bytes, kept for the sync store and the evidence log.
    pub packet: Bytes,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn cid(&self) -> Cid {
        self.header.cid
    }

    /// MID of the authenticated sender, if any.
    pub fn sender_mid(&self) -> Option<crate::identity::Mid> {
        self.auth.as_ref().map(|m| m.mid())
    }
}

/// The bincode-encoded portion of a packet.
#[derive(Serialize, Deserialize)]
struct WireBody {
    global_time: u64,
    public_key: Option<[u8; 32]>,
    payload: Payload,
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

/// Codec for one community version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conversion {
    community_version: u8,
}

impl Conversion {
    pub fn new(community_version: u8) -> Self {
        Self { community_version }
    }

    pub fn community_version(&self) -> u8 {
        self.community_version
    }

    /// True when this conversion can decode `packet`.
    pub fn matches(&self, packet: &[u8]) -> bool {
        packet.len() >= 2 && packet[0] == WIRE_VERSION && packet[1] == self.community_version
    }

    /// Encodes a packet. Authenticated kinds are signed by `signer` under
    /// `policy`; unauthenticated kinds ignore both.
    pub fn encode(
        &self,
        cid: Cid,
        global_time: u64,
        payload: &Payload,
        signer: &PrivateMember,
        policy: CryptoPolicy,
    ) -> Result<Bytes, WireError> {
        let kind = payload.kind();
        let authenticated = kind.is_authenticated();

        let body = WireBody {
            global_time,
            public_key: authenticated.then(|| *signer.public_key().as_bytes()),
            payload: payload.clone(),
        };

        let mut packet = Vec::with_capacity(HEADER_LENGTH + 64);
        packet.push(WIRE_VERSION);
        packet.push(self.community_version);
        packet.extend_from_slice(cid.as_bytes());
        packet.push(kind as u8);
        bincode::serialize_into(&mut packet, &body)?;

        if authenticated {
            let signature = policy.sign(signer, &packet);
            packet.extend_from_slice(&signature);
        }

        Ok(Bytes::from(packet))
    }

    /// Decodes and authenticates a packet.
    pub fn decode(&self, packet: &[u8], policy: CryptoPolicy) -> Result<Message, WireError> {
        let header = peek_header(packet)?;
        let authenticated = header.kind.is_authenticated();

        let body_end = if authenticated {
            packet
                .len()
                .checked_sub(SIGNATURE_LENGTH)
                .filter(|end| *end >= HEADER_LENGTH)
                .ok_or(WireError::PacketTooShort(packet.len()))?
        } else {
            packet.len()
        };

        let body: WireBody = bincode::deserialize(&packet[HEADER_LENGTH..body_end])?;
        if body.payload.kind() != header.kind {
            return Err(WireError::KindMismatch {
                header: header.kind,
                payload: body.payload.kind(),
            });
        }

        let auth = if authenticated {
            let key_bytes = body.public_key.ok_or(WireError::MalformedKey)?;
            let public_key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
                .map_err(|_| WireError::MalformedKey)?;
            let member = Member::from_public_key(public_key);
            if !policy.verify(&member, &packet[..body_end], &packet[body_end..]) {
                trace!(kind = ?header.kind, "dropping packet with bad signature");
                return Err(WireError::InvalidSignature);
            }
            Some(member)
        } else {
            None
        };

        Ok(Message {
            header,
            global_time: body.global_time,
            auth,
            payload: body.payload,
            packet: Bytes::copy_from_slice(packet),
        })
    }
}
