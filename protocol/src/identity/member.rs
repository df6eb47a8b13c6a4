//! Member and overlay identifiers, public members, and signing members.

use std::fmt;
use std::hash::{Hash, Hasher};

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{CID_LENGTH, MID_LENGTH};

// ---------------------------------------------------------------------------
// Mid
// ---------------------------------------------------------------------------

/// A 20-byte member identifier: the SHA-256 digest of a member's public key,
/// truncated to 20 bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mid(pub [u8; MID_LENGTH]);

impl Mid {
    /// Derives the MID for a raw Ed25519 public key.
    pub fn from_public_key_bytes(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut mid = [0u8; MID_LENGTH];
        mid.copy_from_slice(&digest[..MID_LENGTH]);
        Mid(mid)
    }

    /// Returns the raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; MID_LENGTH] {
        &self.0
    }

    /// Hex rendering, used in telemetry lines and the evidence log.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Hash for Mid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // The identifier is itself a digest; any fixed 64-bit projection of
        // it is uniform.
        state.write_u64(u64::from_le_bytes(self.0[..8].try_into().unwrap()));
    }
}

impl fmt::Debug for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mid({})", self.to_hex())
    }
}

impl fmt::Display for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Cid
// ---------------------------------------------------------------------------

/// A 20-byte overlay identifier. Structurally this is the MID of the
/// overlay's master member, but the two are distinct types on purpose:
/// routing on a CID and authenticating a MID are different operations.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid(pub [u8; CID_LENGTH]);

impl Cid {
    /// Returns the raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; CID_LENGTH] {
        &self.0
    }

    /// The master member's MID, as a `Mid`.
    pub fn as_mid(&self) -> Mid {
        Mid(self.0)
    }

    /// Hex rendering, used in telemetry lines.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<Mid> for Cid {
    fn from(mid: Mid) -> Self {
        Cid(mid.0)
    }
}

impl Hash for Cid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(u64::from_le_bytes(self.0[..8].try_into().unwrap()));
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.to_hex())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Member
// ---------------------------------------------------------------------------

/// A peer identity.
///
/// Members observed on the wire carry their public key; placeholder members
/// (an overlay master reconstructed from a bare CID) carry only a MID and
/// can never pass signature verification.
#[derive(Clone, Debug)]
pub struct Member {
    mid: Mid,
    public_key: Option<VerifyingKey>,
}

impl Member {
    /// Builds a member from a verifying key.
    pub fn from_public_key(public_key: VerifyingKey) -> Self {
        let mid = Mid::from_public_key_bytes(public_key.as_bytes());
        Self {
            mid,
            public_key: Some(public_key),
        }
    }

    /// Builds a key-less placeholder member from a bare identifier.
    pub fn placeholder(mid: Mid) -> Self {
        Self {
            mid,
            public_key: None,
        }
    }

    pub fn mid(&self) -> Mid {
        self.mid
    }

    pub fn public_key(&self) -> Option<&VerifyingKey> {
        self.public_key.as_ref()
    }

    /// True when this member carries a real public key.
    pub fn has_key(&self) -> bool {
        self.public_key.is_some()
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.mid == other.mid
    }
}

impl Eq for Member {}

// ---------------------------------------------------------------------------
// PrivateMember
// ---------------------------------------------------------------------------

/// A member we can sign for: the local peer, or a tracker's process-wide
/// synthetic identity.
#[derive(Clone)]
pub struct PrivateMember {
    member: Member,
    signing_key: SigningKey,
}

impl PrivateMember {
    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Deterministic identity from a 32-byte seed. Test fixtures only ever
    /// go through here.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let member = Member::from_public_key(signing_key.verifying_key());
        Self {
            member,
            signing_key,
        }
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn mid(&self) -> Mid {
        self.member.mid()
    }

    pub fn public_key(&self) -> &VerifyingKey {
        self.member
            .public_key()
            .expect("private member always carries a key")
    }

    /// Signs `data` with the member's Ed25519 key.
    pub fn sign(&self, data: &[u8]) -> ed25519_dalek::Signature {
        self.signing_key.sign(data)
    }
}

impl fmt::Debug for PrivateMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material.
        write!(f, "PrivateMember({})", self.mid())
    }
}
