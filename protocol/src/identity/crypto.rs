//! Signature policy for packet authentication.

use ed25519_dalek::{Signature, Verifier};
use tracing::trace;

use crate::config::SIGNATURE_LENGTH;
use crate::identity::member::{Member, PrivateMember};

/// How member-authenticated packets are signed and verified.
///
/// The packet layout is identical under all policies: authenticated kinds
/// always end in [`SIGNATURE_LENGTH`] signature bytes. What varies is
/// whether those bytes are real and whether anyone looks at them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoPolicy {
    /// Sign outgoing packets and verify incoming ones.
    Sign,
    /// Sign outgoing packets but accept incoming signatures unchecked.
    /// The tracker default: rendezvous traffic carries no trust anyway.
    #[default]
    NoVerify,
    /// Keys are identifiers only; signature bytes are zero padding.
    NoCrypto,
}

impl CryptoPolicy {
    /// Parses the policy names accepted on the tracker command line.
    pub fn from_cli_name(name: &str) -> Option<Self> {
        match name {
            "NoCrypto" => Some(CryptoPolicy::NoCrypto),
            "NoVerifyCrypto" => Some(CryptoPolicy::NoVerify),
            _ => None,
        }
    }

    /// Produces the signature bytes for `data`.
    pub fn sign(&self, member: &PrivateMember, data: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        match self {
            CryptoPolicy::Sign | CryptoPolicy::NoVerify => member.sign(data).to_bytes(),
            CryptoPolicy::NoCrypto => [0u8; SIGNATURE_LENGTH],
        }
    }

    /// Checks the signature bytes over `data` against `member`'s key.
    ///
    /// A placeholder member (no key) can never verify under [`Sign`].
    ///
    /// [`Sign`]: CryptoPolicy::Sign
    pub fn verify(&self, member: &Member, data: &[u8], signature: &[u8]) -> bool {
        match self {
            CryptoPolicy::NoVerify | CryptoPolicy::NoCrypto => true,
            CryptoPolicy::Sign => {
                let Some(public_key) = member.public_key() else {
                    trace!(mid = %member.mid(), "cannot verify signature of key-less member");
                    return false;
                };
                let Ok(signature) = Signature::from_slice(signature) else {
                    return false;
                };
                public_key.verify(data, &signature).is_ok()
            }
        }
    }
}
