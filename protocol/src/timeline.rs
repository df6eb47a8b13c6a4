//! # Timeline
//!
//! The permission check applied to messages that exercise authority over an
//! overlay: destroying it, authorizing members, revoking them.
//!
//! The master member (whose MID *is* the overlay CID) holds every permission
//! implicitly. Any other member must have been granted the permission by an
//! `authorize` message; the granting packets are retained and returned as
//! *proofs* so that a destroy transition can be persisted together with the
//! full chain of evidence justifying it.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::debug;

use crate::identity::Mid;
use crate::wire::{Message, MessageKind, Payload};

/// Permission state of one overlay.
#[derive(Debug)]
pub struct Timeline {
    master: Mid,
    /// `(member, kind)` → the authorize packets granting that permission.
    permissions: HashMap<(Mid, MessageKind), Vec<Bytes>>,
}

impl Timeline {
    pub fn new(master: Mid) -> Self {
        Self {
            master,
            permissions: HashMap::new(),
        }
    }

    /// The kinds that require a permission at all. Plumbing traffic
    /// (introductions, punctures, similarity, liveness, identity exchange)
    /// is open to everyone.
    fn requires_permission(kind: MessageKind) -> bool {
        matches!(
            kind,
            MessageKind::Authorize | MessageKind::Revoke | MessageKind::DestroyCommunity
        )
    }

    /// The framework permission check: may `message` do what it does?
    ///
    /// Returns the verdict together with the proof packets that justify an
    /// acceptance. The master needs no proof; a granted member's proofs are
    /// the authorize packets that granted it.
    pub fn check(&self, message: &Message) -> (bool, Vec<Bytes>) {
        let kind = message.kind();
        if !Self::requires_permission(kind) {
            return (true, Vec::new());
        }

        let Some(sender) = message.sender_mid() else {
            return (false, Vec::new());
        };

        if sender == self.master {
            return (true, Vec::new());
        }

        match self.permissions.get(&(sender, kind)) {
            Some(proofs) => (true, proofs.clone()),
            None => {
                debug!(%sender, ?kind, "timeline rejected unauthorized message");
                (false, Vec::new())
            }
        }
    }

    /// Applies an accepted `authorize` message: each grant is recorded with
    /// the authorize packet itself as proof.
    pub fn apply_authorize(&mut self, message: &Message) {
        let Payload::Authorize(ref payload) = message.payload else {
            return;
        };
        for grant in &payload.grants {
            self.permissions
                .entry((grant.member, grant.kind))
                .or_default()
                .push(message.packet.clone());
        }
    }

    /// Applies an accepted `revoke` message.
    pub fn apply_revoke(&mut self, message: &Message) {
        let Payload::Revoke(ref payload) = message.payload else {
            return;
        };
        for revocation in &payload.revocations {
            self.permissions
                .remove(&(revocation.member, revocation.kind));
        }
    }

    /// All proof packets involving `member`, for answering `missing-proof`.
    pub fn proofs_for(&self, member: Mid) -> Vec<Bytes> {
        self.permissions
            .iter()
            .filter(|((mid, _), _)| *mid == member)
            .flat_map(|(_, proofs)| proofs.iter().cloned())
            .collect()
    }
}
