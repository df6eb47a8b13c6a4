//! # Request Cache
//!
//! Correlates outgoing requests with their responses through short-lived
//! 16-bit tokens. Each protocol family (similarity, ping, introduction)
//! owns its own cache instance, so identifiers only need to be unique
//! within a family.
//!
//! An entry leaves the cache exactly once: either a matching response
//! `pop`s it, or the owner's timer tick collects it via
//! [`RequestCache::take_expired`] and runs the timeout behavior. There is
//! no third path, which is what gives the at-most-once guarantee.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::trace;

/// One in-flight request of type `T`, with its expiry deadline.
#[derive(Debug)]
struct Slot<T> {
    deadline: Instant,
    entry: T,
}

/// A bounded-lifetime correlation table for one request family.
#[derive(Debug)]
pub struct RequestCache<T> {
    name: &'static str,
    timeout: Duration,
    slots: HashMap<u16, Slot<T>>,
}

impl<T> RequestCache<T> {
    /// Creates a cache whose entries expire `timeout` after insertion.
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            slots: HashMap::new(),
        }
    }

    /// Inserts `entry` under a fresh uniform-random 16-bit identifier and
    /// returns it.
    ///
    /// Identifier collisions are resolved by redrawing. With lifetimes of
    /// ~10 s and a 16-bit space this loop terminates in one draw in all but
    /// adversarial scenarios; the retry is there for the rest.
    pub fn add(&mut self, entry: T, now: Instant) -> u16 {
        let mut rng = rand::thread_rng();
        let identifier = loop {
            let candidate: u16 = rng.gen();
            if !self.slots.contains_key(&candidate) {
                break candidate;
            }
        };

        self.slots.insert(
            identifier,
            Slot {
                deadline: now + self.timeout,
                entry,
            },
        );
        trace!(family = self.name, identifier, "request registered");
        identifier
    }

    /// Peeks at an entry without consuming it.
    pub fn get(&self, identifier: u16) -> Option<&T> {
        self.slots.get(&identifier).map(|slot| &slot.entry)
    }

    pub fn get_mut(&mut self, identifier: u16) -> Option<&mut T> {
        self.slots.get_mut(&identifier).map(|slot| &mut slot.entry)
    }

    /// Consumes an entry. After a `pop` the identifier can never expire.
    pub fn pop(&mut self, identifier: u16) -> Option<T> {
        let entry = self.slots.remove(&identifier).map(|slot| slot.entry);
        if entry.is_some() {
            trace!(family = self.name, identifier, "request completed");
        }
        entry
    }

    pub fn has(&self, identifier: u16) -> bool {
        self.slots.contains_key(&identifier)
    }

    /// Removes and returns every entry whose deadline has passed. The owner
    /// calls this from its timer tick and runs each entry's timeout
    /// behavior; an entry is returned here at most once.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(u16, T)> {
        let expired: Vec<u16> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(identifier, _)| *identifier)
            .collect();

        expired
            .into_iter()
            .map(|identifier| {
                trace!(family = self.name, identifier, "request timed out");
                let slot = self.slots.remove(&identifier).expect("key listed above");
                (identifier, slot.entry)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
