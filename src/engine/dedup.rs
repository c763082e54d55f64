//! Bounded window of recently seen message ids.
//!
//! Oldest ids are evicted first once the window is full. An evicted id that
//! shows up again passes through as new: very old duplicates can be
//! redelivered, which subscribers tolerate by rendering idempotently.

use crate::api::feed_client::RawEvent;
use sha1::{Digest, Sha1};
use std::collections::{HashSet, VecDeque};

#[derive(Debug)]
pub struct Deduplicator {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record `id` and report whether it was new.
    ///
    /// Returns `false` when the id is still inside the window.
    pub fn check_and_insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }

        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Stable id for an event the upstream sent without one.
///
/// `serde_json` keeps object keys sorted, so identical payloads hash the same.
pub fn synthesize_id(raw: &RawEvent) -> String {
    let canonical = raw.0.to_string();
    let digest = Sha1::digest(canonical.as_bytes());
    format!("syn-{}", hex::encode(digest))
}
