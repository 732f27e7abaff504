//! Broadcast deduplication
//!
//! Mesh flooding delivers the same message more than once: from two
//! different connected peers, or from both the wire transport and the
//! in-process fan-out channel. The seen-set absorbs those duplicates before
//! any validation or storage work happens.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Entries older than the TTL are forgotten; the store's idempotent upserts
/// catch anything that slips past the window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Compact once the set grows past this many live entries.
pub const COMPACT_THRESHOLD: usize = 500;

pub struct SeenSet {
    entries: HashMap<String, Instant>,
    ttl: Duration,
}

impl SeenSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Record a key; returns true if this is the first sighting inside the
    /// TTL window.
    pub fn first_sighting(&mut self, key: &str) -> bool {
        let now = Instant::now();
        if let Some(seen_at) = self.entries.get(key) {
            if now.duration_since(*seen_at) < self.ttl {
                return false;
            }
        }
        self.entries.insert(key.to_string(), now);
        if self.entries.len() > COMPACT_THRESHOLD {
            self.compact(now);
        }
        true
    }

    fn compact(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries.retain(|_, seen_at| now.duration_since(*seen_at) < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_window_suppressed() {
        let mut seen = SeenSet::default();
        assert!(seen.first_sighting("post:x"));
        assert!(!seen.first_sighting("post:x"));
        assert!(seen.first_sighting("post:y"));
    }

    #[test]
    fn test_expired_key_readmitted() {
        let mut seen = SeenSet::new(Duration::from_millis(0));
        assert!(seen.first_sighting("post:x"));
        assert!(seen.first_sighting("post:x"), "zero TTL expires immediately");
    }

    #[test]
    fn test_compaction_drops_expired() {
        let mut seen = SeenSet::new(Duration::from_millis(0));
        for i in 0..=COMPACT_THRESHOLD {
            seen.first_sighting(&format!("post:{}", i));
        }
        // Everything was already expired, so compaction leaves at most the
        // entry inserted after the sweep.
        assert!(seen.len() <= 1, "len = {}", seen.len());
    }
}
