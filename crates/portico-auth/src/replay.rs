//! Bounded replay cache for signed requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use portico_common::cache::{BoundedCache, Insertion};

/// Remembers `(device, signature, timestamp)` triples for `window`.
///
/// Capacity is fixed. When full, expired triples go first and then the
/// oldest live one, which reopens a replay window for that request; the
/// first such eviction is logged at warn level.
pub struct ReplayCache {
    seen: BoundedCache<String, ()>,
    eviction_warned: AtomicBool,
}

impl ReplayCache {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            seen: BoundedCache::new(capacity, window),
            eviction_warned: AtomicBool::new(false),
        }
    }

    pub fn window(&self) -> Duration {
        self.seen.ttl()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Record the triple. Returns `false` if it was already seen within the
    /// window.
    pub fn check_and_record_at(
        &self,
        device_id: &str,
        signature: &str,
        timestamp: &str,
        now: Instant,
    ) -> bool {
        let key = replay_key(device_id, signature, timestamp);
        match self.seen.insert_if_absent_at(key, (), now) {
            Insertion::AlreadyPresent => false,
            Insertion::Inserted { evicted: None } => true,
            Insertion::Inserted { evicted: Some(_) } => {
                if !self.eviction_warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        capacity = self.seen.capacity(),
                        "Replay cache full, evicting live entries"
                    );
                } else {
                    tracing::debug!("Replay cache evicted a live entry");
                }
                true
            }
        }
    }
}

/// Signatures are lowercased so hex case cannot dodge the cache.
fn replay_key(device_id: &str, signature: &str, timestamp: &str) -> String {
    format!(
        "{device_id}\0{}\0{timestamp}",
        signature.to_ascii_lowercase()
    )
}
