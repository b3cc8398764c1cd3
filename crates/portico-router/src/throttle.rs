use std::time::{Duration, Instant};

use portico_common::cache::{BoundedCache, Insertion};

const MAX_TRACKED_KEYS: usize = 1024;

/// At most one log line per key per interval.
pub struct LogThrottle {
    seen: BoundedCache<String, ()>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            seen: BoundedCache::new(MAX_TRACKED_KEYS, interval),
        }
    }

    pub fn should_log(&self, key: &str) -> bool {
        self.should_log_at(key, Instant::now())
    }

    pub fn should_log_at(&self, key: &str, now: Instant) -> bool {
        matches!(
            self.seen.insert_if_absent_at(key.to_string(), (), now),
            Insertion::Inserted { .. }
        )
    }
}
