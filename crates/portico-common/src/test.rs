//! Test helpers shared across portico crates.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// A fresh, not-yet-created path under the system temp dir.
///
/// Unique per call within the process, so parallel tests never collide.
pub fn unique_temp_dir(name: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "portico-{name}-{}-{nanos}-{n}",
        std::process::id()
    ))
}
