// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wall-clock abstraction.
//!
//! Every TTL, time bucket, sliding window and sync timestamp in the crate reads
//! time through [`TimeSource`], so tests can drive the guard, the local cache
//! tier and conflict resolution deterministically with [`FakeTimeSource`].
//!
//! # Example
//!
//! ```
//! use sheet_sync::time_source::{FakeTimeSource, TimeSource};
//!
//! let clock = FakeTimeSource::new(1_000);
//! clock.advance(500);
//! assert_eq!(clock.now_ms(), 1_500);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of "now" in milliseconds since the Unix epoch.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Production clock backed by `chrono::Utc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually driven clock for tests. Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct FakeTimeSource {
    time: Arc<AtomicU64>,
}

impl Default for FakeTimeSource {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl FakeTimeSource {
    pub fn new(initial_ms: u64) -> Self {
        Self {
            time: Arc::new(AtomicU64::new(initial_ms)),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.time.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Set an absolute time. May go backwards (clock skew scenarios).
    pub fn set(&self, ms: u64) {
        self.time.store(ms, Ordering::SeqCst);
    }
}

impl TimeSource for FakeTimeSource {
    fn now_ms(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_clock_shared_between_clones() {
        let a = FakeTimeSource::new(10);
        let b = a.clone();
        a.advance(5);
        assert_eq!(b.now_ms(), 15);
        b.set(3);
        assert_eq!(a.now_ms(), 3);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemTimeSource.now_ms() > 1_577_836_800_000);
    }
}
