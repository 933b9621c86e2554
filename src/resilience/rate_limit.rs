// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Global write queue for the sheet API.
//!
//! The sheet enforces a hard external quota, so every sheet mutation in the
//! process waits on one shared GCRA limiter: a burst of up to
//! `ops_per_second` operations, then one more every `1 / ops_per_second`.
//! The queue shapes throughput only; it gives no ordering guarantee between
//! entities.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::debug;

pub struct WriteQueue {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl WriteQueue {
    /// `ops` operations per second; zero is treated as one.
    pub fn per_second(ops: usize) -> Self {
        let ops = u32::try_from(ops).unwrap_or(u32::MAX);
        let ops = NonZeroU32::new(ops).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(ops)),
        }
    }

    /// Wait for a slot under the quota.
    pub async fn acquire(&self) {
        let started = Instant::now();
        self.limiter.until_ready().await;

        let waited = started.elapsed();
        if waited > Duration::from_millis(1) {
            debug!(waited_ms = waited.as_millis() as u64, "Sheet write queued behind quota");
        }
        crate::metrics::record_queue_wait(waited);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_passes_without_waiting() {
        let queue = WriteQueue::per_second(3);
        let start = Instant::now();
        for _ in 0..3 {
            queue.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_start_beyond_burst_waits_for_replenish() {
        let queue = WriteQueue::per_second(4);
        for _ in 0..4 {
            queue.acquire().await;
        }

        // One cell replenishes every 250ms
        let start = Instant::now();
        queue.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_zero_quota_still_admits() {
        let queue = WriteQueue::per_second(0);
        queue.acquire().await;
    }
}
