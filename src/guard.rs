// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ingress guard: decides accept/suppress before any business logic runs.
//!
//! Three checks, in order:
//!
//! 1. **Idempotency**: a caller-supplied `idempotency-key` is claimed with
//!    `SET NX` and a TTL. A second claim within the TTL short-circuits as
//!    already processed, whatever the payload.
//! 2. **Burst coalescing**: `sha256(origin | time bucket | payload)` is claimed
//!    the same way. The previous bucket's key is checked too, so two identical
//!    deliveries less than one bucket apart always collide even when they
//!    straddle a bucket boundary.
//! 3. **Loop breaker**: per-origin hit counter over a sliding window. Going
//!    over the threshold pauses the origin for a cooldown, during which every
//!    event from it is rate-limited.
//!
//! The guard never fails. Cache outages degrade to the local tier inside
//! [`TieredCache`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::SheetSyncConfig;
use crate::record::{EventEnvelope, Origin};
use crate::storage::tiered::TieredCache;
use crate::time_source::TimeSource;

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub idempotency_ttl: Duration,
    pub dedupe_ttl: Duration,
    pub dedupe_bucket: Duration,
    pub loop_window: Duration,
    pub loop_threshold: u32,
    pub loop_cooldown: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self::from_config(&SheetSyncConfig::default())
    }
}

impl GuardConfig {
    pub fn from_config(config: &SheetSyncConfig) -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(config.idempotency_ttl_secs),
            dedupe_ttl: Duration::from_secs(config.dedupe_ttl_secs),
            dedupe_bucket: Duration::from_secs(config.dedupe_bucket_secs.max(1)),
            loop_window: Duration::from_secs(config.loop_window_secs),
            loop_threshold: config.loop_threshold,
            loop_cooldown: Duration::from_secs(config.loop_cooldown_secs),
        }
    }
}

/// What the guard decided for one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Accept,
    /// Idempotency token already claimed
    AlreadyProcessed,
    /// Byte-identical delivery within the burst window
    Duplicate,
    /// Origin paused by the loop breaker
    RateLimited { retry_after: Duration },
}

impl GuardDecision {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::AlreadyProcessed => "already_processed",
            Self::Duplicate => "duplicate",
            Self::RateLimited { .. } => "rate_limited",
        }
    }
}

/// Sliding-window state for one origin.
#[derive(Debug, Clone, Copy)]
struct LoopCounter {
    hits: u32,
    window_start_ms: u64,
    paused_until_ms: Option<u64>,
}

impl LoopCounter {
    fn new(now_ms: u64) -> Self {
        Self {
            hits: 0,
            window_start_ms: now_ms,
            paused_until_ms: None,
        }
    }
}

pub struct IngressGuard {
    cache: Arc<TieredCache>,
    clock: Arc<dyn TimeSource>,
    config: GuardConfig,
    counters: DashMap<Origin, LoopCounter>,
}

impl IngressGuard {
    pub fn new(cache: Arc<TieredCache>, clock: Arc<dyn TimeSource>, config: GuardConfig) -> Self {
        Self {
            cache,
            clock,
            config,
            counters: DashMap::new(),
        }
    }

    /// Classify one delivery. Every check mutates shared state.
    pub async fn check(&self, envelope: &EventEnvelope) -> GuardDecision {
        let decision = self.decide(envelope).await;
        crate::metrics::record_guard_decision(envelope.origin.as_str(), decision.as_str());
        if !decision.is_accepted() {
            debug!(origin = %envelope.origin, decision = decision.as_str(), "Ingress suppressed");
        }
        decision
    }

    async fn decide(&self, envelope: &EventEnvelope) -> GuardDecision {
        if let Some(token) = envelope.idempotency_key() {
            let key = format!("idem:{}", token.trim());
            if !self.cache.set_nx(&key, "1", self.config.idempotency_ttl).await {
                return GuardDecision::AlreadyProcessed;
            }
        }

        if self.is_duplicate(envelope).await {
            return GuardDecision::Duplicate;
        }

        self.loop_check(envelope.origin)
    }

    fn bucket(&self, now_ms: u64) -> u64 {
        now_ms / (self.config.dedupe_bucket.as_millis() as u64).max(1)
    }

    fn dedupe_key(origin: Origin, bucket: u64, payload: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(origin.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(bucket.to_be_bytes());
        hasher.update(b"|");
        hasher.update(payload);
        format!("dedupe:{}", hex::encode(hasher.finalize()))
    }

    async fn is_duplicate(&self, envelope: &EventEnvelope) -> bool {
        let bucket = self.bucket(self.clock.now_ms());
        if bucket > 0 {
            let previous = Self::dedupe_key(envelope.origin, bucket - 1, &envelope.payload);
            if self.cache.get(&previous).await.is_some() {
                return true;
            }
        }
        let current = Self::dedupe_key(envelope.origin, bucket, &envelope.payload);
        !self.cache.set_nx(&current, "1", self.config.dedupe_ttl).await
    }

    fn loop_check(&self, origin: Origin) -> GuardDecision {
        let now = self.clock.now_ms();
        let window = self.config.loop_window.as_millis() as u64;
        let cooldown = self.config.loop_cooldown.as_millis() as u64;

        let mut counter = self.counters.entry(origin).or_insert_with(|| LoopCounter::new(now));

        if let Some(until) = counter.paused_until_ms {
            if now < until {
                return GuardDecision::RateLimited {
                    retry_after: Duration::from_millis(until - now),
                };
            }
            *counter = LoopCounter::new(now);
            debug!(origin = %origin, "Loop breaker cooldown over");
        }

        if now.saturating_sub(counter.window_start_ms) >= window {
            *counter = LoopCounter::new(now);
        }

        counter.hits += 1;
        if counter.hits > self.config.loop_threshold {
            counter.paused_until_ms = Some(now + cooldown);
            warn!(
                origin = %origin,
                hits = counter.hits,
                cooldown_secs = self.config.loop_cooldown.as_secs(),
                "Loop breaker tripped, pausing origin"
            );
            crate::metrics::record_loop_breaker_trip(origin.as_str());
            return GuardDecision::RateLimited {
                retry_after: self.config.loop_cooldown,
            };
        }
        GuardDecision::Accept
    }

    /// True while `origin` is paused.
    #[must_use]
    pub fn is_paused(&self, origin: Origin) -> bool {
        let now = self.clock.now_ms();
        self.counters
            .get(&origin)
            .and_then(|c| c.paused_until_ms)
            .is_some_and(|until| now < until)
    }
}
