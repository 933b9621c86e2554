// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-tier shared cache: Redis primary, in-process degraded tier.
//!
//! The primary tier is the only one that gives cross-instance guarantees
//! (locks, dedupe, loop protection). The local tier is a *degraded mode*:
//!
//! ```text
//!   Healthy ──primary error / circuit open──► Degraded
//!      ▲                                          │
//!      └──── first successful primary call ◄──────┘
//!            (local tier cleared on the way back)
//! ```
//!
//! While degraded, every operation is served by the local tier and the
//! guarantees shrink to this instance only. Local entries never migrate to
//! the primary; they are dropped when the primary comes back.
//!
//! Methods here return plain values rather than `Result`: the local tier is
//! infallible, so callers (notably the ingress guard) can never be forced to
//! error by a cache outage. Each primary call is bounded by `call_timeout`; a
//! primary that hangs counts as failed and degrades like one that errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

/// Per-call bound on the primary unless configured otherwise.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

use super::memory::InMemoryCache;
use super::traits::{SharedCache, StorageError};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::time_source::{SystemTimeSource, TimeSource};

pub struct TieredCache {
    primary: Option<Arc<dyn SharedCache>>,
    local: InMemoryCache,
    circuit: CircuitBreaker,
    call_timeout: Duration,
    degraded: AtomicBool,
}

impl TieredCache {
    pub fn new(primary: Arc<dyn SharedCache>) -> Self {
        Self::with_parts(Some(primary), Arc::new(SystemTimeSource), CircuitConfig::cache())
    }

    /// No shared cache configured: local tier only, permanently degraded.
    pub fn local_only(clock: Arc<dyn TimeSource>) -> Self {
        Self::with_parts(None, clock, CircuitConfig::cache())
    }

    pub fn with_parts(primary: Option<Arc<dyn SharedCache>>, clock: Arc<dyn TimeSource>, circuit: CircuitConfig) -> Self {
        let degraded = primary.is_none();
        Self {
            primary,
            local: InMemoryCache::with_time_source(clock),
            circuit: CircuitBreaker::new("shared_cache", circuit),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            degraded: AtomicBool::new(degraded),
        }
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// True while operations are served by the local tier.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Live check of the primary tier. Updates the degraded flag.
    pub async fn ping(&self) -> bool {
        match &self.primary {
            Some(primary) => {
                let primary = Arc::clone(primary);
                self.try_primary_with(primary, |p| async move { p.ping().await })
                    .await
                    .is_some()
            }
            None => false,
        }
    }

    fn enter_degraded(&self, error: &str) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(error, "Shared cache unreachable, serving from local tier (instance-local guarantees only)");
            crate::metrics::set_cache_degraded(true);
        }
    }

    fn leave_degraded(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            let dropped = self.local.len();
            self.local.clear();
            info!(dropped, "Shared cache restored, local tier discarded");
            crate::metrics::set_cache_degraded(false);
        }
    }

    fn on_primary<T>(&self, result: Result<T, CircuitError<StorageError>>) -> Option<T> {
        match result {
            Ok(value) => {
                self.leave_degraded();
                Some(value)
            }
            Err(CircuitError::Inner(e)) => {
                self.enter_degraded(&e.to_string());
                None
            }
            Err(CircuitError::Rejected) => {
                self.enter_degraded("circuit open");
                None
            }
        }
    }

    /// `None` means "serve this from the local tier".
    async fn try_primary<T, F, Fut>(&self, op: F) -> Option<T>
    where
        F: FnOnce(Arc<dyn SharedCache>) -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let primary = Arc::clone(self.primary.as_ref()?);
        self.try_primary_with(primary, op).await
    }

    async fn try_primary_with<T, F, Fut>(&self, primary: Arc<dyn SharedCache>, op: F) -> Option<T>
    where
        F: FnOnce(Arc<dyn SharedCache>) -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let timeout = self.call_timeout;
        let outcome = self
            .circuit
            .call(|| async move {
                match tokio::time::timeout(timeout, op(primary)).await {
                    Ok(result) => result,
                    Err(_) => {
                        crate::metrics::record_timeout("shared_cache");
                        Err(StorageError::Timeout(format!("shared cache call after {}ms", timeout.as_millis())))
                    }
                }
            })
            .await;
        self.on_primary(outcome)
    }

    pub async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> bool {
        if let Some(set) = self.try_primary(|p| async move { p.set_nx(key, value, ttl).await }).await {
            return set;
        }
        self.local.set_nx(key, value, ttl).await.unwrap_or(false)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.try_primary(|p| async move { p.get(key).await }).await {
            return value;
        }
        self.local.get(key).await.ok().flatten()
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        if self.try_primary(|p| async move { p.set(key, value, ttl).await }).await.is_some() {
            return;
        }
        let _ = self.local.set(key, value, ttl).await;
    }

    pub async fn delete(&self, key: &str) {
        if self.try_primary(|p| async move { p.delete(key).await }).await.is_some() {
            return;
        }
        let _ = self.local.delete(key).await;
    }

    pub async fn compare_and_delete(&self, key: &str, expected: &str) -> bool {
        if let Some(deleted) = self
            .try_primary(|p| async move { p.compare_and_delete(key, expected).await })
            .await
        {
            return deleted;
        }
        self.local.compare_and_delete(key, expected).await.unwrap_or(false)
    }

    pub async fn replace_set(&self, key: &str, members: &[String], ttl: Duration) {
        if self
            .try_primary(|p| async move { p.replace_set(key, members, ttl).await })
            .await
            .is_some()
        {
            return;
        }
        let _ = self.local.replace_set(key, members, ttl).await;
    }

    pub async fn is_member(&self, key: &str, member: &str) -> bool {
        if let Some(found) = self.try_primary(|p| async move { p.is_member(key, member).await }).await {
            return found;
        }
        self.local.is_member(key, member).await.unwrap_or(false)
    }
}
