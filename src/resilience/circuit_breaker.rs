// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breakers around the three external collaborators.
//!
//! Wraps async calls with the `recloser` crate. When a backend keeps failing
//! the breaker opens and calls fail fast; for the shared cache that is the
//! signal to fall through to the local degraded tier instead of waiting on
//! timeouts for every request.
//!
//! States:
//! - Closed: normal operation, calls pass through
//! - Open: backend unhealthy, calls are rejected without being attempted
//! - HalfOpen: trial calls test whether the backend recovered

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Last observed breaker state, for health and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failures within the closed window needed to trip
    pub failure_threshold: u32,
    /// Calls allowed through while half-open
    pub success_threshold: u32,
    /// How long to stay open before a trial call
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Shared cache: trip fast and retry often, the local tier covers the gap
    #[must_use]
    pub fn cache() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(5),
        }
    }

    /// Sheet API: its quota errors come in bursts, tolerate more of them
    #[must_use]
    pub fn sheet() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(15),
        }
    }

    /// Fast recovery for tests
    #[must_use]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call accounting
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    state: AtomicU8,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(0.5)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// State inferred from the most recent call outcome.
    ///
    /// recloser does not expose its state machine; a rejection means open,
    /// a success means closed, a failure after a rejection means half-open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            0 => CircuitState::Closed,
            1 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }

    fn set_state(&self, state: CircuitState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!(circuit = %self.name, state = %state, "Circuit state changed");
            crate::metrics::set_circuit_state(&self.name, state as u8);
        }
    }

    /// Execute an async operation through the circuit breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.set_state(CircuitState::Closed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                self.set_state(CircuitState::Open);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                if self.state() == CircuitState::Open {
                    self.set_state(CircuitState::HalfOpen);
                }
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// Breakers for the two stores. The shared cache owns its breaker inside
/// [`crate::storage::tiered::TieredCache`].
pub struct BackendCircuits {
    pub structured: CircuitBreaker,
    pub sheet: CircuitBreaker,
}

impl Default for BackendCircuits {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendCircuits {
    pub fn new() -> Self {
        Self {
            structured: CircuitBreaker::new("structured_store", CircuitConfig::default()),
            sheet: CircuitBreaker::new("sheet", CircuitConfig::sheet()),
        }
    }

    /// Both breakers with test timings
    pub fn for_tests() -> Self {
        Self {
            structured: CircuitBreaker::new("structured_store", CircuitConfig::test()),
            sheet: CircuitBreaker::new("sheet", CircuitConfig::test()),
        }
    }
}
