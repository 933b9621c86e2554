//! Resilience primitives for external calls.

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;
