// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for sheet sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding service is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `sheet_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `origin`: database, sheet
//! - `direction`: to_sheet, to_structured
//! - `outcome` / `decision`: terminal result of the step

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
// Ingress
// ═══════════════════════════════════════════════════════════════════════════

/// Guard verdict for an inbound event
pub fn record_guard_decision(origin: &str, decision: &str) {
    counter!(
        "sheet_sync_guard_decisions_total",
        "origin" => origin.to_string(),
        "decision" => decision.to_string()
    )
    .increment(1);
}

/// Loop breaker tripped and paused an origin
pub fn record_loop_breaker_trip(origin: &str) {
    counter!(
        "sheet_sync_loop_breaker_trips_total",
        "origin" => origin.to_string()
    )
    .increment(1);
}

/// Webhook response by status code
pub fn record_webhook_response(origin: &str, status: u16) {
    counter!(
        "sheet_sync_webhook_responses_total",
        "origin" => origin.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_webhook_latency(origin: &str, duration: Duration) {
    histogram!(
        "sheet_sync_webhook_seconds",
        "origin" => origin.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// Sync pipeline
// ═══════════════════════════════════════════════════════════════════════════

/// Terminal outcome of one event
pub fn record_sync_outcome(direction: &str, outcome: &str) {
    counter!(
        "sheet_sync_events_total",
        "direction" => direction.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Failed event appended to the error log
pub fn record_dead_letter(origin: &str) {
    counter!(
        "sheet_sync_dead_letters_total",
        "origin" => origin.to_string()
    )
    .increment(1);
}

/// A required field was filled from another column
pub fn record_recovery(field: &str) {
    counter!(
        "sheet_sync_field_recoveries_total",
        "field" => field.to_string()
    )
    .increment(1);
}

/// Relation value discarded for referencing an unknown id
pub fn record_fk_rejected(table: &str) {
    counter!(
        "sheet_sync_fk_rejected_total",
        "table" => table.to_string()
    )
    .increment(1);
}

/// Shifted sheet row rewritten from the repaired record
pub fn record_self_heal(table: &str) {
    counter!(
        "sheet_sync_self_heals_total",
        "table" => table.to_string()
    )
    .increment(1);
}

/// Row location lookup: verified, stale, scanned, missing
pub fn record_row_lookup(result: &str) {
    counter!(
        "sheet_sync_row_lookups_total",
        "result" => result.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// External calls
// ═══════════════════════════════════════════════════════════════════════════

/// Sheet API call by operation (every attempt counts against the quota)
pub fn record_sheet_op(operation: &str) {
    counter!(
        "sheet_sync_sheet_ops_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Time spent waiting for a write permit
pub fn record_queue_wait(duration: Duration) {
    histogram!("sheet_sync_write_queue_wait_seconds").record(duration.as_secs_f64());
}

/// Latency of one guarded external call
pub fn record_external_latency(backend: &str, duration: Duration) {
    histogram!(
        "sheet_sync_external_seconds",
        "backend" => backend.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Retry loop finished after at least one failure
pub fn record_retry_outcome(operation: &str, outcome: &str) {
    counter!(
        "sheet_sync_retries_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// An attempt hit its per-attempt timeout
pub fn record_timeout(operation: &str) {
    counter!(
        "sheet_sync_timeouts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Backend health
// ═══════════════════════════════════════════════════════════════════════════

/// Set circuit breaker state (0=closed, 1=half-open, 2=open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "sheet_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "sheet_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Shared cache serving from the in-process tier
pub fn set_cache_degraded(degraded: bool) {
    gauge!("sheet_sync_cache_degraded").set(if degraded { 1.0 } else { 0.0 });
}

pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "sheet_sync_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_connection_error(backend: &str) {
    counter!(
        "sheet_sync_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}
