//! Public types for the sync coordinator.

use std::fmt;

use crate::record::Origin;

/// Per-event state machine.
///
/// ```text
/// LockedOut                        (lock held elsewhere → burst protected)
/// Normalizing → LoopCheck → ConflictCheck → Writing → Done
///                  │             │             │
///                  └─► Dropped ◄─┘             └─► Failed (dead letter)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    LockedOut,
    Normalizing,
    LoopCheck,
    ConflictCheck,
    Writing,
    Done,
    Dropped,
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockedOut => write!(f, "LockedOut"),
            Self::Normalizing => write!(f, "Normalizing"),
            Self::LoopCheck => write!(f, "LoopCheck"),
            Self::ConflictCheck => write!(f, "ConflictCheck"),
            Self::Writing => write!(f, "Writing"),
            Self::Done => write!(f, "Done"),
            Self::Dropped => write!(f, "Dropped"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Terminal, successful outcome of one event. Suppressions are outcomes,
/// not errors: the decision itself is the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Written to the counterpart store
    Synced,
    /// Guard: replayed idempotency key or byte-identical burst
    Duplicate,
    /// Own write echoed back (origin tag or unchanged fingerprint)
    LoopSkipped,
    /// Counterpart holds a newer change
    Conflict,
    /// Another event for the entity holds the lock
    BurstProtected,
}

impl SyncOutcome {
    /// Response body for the webhook of `origin`.
    #[must_use]
    pub fn response_text(&self, origin: Origin) -> &'static str {
        match (origin, self) {
            (_, Self::Synced) => "OK",
            (_, Self::Conflict) => "Dropped due to conflict",
            (_, Self::BurstProtected) => "OK (Burst Protected)",
            (Origin::Structured, Self::Duplicate) => "Duplicate",
            (Origin::Structured, Self::LoopSkipped) => "Skipped loop",
            (Origin::Sheet, Self::Duplicate | Self::LoopSkipped) => "Dropped (Duplicate)",
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Duplicate => "duplicate",
            Self::LoopSkipped => "loop_skipped",
            Self::Conflict => "conflict",
            Self::BurstProtected => "burst_protected",
        }
    }
}

/// Outcome of comparing sync timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    Proceed,
    /// Counterpart newer by more than the tolerance
    Stale { incoming_ms: i64, stored_ms: i64 },
}

/// Proceed iff `incoming >= stored - tolerance`. No stored timestamp always
/// proceeds.
#[must_use]
pub fn resolve_conflict(incoming_ms: i64, stored_ms: Option<i64>, tolerance_ms: i64) -> ConflictDecision {
    match stored_ms {
        Some(stored_ms) if incoming_ms < stored_ms.saturating_sub(tolerance_ms) => ConflictDecision::Stale {
            incoming_ms,
            stored_ms,
        },
        _ => ConflictDecision::Proceed,
    }
}
