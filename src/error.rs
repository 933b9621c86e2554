//! Error taxonomy for event handling.
//!
//! Suppression decisions (duplicate, loop echo, stale conflict, burst) are
//! *not* errors; they are [`crate::coordinator::SyncOutcome`]s. What remains:
//!
//! | Variant | Meaning | Status |
//! |---|---|---|
//! | `Validation` | malformed payload, missing id/header | 400 |
//! | `Auth` | signature/secret mismatch | 401 |
//! | `Storage` | external failure after retries | 500 + dead letter |

use thiserror::Error;

use crate::registry::EventClass;
use crate::storage::traits::StorageError;

#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("Invalid event: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// HTTP status the ingress surface reports.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Auth(_) => 401,
            Self::Storage(_) => 500,
        }
    }

    /// Only unexpected failures go to the dead-letter sink.
    #[must_use]
    pub fn is_dead_letter(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Error chain rendered one cause per line (dead-letter "stack trace").
    #[must_use]
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\n  caused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

/// A second handler for an already bound event class (startup defect).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Handler for '{0}' already registered")]
    Conflict(EventClass),
}

/// Service could not be assembled.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Backend unavailable at startup: {0}")]
    Backend(#[from] StorageError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    /// Nothing registered for the class. Distinct from a handler that ran.
    #[error("No handler registered for '{0}'")]
    NoHandler(EventClass),

    #[error(transparent)]
    Handler(#[from] SyncError),
}
