//! Single-subscriber handler registry.
//!
//! Exactly one handler may be bound per [`EventClass`]. A second
//! registration is a configuration defect and fails with
//! [`RegistryError::Conflict`]; the first binding is never replaced.
//!
//! ```
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use sheet_sync::coordinator::SyncOutcome;
//! use sheet_sync::record::EventEnvelope;
//! use sheet_sync::registry::{EventClass, EventHandler, HandlerRegistry};
//! use sheet_sync::SyncError;
//!
//! struct Noop;
//!
//! #[async_trait]
//! impl EventHandler for Noop {
//!     async fn handle(&self, _e: EventEnvelope) -> Result<SyncOutcome, SyncError> {
//!         Ok(SyncOutcome::Synced)
//!     }
//! }
//!
//! let registry = HandlerRegistry::new();
//! registry.register(EventClass::SheetEdit, Arc::new(Noop)).unwrap();
//! assert!(registry.register(EventClass::SheetEdit, Arc::new(Noop)).is_err());
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{error, info};

use crate::coordinator::SyncOutcome;
use crate::error::{DispatchError, RegistryError, SyncError};
use crate::record::{EventEnvelope, Origin};

/// Inbound event classes, one per webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    /// Change notification from the structured store
    StructuredChange,
    /// Edit notification from the sheet
    SheetEdit,
}

impl EventClass {
    #[must_use]
    pub fn for_origin(origin: Origin) -> Self {
        match origin {
            Origin::Structured => Self::StructuredChange,
            Origin::Sheet => Self::SheetEdit,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StructuredChange => "structured_change",
            Self::SheetEdit => "sheet_edit",
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: EventEnvelope) -> Result<SyncOutcome, SyncError>;
}

type Handlers = Arc<DashMap<EventClass, Arc<dyn EventHandler>>>;

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Handlers,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `class`. Fails if the class is already bound.
    pub fn register(&self, class: EventClass, handler: Arc<dyn EventHandler>) -> Result<(), RegistryError> {
        match self.handlers.entry(class) {
            Entry::Occupied(_) => {
                error!(class = %class, "Conflicting handler registration rejected");
                Err(RegistryError::Conflict(class))
            }
            Entry::Vacant(slot) => {
                slot.insert(handler);
                info!(class = %class, "Handler registered");
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn is_registered(&self, class: EventClass) -> bool {
        self.handlers.contains_key(&class)
    }

    /// Callable that resolves the handler when invoked, not now.
    #[must_use]
    pub fn dispatch(&self, class: EventClass) -> Dispatcher {
        Dispatcher {
            class,
            handlers: Arc::clone(&self.handlers),
        }
    }
}

/// Late-bound handle to whatever is registered for one class.
#[derive(Clone)]
pub struct Dispatcher {
    class: EventClass,
    handlers: Handlers,
}

impl Dispatcher {
    #[must_use]
    pub fn class(&self) -> EventClass {
        self.class
    }

    pub async fn call(&self, envelope: EventEnvelope) -> Result<SyncOutcome, DispatchError> {
        // Clone out of the map so no shard lock is held across the await
        let handler = self
            .handlers
            .get(&self.class)
            .map(|h| Arc::clone(h.value()))
            .ok_or(DispatchError::NoHandler(self.class))?;
        Ok(handler.handle(envelope).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EventType;

    struct Fixed(SyncOutcome);

    #[async_trait]
    impl EventHandler for Fixed {
        async fn handle(&self, _envelope: EventEnvelope) -> Result<SyncOutcome, SyncError> {
            Ok(self.0)
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _envelope: EventEnvelope) -> Result<SyncOutcome, SyncError> {
            Err(SyncError::validation("missing id"))
        }
    }

    fn envelope() -> EventEnvelope {
        EventEnvelope::new(Origin::Sheet, EventType::Update, b"{}".to_vec())
    }

    #[tokio::test]
    async fn test_second_registration_never_replaces_first() {
        let registry = HandlerRegistry::new();
        registry
            .register(EventClass::SheetEdit, Arc::new(Fixed(SyncOutcome::Synced)))
            .unwrap();
        let err = registry
            .register(EventClass::SheetEdit, Arc::new(Fixed(SyncOutcome::Duplicate)))
            .unwrap_err();
        assert_eq!(err, RegistryError::Conflict(EventClass::SheetEdit));

        let out = registry.dispatch(EventClass::SheetEdit).call(envelope()).await.unwrap();
        assert_eq!(out, SyncOutcome::Synced);
    }

    #[tokio::test]
    async fn test_no_handler_is_distinct_condition() {
        let registry = HandlerRegistry::new();
        let dispatcher = registry.dispatch(EventClass::StructuredChange);
        assert!(matches!(
            dispatcher.call(envelope()).await,
            Err(DispatchError::NoHandler(EventClass::StructuredChange))
        ));
    }

    #[tokio::test]
    async fn test_dispatcher_resolves_at_call_time() {
        let registry = HandlerRegistry::new();
        let dispatcher = registry.dispatch(EventClass::StructuredChange);
        registry
            .register(EventClass::StructuredChange, Arc::new(Fixed(SyncOutcome::LoopSkipped)))
            .unwrap();
        assert_eq!(dispatcher.call(envelope()).await.unwrap(), SyncOutcome::LoopSkipped);
    }

    #[tokio::test]
    async fn test_handler_error_passes_through() {
        let registry = HandlerRegistry::new();
        registry.register(EventClass::SheetEdit, Arc::new(Failing)).unwrap();
        let err = registry.dispatch(EventClass::SheetEdit).call(envelope()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Handler(SyncError::Validation(_))));
    }

    #[test]
    fn test_class_for_origin() {
        assert_eq!(EventClass::for_origin(Origin::Sheet), EventClass::SheetEdit);
        assert!(!HandlerRegistry::new().is_registered(EventClass::SheetEdit));
    }
}
