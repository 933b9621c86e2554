//! Registry bindings for the two webhook classes.

use std::sync::Arc;

use async_trait::async_trait;

use super::{SyncCoordinator, SyncOutcome};
use crate::error::SyncError;
use crate::record::EventEnvelope;
use crate::registry::EventHandler;

pub struct StructuredChangeHandler {
    coordinator: Arc<SyncCoordinator>,
}

impl StructuredChangeHandler {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl EventHandler for StructuredChangeHandler {
    async fn handle(&self, envelope: EventEnvelope) -> Result<SyncOutcome, SyncError> {
        self.coordinator.handle_structured(&envelope).await
    }
}

pub struct SheetEditHandler {
    coordinator: Arc<SyncCoordinator>,
}

impl SheetEditHandler {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl EventHandler for SheetEditHandler {
    async fn handle(&self, envelope: EventEnvelope) -> Result<SyncOutcome, SyncError> {
        self.coordinator.handle_sheet(&envelope).await
    }
}
