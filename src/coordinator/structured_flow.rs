//! Structured store → sheet.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{resolve_conflict, ConflictDecision, SyncCoordinator, SyncOutcome, SyncState};
use crate::error::SyncError;
use crate::record::{CanonicalRecord, CellValue, EntityKey, EventEnvelope, EventType, Origin};
use crate::row_cache::RowLookup;
use crate::storage::traits::TabularStore;

/// Change notification body: `{type, table, record, old_record}`.
#[derive(Debug, Deserialize)]
struct StructuredPayload {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

/// Parsed, validated change.
struct StructuredChange {
    event_type: EventType,
    entity: EntityKey,
    record: CanonicalRecord,
}

impl SyncCoordinator {
    fn parse_structured(&self, envelope: &EventEnvelope) -> Result<StructuredChange, SyncError> {
        let payload: StructuredPayload = serde_json::from_slice(&envelope.payload)
            .map_err(|e| SyncError::validation(format!("malformed change payload: {}", e)))?;

        let event_type = match payload.kind.as_deref() {
            Some(raw) => EventType::parse(raw)
                .ok_or_else(|| SyncError::validation(format!("unknown change type '{}'", raw)))?,
            None => envelope.event_type,
        };
        let table = payload
            .table
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| SyncError::validation("change payload has no table"))?;

        // Deletes describe the row that was removed
        let body = match event_type {
            EventType::Delete => payload.old_record.or(payload.record),
            _ => payload.record,
        };
        let body = body.ok_or_else(|| SyncError::validation("change payload has no record"))?;
        let record =
            CanonicalRecord::from_json(&body).map_err(|_| SyncError::validation("record is not an object"))?;

        let id = record
            .text(self.normalizer.id_column())
            .ok_or_else(|| SyncError::validation(format!("record has no '{}'", self.normalizer.id_column())))?;

        Ok(StructuredChange {
            event_type,
            entity: EntityKey::new(table, id.to_ascii_lowercase()),
            record,
        })
    }

    pub(super) async fn structured_event(&self, envelope: &EventEnvelope) -> Result<SyncOutcome, SyncError> {
        let change = self.parse_structured(envelope)?;

        let Some(lock) = self.try_lock(&change.entity).await else {
            self.transition(&change.entity, SyncState::LockedOut);
            info!(entity = %change.entity, "Entity busy, burst protected");
            return Ok(SyncOutcome::BurstProtected);
        };
        let result = match change.event_type {
            EventType::Delete => self.structured_delete(&change).await,
            EventType::Insert | EventType::Update => self.structured_upsert(&change).await,
        };
        if result.is_err() {
            self.transition(&change.entity, SyncState::Failed);
        }
        self.release(lock).await;
        result
    }

    /// The change is our own sheet write coming back: tagged with the sheet
    /// origin and not touched since the sync stamped it.
    fn is_sheet_echo(&self, record: &CanonicalRecord) -> bool {
        let tagged = record
            .text(&self.config.origin_field)
            .is_some_and(|o| o.eq_ignore_ascii_case(Origin::Sheet.as_str()));
        if !tagged {
            return false;
        }
        match (
            record.timestamp_ms("updated_at"),
            record.timestamp_ms(&self.config.last_synced_field),
        ) {
            (Some(updated), Some(synced)) => updated <= synced + self.tolerance_ms(),
            _ => true,
        }
    }

    async fn structured_upsert(&self, change: &StructuredChange) -> Result<SyncOutcome, SyncError> {
        let entity = &change.entity;
        let record = &change.record;

        self.transition(entity, SyncState::Normalizing);
        let (headers, id_col) = self.headers_with_id(&entity.table).await?;

        self.transition(entity, SyncState::LoopCheck);
        let fingerprint = self.fingerprint_for(record, &headers);
        if self.is_sheet_echo(record) {
            debug!(entity = %entity, "Origin tag is sheet, skipping echo");
            self.transition(entity, SyncState::Dropped);
            return Ok(SyncOutcome::LoopSkipped);
        }
        if self.stored_fingerprint(entity).await.as_deref() == Some(fingerprint.as_str()) {
            debug!(entity = %entity, "Fingerprint unchanged, skipping");
            self.transition(entity, SyncState::Dropped);
            return Ok(SyncOutcome::LoopSkipped);
        }

        self.transition(entity, SyncState::ConflictCheck);
        let now = self.now_ms();
        let incoming = record
            .timestamp_ms("updated_at")
            .or_else(|| record.timestamp_ms(&self.config.last_synced_field))
            .unwrap_or(now);
        let stored = self.sync_time(Origin::Sheet, entity).await;
        if let ConflictDecision::Stale { incoming_ms, stored_ms } =
            resolve_conflict(incoming, stored, self.tolerance_ms())
        {
            warn!(entity = %entity, incoming_ms, stored_ms, "Sheet holds a newer edit, dropping change");
            self.transition(entity, SyncState::Dropped);
            return Ok(SyncOutcome::Conflict);
        }

        self.transition(entity, SyncState::Writing);
        let mut rendered = record.clone();
        rendered.insert(&self.config.origin_field, CellValue::Text(Origin::Structured.as_str().into()));
        rendered.insert(
            &self.config.last_synced_field,
            CellValue::Timestamp(chrono::DateTime::from_timestamp_millis(now).unwrap_or_default()),
        );
        let cells = self.normalizer.to_row(&rendered, &headers);

        let lookup = self.rows.resolve(self.sheet.as_ref(), &entity.table, &entity.id, id_col).await?;
        match lookup.row() {
            Some(row) => {
                self.sheet.write_row(&entity.table, row, &cells).await?;
                debug!(entity = %entity, row, "Sheet row updated");
            }
            None => {
                let row = self.sheet.append_row(&entity.table, &cells).await?;
                self.rows.remember(&entity.table, &entity.id, row).await;
                debug!(entity = %entity, row, "Sheet row appended");
            }
        }

        self.store_fingerprint(entity, &fingerprint).await;
        self.record_sync_time(Origin::Structured, entity, incoming).await;
        self.transition(entity, SyncState::Done);
        info!(entity = %entity, "Synced to sheet");
        Ok(SyncOutcome::Synced)
    }

    async fn structured_delete(&self, change: &StructuredChange) -> Result<SyncOutcome, SyncError> {
        let entity = &change.entity;
        self.transition(entity, SyncState::Normalizing);
        let (_, id_col) = self.headers_with_id(&entity.table).await?;

        self.transition(entity, SyncState::Writing);
        match self.rows.resolve(self.sheet.as_ref(), &entity.table, &entity.id, id_col).await? {
            RowLookup::Verified(row) | RowLookup::Relocated(row) => {
                self.sheet.clear_row(&entity.table, row).await?;
                info!(entity = %entity, row, "Sheet row cleared");
            }
            RowLookup::NotFound => debug!(entity = %entity, "Deleted record has no sheet row"),
        }
        self.rows.invalidate(&entity.table, &entity.id).await;
        self.forget_fingerprint(entity).await;
        self.record_sync_time(Origin::Structured, entity, self.now_ms()).await;
        self.transition(entity, SyncState::Done);
        Ok(SyncOutcome::Synced)
    }
}
