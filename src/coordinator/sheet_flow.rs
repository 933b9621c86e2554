//! Sheet → structured store.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{resolve_conflict, ConflictDecision, SyncCoordinator, SyncOutcome, SyncState};
use crate::error::SyncError;
use crate::normalize::fields::parse_number;
use crate::record::{format_number, CanonicalRecord, CellValue, EntityKey, EventEnvelope, Origin};
use crate::storage::traits::{StructuredStore, TabularStore};

/// Edit notification body: `{table, row, timestamp, row_index?}`.
#[derive(Debug, Deserialize)]
struct SheetPayload {
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    row: Option<Vec<Value>>,
    #[serde(default)]
    timestamp: Option<Value>,
    /// 0-based data row the edit happened on, when the sheet sends it
    #[serde(default, alias = "rowIndex")]
    row_index: Option<usize>,
}

/// Cell text as the sheet displays it.
fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.as_f64().map(format_number).unwrap_or_else(|| n.to_string()),
        other => other.to_string(),
    }
}

/// Edit time from the payload: epoch seconds/millis or a date string.
fn edit_time(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => match parse_number(s) {
            Some(n) => CellValue::Number(n).as_timestamp_ms(),
            None => CellValue::Text(s.clone()).as_timestamp_ms(),
        },
        other => CellValue::from_json(other).as_timestamp_ms(),
    }
}

impl SyncCoordinator {
    pub(super) async fn sheet_event(&self, envelope: &EventEnvelope) -> Result<SyncOutcome, SyncError> {
        let payload: SheetPayload = serde_json::from_slice(&envelope.payload)
            .map_err(|e| SyncError::validation(format!("malformed edit payload: {}", e)))?;
        let table = payload
            .table
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::validation("edit payload has no table"))?
            .to_string();
        let row: Vec<String> = payload
            .row
            .as_deref()
            .ok_or_else(|| SyncError::validation("edit payload has no row"))?
            .iter()
            .map(cell_text)
            .collect();

        let (headers, _) = self.headers_with_id(&table).await?;
        let normalized = self.normalizer.to_record(&row, &headers);
        let id = normalized
            .id
            .clone()
            .ok_or_else(|| SyncError::validation(format!("row has no '{}'", self.normalizer.id_column())))?;
        let entity = EntityKey::new(table, id);

        let Some(lock) = self.try_lock(&entity).await else {
            self.transition(&entity, SyncState::LockedOut);
            info!(entity = %entity, "Entity busy, burst protected");
            return Ok(SyncOutcome::BurstProtected);
        };
        let incoming = payload.timestamp.as_ref().and_then(edit_time);
        let result = self
            .sheet_locked(&entity, &headers, normalized.record, normalized.misaligned, incoming, payload.row_index)
            .await;
        if result.is_err() {
            self.transition(&entity, SyncState::Failed);
        }
        self.release(lock).await;
        result
    }

    async fn sheet_locked(
        &self,
        entity: &EntityKey,
        headers: &[String],
        mut record: CanonicalRecord,
        misaligned_now: bool,
        incoming: Option<i64>,
        row_index: Option<usize>,
    ) -> Result<SyncOutcome, SyncError> {
        self.transition(entity, SyncState::Normalizing);
        self.validate_relation(entity, &mut record).await;
        if misaligned_now {
            self.flag_misaligned(entity).await;
        }

        self.transition(entity, SyncState::LoopCheck);
        let forced = self.take_misaligned(entity).await;
        let fingerprint = self.fingerprint_for(&record, headers);
        if forced {
            warn!(entity = %entity, "Row misaligned, forcing write and sheet rewrite");
        } else if self.stored_fingerprint(entity).await.as_deref() == Some(fingerprint.as_str()) {
            debug!(entity = %entity, "Fingerprint unchanged, skipping");
            self.transition(entity, SyncState::Dropped);
            return Ok(SyncOutcome::LoopSkipped);
        }

        self.transition(entity, SyncState::ConflictCheck);
        let now = self.now_ms();
        let incoming = incoming.unwrap_or(now);
        let stored = self.records.select_by_id(&entity.table, &entity.id).await?;
        let structured_updated = stored.as_ref().and_then(|s| {
            let from_sheet = s
                .text(&self.config.origin_field)
                .is_some_and(|o| o.eq_ignore_ascii_case(Origin::Sheet.as_str()));
            if from_sheet {
                None
            } else {
                s.timestamp_ms("updated_at")
            }
        });
        let counterpart = self.sync_time(Origin::Structured, entity).await.max(structured_updated);
        if let ConflictDecision::Stale { incoming_ms, stored_ms } =
            resolve_conflict(incoming, counterpart, self.tolerance_ms())
        {
            warn!(entity = %entity, incoming_ms, stored_ms, "Structured store holds a newer change, dropping edit");
            self.transition(entity, SyncState::Dropped);
            return Ok(SyncOutcome::Conflict);
        }

        self.transition(entity, SyncState::Writing);
        // Fields the sheet does not show survive the upsert
        let mut merged = stored.unwrap_or_default();
        for (key, value) in record.iter() {
            merged.insert(key, value.clone());
        }
        merged.insert(&self.config.origin_field, CellValue::Text(Origin::Sheet.as_str().into()));
        merged.insert(
            &self.config.last_synced_field,
            CellValue::Timestamp(chrono::DateTime::from_timestamp_millis(now).unwrap_or_default()),
        );
        self.records.upsert(&entity.table, &entity.id, &merged).await?;
        if let Some(row) = row_index {
            self.rows.remember(&entity.table, &entity.id, row).await;
        }

        if forced {
            self.heal_row(entity, headers, &merged, row_index).await?;
        }

        self.store_fingerprint(entity, &fingerprint).await;
        self.record_sync_time(Origin::Sheet, entity, incoming).await;
        self.transition(entity, SyncState::Done);
        info!(entity = %entity, "Synced to structured store");
        Ok(SyncOutcome::Synced)
    }

    /// Rewrite the sheet row from the repaired record.
    async fn heal_row(
        &self,
        entity: &EntityKey,
        headers: &[String],
        record: &CanonicalRecord,
        row_index: Option<usize>,
    ) -> Result<(), SyncError> {
        let row = match row_index {
            Some(row) => Some(row),
            None => {
                let id_col = self.normalizer.id_column_index(headers).unwrap_or_default();
                self.rows
                    .resolve(self.sheet.as_ref(), &entity.table, &entity.id, id_col)
                    .await?
                    .row()
            }
        };
        let Some(row) = row else {
            warn!(entity = %entity, "Misaligned row could not be located, sheet left as is");
            return Ok(());
        };
        let cells = self.normalizer.to_row(record, headers);
        self.sheet.write_row(&entity.table, row, &cells).await?;
        crate::metrics::record_self_heal(&entity.table);
        info!(entity = %entity, row, "Misaligned sheet row rewritten");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cell_text_renders_like_the_sheet() {
        assert_eq!(cell_text(&json!(null)), "");
        assert_eq!(cell_text(&json!("Lamp")), "Lamp");
        assert_eq!(cell_text(&json!(19)), "19");
        assert_eq!(cell_text(&json!(19.5)), "19.5");
        assert_eq!(cell_text(&json!(true)), "true");
    }

    #[test]
    fn test_edit_time_accepts_millis_seconds_and_dates() {
        assert_eq!(edit_time(&json!(1_700_000_000_000_i64)), Some(1_700_000_000_000));
        assert_eq!(edit_time(&json!(1_700_000_000)), Some(1_700_000_000_000));
        assert_eq!(edit_time(&json!("1700000000000")), Some(1_700_000_000_000));
        assert_eq!(edit_time(&json!("2023-11-14T22:13:20Z")), Some(1_700_000_000_000));
        assert_eq!(edit_time(&json!("not a date")), None);
    }
}
