// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record normalizer: sheet rows ⇄ canonical records.
//!
//! # Sheet → record
//!
//! ```text
//! raw row ──► per-header FieldRule ──► typed CellValue (or null)
//!                    │
//!                    ├─ id column malformed ──► misaligned = true
//!                    ▼
//!         id still null? ──► strategy.recover_id (whole row)
//!                    ▼
//!   required field null? ──► strategy.recover_field (unused cells only)
//! ```
//!
//! The `misaligned` flag is raised whenever an identifier-named column held
//! something that is not an identifier. The orchestrator uses it to force a
//! rewrite of the sheet row even when the fingerprint is unchanged.
//!
//! # Record → sheet
//!
//! [`RecordNormalizer::to_row`] renders each header's field in canonical
//! text form; missing fields render as empty cells.

pub mod fields;
pub mod recovery;

use std::sync::Arc;

use tracing::warn;

use crate::config::SheetSyncConfig;
use crate::record::{normalize_key, CanonicalRecord, CellValue};
use fields::{FieldRule, FieldRules};
use recovery::{GreedyRecovery, NoRecovery, Recovery, RecoveryStrategy, RequiredField, RequiredKind, RowCells};

/// Outcome of mapping one sheet row.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub record: CanonicalRecord,
    /// Primary id, lowercase; `None` if neither the id column nor recovery produced one
    pub id: Option<String>,
    /// An identifier-named column failed its shape check
    pub misaligned: bool,
    pub recoveries: Vec<Recovery>,
}

pub struct RecordNormalizer {
    rules: FieldRules,
    required: Vec<RequiredField>,
    strategy: Arc<dyn RecoveryStrategy>,
}

impl Default for RecordNormalizer {
    fn default() -> Self {
        Self::new(FieldRules::default())
    }
}

impl RecordNormalizer {
    /// Greedy recovery, with `name` and `price` as required fields.
    pub fn new(rules: FieldRules) -> Self {
        Self {
            rules,
            required: vec![
                RequiredField::new("name", RequiredKind::Name),
                RequiredField::new("price", RequiredKind::Price),
            ],
            strategy: Arc::new(GreedyRecovery),
        }
    }

    pub fn from_config(config: &SheetSyncConfig) -> Self {
        let mut normalizer = Self::new(FieldRules::with_id_column(&config.id_column));
        if let Some(relation) = &config.relation {
            normalizer = normalizer.with_required(&relation.field, RequiredKind::ForeignKey);
        }
        if !config.greedy_recovery {
            normalizer = normalizer.with_strategy(Arc::new(NoRecovery));
        }
        normalizer
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_required(mut self, field: &str, kind: RequiredKind) -> Self {
        let required = RequiredField::new(field, kind);
        self.required.retain(|r| r.field != required.field);
        self.required.push(required);
        self
    }

    #[must_use]
    pub fn rules(&self) -> &FieldRules {
        &self.rules
    }

    #[must_use]
    pub fn id_column(&self) -> &str {
        &self.rules.id_column
    }

    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Position of the primary id column in `headers`.
    #[must_use]
    pub fn id_column_index(&self, headers: &[String]) -> Option<usize> {
        headers.iter().position(|h| normalize_key(h) == self.rules.id_column)
    }

    /// Render `record` as a row aligned to `headers`.
    #[must_use]
    pub fn to_row(&self, record: &CanonicalRecord, headers: &[String]) -> Vec<String> {
        headers
            .iter()
            .map(|h| {
                if h.trim().is_empty() {
                    return String::new();
                }
                record.get(h).map(CellValue::render_cell).unwrap_or_default()
            })
            .collect()
    }

    /// Map a raw sheet row into a canonical record with type repair.
    pub fn to_record(&self, row: &[String], headers: &[String]) -> NormalizedRow {
        let keys: Vec<String> = headers.iter().map(|h| normalize_key(h)).collect();
        let rules: Vec<Option<FieldRule>> = keys
            .iter()
            .map(|k| (!k.is_empty()).then(|| self.rules.classify(k)))
            .collect();

        let mut cells = RowCells::new(row, rules.clone());
        let mut record = CanonicalRecord::new();
        let mut misaligned = false;

        for (column, (key, rule)) in keys.iter().zip(&rules).enumerate() {
            let Some(rule) = rule else { continue };
            let raw = row.get(column).map(String::as_str).unwrap_or("");
            let outcome = fields::apply(*rule, raw);
            if outcome.rejected && matches!(rule, FieldRule::PrimaryId | FieldRule::ForeignKey) {
                warn!(field = %key, column, value = raw, "Identifier column holds a non-identifier, row looks shifted");
                misaligned = true;
            }
            if !outcome.value.is_null() {
                cells.consume(column);
            }
            record.insert(key, outcome.value);
        }

        let mut recoveries = Vec::new();
        let id_key = self.rules.id_column.clone();

        let mut id = record.text(&id_key);
        if id.is_none() {
            if let Some(mut found) = self.strategy.recover_id(&cells) {
                found.field = id_key.clone();
                self.log_recovery(&found);
                cells.consume(found.column);
                id = found.value.canonical_string();
                record.insert(&id_key, found.value.clone());
                recoveries.push(found);
            }
        }

        for target in &self.required {
            let present = keys.iter().any(|k| *k == target.field);
            if !present || !record.is_null(&target.field) {
                continue;
            }
            if let Some(found) = self.strategy.recover_field(target, &cells, id.as_deref()) {
                self.log_recovery(&found);
                cells.consume(found.column);
                record.insert(&target.field, found.value.clone());
                recoveries.push(found);
            }
        }

        NormalizedRow {
            record,
            id,
            misaligned,
            recoveries,
        }
    }

    fn log_recovery(&self, recovery: &Recovery) {
        warn!(
            strategy = self.strategy.name(),
            field = %recovery.field,
            column = recovery.column,
            value = %recovery.value.render_cell(),
            "Recovered field from another column"
        );
        crate::metrics::record_recovery(&recovery.field);
    }
}
