//! Best-effort repair of rows whose columns drifted out of alignment.
//!
//! Bulk paste and drag operations in the sheet routinely shift cells one or
//! more columns sideways. After direct mapping, a [`RecoveryStrategy`] may
//! adopt a value for a still-null required field from some other cell of the
//! *same row*. Strategies only ever pick existing cells; they never invent
//! values.

use super::fields::{is_identifier, is_reserved_token, parse_number, FieldRule};
use crate::record::CellValue;

/// Shape a required field is recovered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredKind {
    /// Free text that is not an id, number, timestamp or reserved token
    Name,
    /// First positive, non-boolean number
    Price,
    /// First identifier that is not the record's own id
    ForeignKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredField {
    pub field: String,
    pub kind: RequiredKind,
}

impl RequiredField {
    pub fn new(field: &str, kind: RequiredKind) -> Self {
        Self {
            field: crate::record::normalize_key(field),
            kind,
        }
    }
}

/// A value adopted from a cell other than the field's own column.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    pub field: String,
    /// Source column (0-based; may lie past the last header)
    pub column: usize,
    pub value: CellValue,
}

/// A raw row plus bookkeeping of which cells direct mapping already used.
pub struct RowCells<'a> {
    cells: &'a [String],
    consumed: Vec<bool>,
    rules: Vec<Option<FieldRule>>,
}

impl<'a> RowCells<'a> {
    /// `rules[i]` is the rule of header `i`; cells past the header row have none.
    pub fn new(cells: &'a [String], rules: Vec<Option<FieldRule>>) -> Self {
        Self {
            cells,
            consumed: vec![false; cells.len()],
            rules,
        }
    }

    pub fn consume(&mut self, column: usize) {
        if let Some(flag) = self.consumed.get_mut(column) {
            *flag = true;
        }
    }

    #[must_use]
    pub fn is_consumed(&self, column: usize) -> bool {
        self.consumed.get(column).copied().unwrap_or(false)
    }

    fn rule(&self, column: usize) -> Option<FieldRule> {
        self.rules.get(column).copied().flatten()
    }

    /// Every non-empty cell, trimmed, with its column.
    pub fn all(&self) -> impl Iterator<Item = (usize, &'a str)> + '_ {
        self.cells
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.trim()))
            .filter(|(_, c)| !c.is_empty())
    }

    /// Non-empty cells that direct mapping did not use.
    pub fn free(&self) -> impl Iterator<Item = (usize, &'a str)> + '_ {
        self.all().filter(|(i, _)| !self.is_consumed(*i))
    }
}

pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Find a primary id when the id column is empty or malformed.
    fn recover_id(&self, row: &RowCells<'_>) -> Option<Recovery>;

    /// Fill a required field that direct mapping left null.
    fn recover_field(&self, target: &RequiredField, row: &RowCells<'_>, primary_id: Option<&str>) -> Option<Recovery>;
}

/// Adopts the first plausible cell. Id recovery scans the whole row,
/// preferring columns that are not foreign keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedyRecovery;

impl GreedyRecovery {
    fn is_plausible_name(raw: &str) -> bool {
        !is_reserved_token(raw) && parse_number(raw).is_none()
    }

    fn is_plausible_price(raw: &str) -> Option<f64> {
        if matches!(raw.to_ascii_lowercase().as_str(), "0" | "1" | "true" | "false") {
            return None;
        }
        parse_number(raw).filter(|n| *n > 0.0)
    }
}

impl RecoveryStrategy for GreedyRecovery {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn recover_id(&self, row: &RowCells<'_>) -> Option<Recovery> {
        let is_fk = |i: usize| row.rule(i) == Some(FieldRule::ForeignKey);
        let pick = |want_fk: bool| {
            row.all()
                .find(|(i, c)| is_fk(*i) == want_fk && is_identifier(c))
                .map(|(column, c)| (column, c.to_ascii_lowercase()))
        };
        let (column, id) = pick(false).or_else(|| pick(true))?;
        Some(Recovery {
            field: String::new(),
            column,
            value: CellValue::Uuid(id),
        })
    }

    fn recover_field(&self, target: &RequiredField, row: &RowCells<'_>, primary_id: Option<&str>) -> Option<Recovery> {
        let found = match target.kind {
            RequiredKind::Name => row
                .free()
                .find(|(_, c)| Self::is_plausible_name(c))
                .map(|(i, c)| (i, CellValue::Text(c.to_string()))),
            RequiredKind::Price => row
                .free()
                .find_map(|(i, c)| Self::is_plausible_price(c).map(|n| (i, CellValue::Number(n)))),
            RequiredKind::ForeignKey => row
                .free()
                .filter(|(_, c)| is_identifier(c))
                .map(|(i, c)| (i, c.to_ascii_lowercase()))
                .find(|(_, c)| primary_id != Some(c.as_str()))
                .map(|(i, c)| (i, CellValue::Uuid(c))),
        };
        found.map(|(column, value)| Recovery {
            field: target.field.clone(),
            column,
            value,
        })
    }
}

/// Strict mode: nothing is ever recovered.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRecovery;

impl RecoveryStrategy for NoRecovery {
    fn name(&self) -> &'static str {
        "none"
    }

    fn recover_id(&self, _row: &RowCells<'_>) -> Option<Recovery> {
        None
    }

    fn recover_field(&self, _target: &RequiredField, _row: &RowCells<'_>, _primary_id: Option<&str>) -> Option<Recovery> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "3f2b8c1e-9d4a-4b6e-8f1a-2c3d4e5f6a7b";
    const OTHER: &str = "11111111-2222-4333-8444-555555555555";

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_id_recovery_prefers_non_foreign_key_columns() {
        let raw = cells(&["", OTHER, ID]);
        let rules = vec![Some(FieldRule::PrimaryId), Some(FieldRule::ForeignKey), Some(FieldRule::Plain)];
        let row = RowCells::new(&raw, rules);

        let rec = GreedyRecovery.recover_id(&row).unwrap();
        assert_eq!(rec.column, 2);
        assert_eq!(rec.value, CellValue::Uuid(ID.into()));
    }

    #[test]
    fn test_id_recovery_falls_back_to_foreign_key_column() {
        let raw = cells(&["garbage", OTHER]);
        let row = RowCells::new(&raw, vec![Some(FieldRule::PrimaryId), Some(FieldRule::ForeignKey)]);
        assert_eq!(GreedyRecovery.recover_id(&row).unwrap().column, 1);
    }

    #[test]
    fn test_name_skips_tokens_numbers_and_consumed_cells() {
        let raw = cells(&["Taken", ID, "2024-01-05", "42", "TRUE", "Blue Lamp"]);
        let mut row = RowCells::new(&raw, vec![Some(FieldRule::Plain)]);
        row.consume(0);
        let target = RequiredField::new("name", RequiredKind::Name);

        let rec = GreedyRecovery.recover_field(&target, &row, None).unwrap();
        assert_eq!(rec.column, 5);
        assert_eq!(rec.value, CellValue::Text("Blue Lamp".into()));
    }

    #[test]
    fn test_price_skips_boolean_like_numbers() {
        let raw = cells(&["1", "0", "-4", "19.99"]);
        let row = RowCells::new(&raw, vec![]);
        let target = RequiredField::new("price", RequiredKind::Price);
        let rec = GreedyRecovery.recover_field(&target, &row, None).unwrap();
        assert_eq!(rec.value, CellValue::Number(19.99));
    }

    #[test]
    fn test_foreign_key_never_adopts_own_id() {
        let raw = cells(&[&ID.to_uppercase(), OTHER]);
        let row = RowCells::new(&raw, vec![]);
        let target = RequiredField::new("Category ID", RequiredKind::ForeignKey);
        let rec = GreedyRecovery.recover_field(&target, &row, Some(ID)).unwrap();
        assert_eq!(rec.field, "category_id");
        assert_eq!(rec.value, CellValue::Uuid(OTHER.into()));
    }

    #[test]
    fn test_nothing_plausible_recovers_nothing() {
        let raw = cells(&["", "TRUE", "0"]);
        let row = RowCells::new(&raw, vec![]);
        for kind in [RequiredKind::Name, RequiredKind::Price, RequiredKind::ForeignKey] {
            let target = RequiredField::new("x", kind);
            assert!(GreedyRecovery.recover_field(&target, &row, None).is_none());
        }
        assert!(GreedyRecovery.recover_id(&row).is_none());
    }

    #[test]
    fn test_strict_strategy_is_inert() {
        let raw = cells(&[ID, "Lamp", "5"]);
        let row = RowCells::new(&raw, vec![]);
        assert!(NoRecovery.recover_id(&row).is_none());
        let target = RequiredField::new("name", RequiredKind::Name);
        assert!(NoRecovery.recover_field(&target, &row, None).is_none());
    }
}
