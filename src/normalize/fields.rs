//! Per-field validators keyed on header-name patterns.
//!
//! Every header maps to exactly one [`FieldRule`]; each rule is a pure
//! function from a raw cell to a [`CellValue`], discarding to null anything
//! that does not fit the field's shape.

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;

use crate::record::{normalize_key, CellValue};

/// Header shape → validation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    /// The primary id column
    PrimaryId,
    /// `*_id` columns: must be identifier-shaped
    ForeignKey,
    /// Fixed numeric set (price, amount, ...)
    Number,
    /// `is_*` / `has_*` flags
    Boolean,
    /// `*_at` / `*_date` columns and reserved time names
    Timestamp,
    /// Name/title: must not look like an id, timestamp or other token
    Name,
    /// Anything else, kept as text
    Plain,
}

/// Name patterns that select a [`FieldRule`].
#[derive(Debug, Clone)]
pub struct FieldRules {
    pub id_column: String,
    pub id_suffix: String,
    pub numeric_fields: HashSet<String>,
    pub boolean_prefixes: Vec<String>,
    pub timestamp_suffixes: Vec<String>,
    pub time_fields: HashSet<String>,
    pub name_fields: HashSet<String>,
}

impl Default for FieldRules {
    fn default() -> Self {
        Self::with_id_column("id")
    }
}

fn set_of(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl FieldRules {
    pub fn with_id_column(id_column: &str) -> Self {
        Self {
            id_column: normalize_key(id_column),
            id_suffix: "_id".into(),
            numeric_fields: set_of(&["price", "amount", "quantity", "sort_order", "total"]),
            boolean_prefixes: vec!["is_".into(), "has_".into()],
            timestamp_suffixes: vec!["_at".into(), "_date".into()],
            time_fields: set_of(&["created_at", "updated_at", "last_synced_at", "timestamp", "date"]),
            name_fields: set_of(&["name", "title", "display_name"]),
        }
    }

    /// Classify a header. Precedence: primary id, foreign key, numeric,
    /// boolean, timestamp, name, plain.
    #[must_use]
    pub fn classify(&self, header: &str) -> FieldRule {
        let h = normalize_key(header);
        if h == self.id_column {
            FieldRule::PrimaryId
        } else if h.ends_with(&self.id_suffix) {
            FieldRule::ForeignKey
        } else if self.numeric_fields.contains(&h) {
            FieldRule::Number
        } else if self.boolean_prefixes.iter().any(|p| h.starts_with(p.as_str())) {
            FieldRule::Boolean
        } else if self.time_fields.contains(&h) || self.timestamp_suffixes.iter().any(|s| h.ends_with(s.as_str())) {
            FieldRule::Timestamp
        } else if self.name_fields.contains(&h) {
            FieldRule::Name
        } else {
            FieldRule::Plain
        }
    }
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("identifier pattern is a valid regex")
    })
}

/// Hyphenated UUID shape.
#[must_use]
pub fn is_identifier(raw: &str) -> bool {
    identifier_regex().is_match(raw.trim())
}

/// RFC 3339, `YYYY-MM-DD[ T]HH:MM:SS[.f]`, `YYYY-MM-DD`, and the sheet's
/// `MM/DD/YYYY[ HH:MM:SS]` display formats. Naive values are taken as UTC.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.len() < 8 {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%m/%d/%Y %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
        }
    }
    None
}

/// Finite number, thousands separators allowed.
#[must_use]
pub fn parse_number(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let cleaned: String = s.chars().filter(|c| *c != ',').collect();
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

#[must_use]
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Token shapes that are never a legitimate name: ids, timestamps,
/// booleans, spreadsheet error values and origin tags.
#[must_use]
pub fn is_reserved_token(raw: &str) -> bool {
    let s = raw.trim();
    if is_identifier(s) || parse_timestamp(s).is_some() {
        return true;
    }
    matches!(
        s.to_ascii_lowercase().as_str(),
        "true" | "false" | "null" | "undefined" | "#n/a" | "#ref!" | "#value!" | "#error!" | "database" | "sheet"
    )
}

/// Result of applying a rule to one raw cell.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOutcome {
    pub value: CellValue,
    /// A non-empty cell was discarded because it failed the shape check
    pub rejected: bool,
}

impl FieldOutcome {
    fn keep(value: CellValue) -> Self {
        Self { value, rejected: false }
    }

    fn discard(raw: &str) -> Self {
        Self {
            value: CellValue::Null,
            rejected: !raw.trim().is_empty(),
        }
    }
}

/// Apply one rule to a raw cell.
#[must_use]
pub fn apply(rule: FieldRule, raw: &str) -> FieldOutcome {
    let s = raw.trim();
    if s.is_empty() {
        return FieldOutcome::keep(CellValue::Null);
    }
    match rule {
        FieldRule::PrimaryId | FieldRule::ForeignKey => {
            if is_identifier(s) {
                FieldOutcome::keep(CellValue::Uuid(s.to_ascii_lowercase()))
            } else {
                FieldOutcome::discard(s)
            }
        }
        FieldRule::Number => parse_number(s)
            .map(|n| FieldOutcome::keep(CellValue::Number(n)))
            .unwrap_or_else(|| FieldOutcome::discard(s)),
        FieldRule::Boolean => parse_bool(s)
            .map(|b| FieldOutcome::keep(CellValue::Bool(b)))
            .unwrap_or_else(|| FieldOutcome::discard(s)),
        FieldRule::Timestamp => parse_timestamp(s)
            .map(|ts| FieldOutcome::keep(CellValue::Timestamp(ts)))
            .unwrap_or_else(|| FieldOutcome::discard(s)),
        FieldRule::Name => {
            if is_reserved_token(s) {
                FieldOutcome::discard(s)
            } else {
                FieldOutcome::keep(CellValue::Text(s.to_string()))
            }
        }
        FieldRule::Plain => FieldOutcome::keep(CellValue::Text(s.to_string())),
    }
}
