// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record model shared by both sides of the sync.
//!
//! A [`CanonicalRecord`] is a schema-less map from case-normalized field names
//! to tagged [`CellValue`]s. The field set comes from whatever the sheet's
//! header row says today; there is no fixed schema.
//!
//! # Example
//!
//! ```
//! use sheet_sync::record::{CanonicalRecord, CellValue};
//! use serde_json::json;
//!
//! let record = CanonicalRecord::from_json(&json!({"Name": "Widget", "Price": 99, "note": ""})).unwrap();
//! assert_eq!(record.get("name"), Some(&CellValue::Text("Widget".into())));
//! assert_eq!(record.get("price"), Some(&CellValue::Number(99.0)));
//! assert!(record.get("note").unwrap().is_null());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::normalize::fields::{parse_number, parse_timestamp};

/// Which store produced an event (and which tag a written record carries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The structured record store (database side)
    Structured,
    /// The human-edited tabular store (sheet side)
    Sheet,
}

impl Origin {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "database",
            Self::Sheet => "sheet",
        }
    }

    #[must_use]
    pub fn counterpart(&self) -> Self {
        match self {
            Self::Structured => Self::Sheet,
            Self::Sheet => Self::Structured,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of change carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl EventType {
    /// Parse the webhook `type` field (case-insensitive).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// (table, primary id): the unit of locking, fingerprinting and row caching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub table: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.id)
    }
}

/// One inbound delivery, alive only for the duration of a request.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub origin: Origin,
    pub event_type: EventType,
    /// Exact request body bytes (dedupe hashes these, handlers parse them)
    pub payload: Vec<u8>,
    /// Relevant request headers, names lowercased
    pub headers: HashMap<String, String>,
}

impl EventEnvelope {
    pub fn new(origin: Origin, event_type: EventType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            origin,
            event_type,
            payload: payload.into(),
            headers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    #[must_use]
    pub fn idempotency_key(&self) -> Option<&str> {
        self.header("idempotency-key").filter(|k| !k.trim().is_empty())
    }
}

/// A typed, nullable cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Text(String),
    Number(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    /// Identifier-shaped string, stored lowercase
    Uuid(String),
    /// Objects and arrays from the structured side
    Json(Value),
}

impl CellValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Canonical string form, as written to a sheet cell; `None` for null.
    ///
    /// Numbers with no fractional part render without a decimal point, so the
    /// number `99` renders as `"99"`. Text is kept as written.
    #[must_use]
    pub fn canonical_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(s) => {
                let t = s.trim();
                if t.is_empty() {
                    None
                } else {
                    Some(t.to_string())
                }
            }
            Self::Number(n) => Some(format_number(*n)),
            Self::Bool(b) => Some(b.to_string()),
            Self::Timestamp(ts) => Some(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Self::Uuid(u) => Some(u.to_ascii_lowercase()),
            Self::Json(v) => serde_json::to_string(v).ok(),
        }
    }

    /// Form used when comparing values across sources.
    ///
    /// Like [`canonical_string`](Self::canonical_string), but text that reads
    /// as a number, timestamp or boolean takes that value's canonical form:
    /// `"19.50"` compares as `19.5`, `"…+00:00"` as `"…Z"`, `"TRUE"` as `true`.
    /// Cell text itself is never rewritten this way, so `"007"` stays `"007"`
    /// on the sheet.
    #[must_use]
    pub fn comparable_string(&self) -> Option<String> {
        let Self::Text(s) = self else {
            return self.canonical_string();
        };
        let t = s.trim();
        if t.is_empty() {
            return None;
        }
        if let Some(n) = parse_number(t) {
            return Some(format_number(n));
        }
        if let Some(ts) = parse_timestamp(t) {
            return Some(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true));
        }
        if t.eq_ignore_ascii_case("true") || t.eq_ignore_ascii_case("false") {
            return Some(t.to_ascii_lowercase());
        }
        Some(t.to_string())
    }

    /// Text written into a sheet cell. Null renders as an empty cell.
    #[must_use]
    pub fn render_cell(&self) -> String {
        self.canonical_string().unwrap_or_default()
    }

    /// Map a JSON value from the structured store. Empty strings become null.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n.as_f64().map_or(Self::Null, Self::Number),
            Value::String(s) if s.trim().is_empty() => Self::Null,
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Text(s) if s.trim().is_empty() => Value::Null,
            Self::Text(s) => Value::String(s.clone()),
            Self::Number(n) => serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
            Self::Bool(b) => Value::Bool(*b),
            Self::Timestamp(ts) => Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Self::Uuid(u) => Value::String(u.clone()),
            Self::Json(v) => v.clone(),
        }
    }

    /// Interpret as a point in time (epoch millis).
    ///
    /// Numbers above 10^11 are taken as milliseconds, smaller ones as seconds.
    #[must_use]
    pub fn as_timestamp_ms(&self) -> Option<i64> {
        match self {
            Self::Timestamp(ts) => Some(ts.timestamp_millis()),
            Self::Number(n) if n.is_finite() => {
                if n.abs() >= 1e11 {
                    Some(*n as i64)
                } else {
                    Some((*n * 1000.0) as i64)
                }
            }
            Self::Text(s) => parse_timestamp(s).map(|ts| ts.timestamp_millis()),
            _ => None,
        }
    }
}

/// Render a number without a trailing `.0` when it is integral.
#[must_use]
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Case-normalize a field or header name: trimmed, lowercase, separators as `_`.
#[must_use]
pub fn normalize_key(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c.to_ascii_lowercase() })
        .collect()
}

/// Error building a record from a non-object JSON value.
#[derive(Debug, thiserror::Error)]
#[error("record must be a JSON object, got {0}")]
pub struct NotAnObject(pub &'static str);

/// Schema-less typed record keyed by normalized field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalRecord {
    fields: BTreeMap<String, CellValue>,
}

impl CanonicalRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: CellValue) {
        let value = if value.is_null() { CellValue::Null } else { value };
        self.fields.insert(normalize_key(key), value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CellValue> {
        self.fields.get(&normalize_key(key))
    }

    pub fn remove(&mut self, key: &str) -> Option<CellValue> {
        self.fields.remove(&normalize_key(key))
    }

    /// True when the field is absent or null.
    #[must_use]
    pub fn is_null(&self, key: &str) -> bool {
        self.get(key).map_or(true, CellValue::is_null)
    }

    /// Canonical string of a field, if present and non-null.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(CellValue::canonical_string)
    }

    #[must_use]
    pub fn timestamp_ms(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(CellValue::as_timestamp_ms)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CellValue)> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn from_json(value: &Value) -> Result<Self, NotAnObject> {
        let obj = match value {
            Value::Object(obj) => obj,
            Value::Null => return Err(NotAnObject("null")),
            Value::Array(_) => return Err(NotAnObject("array")),
            _ => return Err(NotAnObject("scalar")),
        };
        let mut record = Self::new();
        for (k, v) in obj {
            record.insert(k, CellValue::from_json(v));
        }
        Ok(record)
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let obj: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Value::Object(obj)
    }
}

impl FromIterator<(String, CellValue)> for CanonicalRecord {
    fn from_iter<I: IntoIterator<Item = (String, CellValue)>>(iter: I) -> Self {
        let mut record = Self::new();
        for (k, v) in iter {
            record.insert(&k, v);
        }
        record
    }
}
