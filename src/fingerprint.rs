//! Content fingerprints over a record's business fields.
//!
//! Metadata fields (sync timestamp, creation/update timestamps, origin tag)
//! never contribute, and null fields are skipped, so a field that is absent
//! and a field that is empty hash the same. Values are hashed by their
//! comparable form, so the number `19.5` and the texts `"19.5"` and `"19.50"`
//! are indistinguishable, as are `"…+00:00"` and `"…Z"` timestamps.

use sha2::{Digest, Sha256};

use crate::record::{normalize_key, CanonicalRecord};

/// Fields excluded from every fingerprint.
pub const METADATA_FIELDS: &[&str] = &["last_synced_at", "created_at", "updated_at", "sync_origin"];

/// Hex-encoded SHA-256 fingerprint (64 chars).
pub type Fingerprint = String;

#[derive(Debug, Clone)]
pub struct FingerprintService {
    metadata: Vec<String>,
}

impl Default for FingerprintService {
    fn default() -> Self {
        Self {
            metadata: METADATA_FIELDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl FingerprintService {
    /// Also exclude the configured origin/sync-timestamp field names.
    pub fn with_metadata<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut service = Self::default();
        for field in extra {
            let field = normalize_key(field.as_ref());
            if !service.metadata.contains(&field) {
                service.metadata.push(field);
            }
        }
        service
    }

    #[must_use]
    pub fn is_metadata(&self, field: &str) -> bool {
        let field = normalize_key(field);
        self.metadata.iter().any(|m| *m == field)
    }

    /// Fingerprint `record`, restricted to `allow` when given.
    #[must_use]
    pub fn fingerprint(&self, record: &CanonicalRecord, allow: Option<&[&str]>) -> Fingerprint {
        let allow: Option<Vec<String>> = allow.map(|fields| fields.iter().map(|f| normalize_key(f)).collect());

        // CanonicalRecord iterates in key order; the allow-list only filters
        let mut hasher = Sha256::new();
        for (key, value) in record.iter() {
            if self.is_metadata(key) {
                continue;
            }
            if let Some(allow) = &allow {
                if !allow.contains(key) {
                    continue;
                }
            }
            let Some(canonical) = value.comparable_string() else {
                continue;
            };
            // Length-prefixed so ("ab","c") and ("a","bc") differ
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(key.as_bytes());
            hasher.update((canonical.len() as u64).to_be_bytes());
            hasher.update(canonical.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CellValue;
    use serde_json::json;

    fn record(value: serde_json::Value) -> CanonicalRecord {
        CanonicalRecord::from_json(&value).unwrap()
    }

    #[test]
    fn test_number_and_string_forms_match() {
        let fp = FingerprintService::default();
        let a = record(json!({"name": "Lamp", "price": 99}));
        let b = record(json!({"price": "99", "name": "Lamp"}));
        assert_eq!(fp.fingerprint(&a, None), fp.fingerprint(&b, None));
    }

    #[test]
    fn test_numerically_equal_text_matches_number() {
        let fp = FingerprintService::default();
        let pairs = [
            (json!({"price": "19.50"}), json!({"price": 19.5})),
            (json!({"price": "99.0"}), json!({"price": 99})),
            (json!({"price": "1,000"}), json!({"price": 1000})),
            (
                json!({"published_at": "2024-01-05T10:00:00+00:00"}),
                json!({"published_at": "2024-01-05T10:00:00Z"}),
            ),
        ];
        for (a, b) in pairs {
            assert_eq!(fp.fingerprint(&record(a.clone()), None), fp.fingerprint(&record(b), None), "{a}");
        }
    }

    #[test]
    fn test_sheet_echo_of_text_typed_record_matches() {
        use crate::normalize::RecordNormalizer;

        // Numeric and timestamptz columns often arrive from the database as strings
        let stored = record(json!({
            "id": "3f2b8c1e-9d4a-4b6e-8f1a-2c3d4e5f6a7b",
            "price": "19.50",
            "published_at": "2024-01-05T10:00:00+00:00",
        }));
        let headers: Vec<String> = ["id", "price", "published_at"].iter().map(|s| s.to_string()).collect();
        let allow: Vec<&str> = headers.iter().map(String::as_str).collect();

        let normalizer = RecordNormalizer::default();
        let echoed = normalizer.to_record(&normalizer.to_row(&stored, &headers), &headers).record;

        let fp = FingerprintService::default();
        assert_eq!(
            fp.fingerprint(&stored, Some(allow.as_slice())),
            fp.fingerprint(&echoed, Some(allow.as_slice()))
        );
    }

    #[test]
    fn test_metadata_is_ignored() {
        let fp = FingerprintService::default();
        let a = record(json!({"name": "Lamp", "updated_at": "2024-01-01T00:00:00Z", "sync_origin": "sheet"}));
        let b = record(json!({"name": "Lamp", "last_synced_at": 1700000000000_i64, "created_at": "x"}));
        assert_eq!(fp.fingerprint(&a, None), fp.fingerprint(&b, None));
    }

    #[test]
    fn test_business_change_changes_fingerprint() {
        let fp = FingerprintService::default();
        let a = record(json!({"name": "Lamp", "price": 99}));
        let b = record(json!({"name": "Lamp", "price": 98}));
        assert_ne!(fp.fingerprint(&a, None), fp.fingerprint(&b, None));
    }

    #[test]
    fn test_null_and_absent_are_equivalent() {
        let fp = FingerprintService::default();
        let a = record(json!({"name": "Lamp", "notes": null}));
        let mut b = record(json!({"name": "Lamp"}));
        assert_eq!(fp.fingerprint(&a, None), fp.fingerprint(&b, None));
        b.insert("notes", CellValue::Text("   ".into()));
        assert_eq!(fp.fingerprint(&a, None), fp.fingerprint(&b, None));
    }

    #[test]
    fn test_allow_list_restricts_fields() {
        let fp = FingerprintService::default();
        let a = record(json!({"name": "Lamp", "stock": 1}));
        let b = record(json!({"name": "Lamp", "stock": 7}));
        assert_eq!(fp.fingerprint(&a, Some(&["Name"])), fp.fingerprint(&b, Some(&["Name"])));
        assert_ne!(fp.fingerprint(&a, None), fp.fingerprint(&b, None));
    }

    #[test]
    fn test_custom_metadata_fields() {
        let fp = FingerprintService::with_metadata(["Synced By"]);
        assert!(fp.is_metadata("synced_by"));
        let a = record(json!({"name": "Lamp", "synced_by": "job-1"}));
        let b = record(json!({"name": "Lamp", "synced_by": "job-2"}));
        assert_eq!(fp.fingerprint(&a, None), fp.fingerprint(&b, None));
        assert_eq!(fp.fingerprint(&a, None).len(), 64);
    }
}
