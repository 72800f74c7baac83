//! Canonical, order-stable serialization of legally relevant document fields.
//!
//! The byte layout is:
//!
//! ```text
//! domain || kind || ts.seconds (u64 LE) || ts.nanos (u32 LE) || field count (u32 LE)
//!        || for each field, sorted by name: len(name) || name || tag || len(value) || value
//! ```
//!
//! Every length is a `u32` little-endian prefix and every value carries a
//! one-byte type tag, so no two distinct field sets can produce the same byte
//! stream: `"100"` and `100` differ, as do `""` and `null`. Volatile fields (view counters, last
//! access times) are dropped before encoding.

use serde_json::Value;
use std::collections::BTreeMap;

use herald_core::{sha256, ContentHash, DocumentKind, NoticeContent, Timestamp};

use crate::error::{LedgerError, LedgerResult};

/// Domain separator for document hashes.
pub const HASH_DOMAIN: &[u8] = b"herald/document/v2";

/// Field names that never enter a hash.
pub const VOLATILE_FIELDS: &[&str] = &[
    "view_count",
    "views",
    "download_count",
    "last_viewed_at",
    "last_accessed_at",
    "updated_at",
    "semaphore",
];

pub fn is_volatile(name: &str) -> bool {
    VOLATILE_FIELDS.contains(&name)
}

/// One hashed field value, typed so that equal renderings of different JSON
/// types never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Number(String),
    Bool(bool),
    Null,
    /// Arrays and objects, as compact JSON with keys sorted at every level.
    Json(String),
}

impl FieldValue {
    fn tag(&self) -> u8 {
        match self {
            FieldValue::Text(_) => b's',
            FieldValue::Number(_) => b'n',
            FieldValue::Bool(_) => b'b',
            FieldValue::Null => b'z',
            FieldValue::Json(_) => b'j',
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            FieldValue::Text(s) | FieldValue::Number(s) | FieldValue::Json(s) => s.as_bytes(),
            FieldValue::Bool(true) => b"true",
            FieldValue::Bool(false) => b"false",
            FieldValue::Null => b"",
        }
    }

    fn from_json(value: &Value) -> Self {
        match value {
            Value::String(s) => FieldValue::Text(s.clone()),
            Value::Number(n) => FieldValue::Number(n.to_string()),
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::Null => FieldValue::Null,
            other => FieldValue::Json(sorted_json(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalDocument {
    kind: DocumentKind,
    fields: BTreeMap<String, FieldValue>,
}

impl CanonicalDocument {
    pub fn new(kind: DocumentKind) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn field(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.insert(name, value);
        self
    }

    /// Inserts a text field.
    pub fn insert(&mut self, name: impl Into<String>, value: impl ToString) {
        self.insert_value(name, FieldValue::Text(value.to_string()));
    }

    pub fn insert_value(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Build from a JSON object. Each value keeps its JSON type.
    pub fn from_json(kind: DocumentKind, value: &Value) -> LedgerResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| LedgerError::Encoding("document fields must be an object".into()))?;
        let mut doc = Self::new(kind);
        for (name, field) in object {
            doc.insert_value(name.clone(), FieldValue::from_json(field));
        }
        Ok(doc)
    }

    pub fn canonical_bytes(&self, timestamp: &Timestamp) -> Vec<u8> {
        let retained: Vec<(&String, &FieldValue)> =
            self.fields.iter().filter(|(k, _)| !is_volatile(k)).collect();

        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(HASH_DOMAIN);
        push_prefixed(&mut out, self.kind.as_str().as_bytes());
        out.extend_from_slice(&timestamp.seconds_since_epoch.to_le_bytes());
        out.extend_from_slice(&timestamp.nanoseconds.to_le_bytes());
        out.extend_from_slice(&(retained.len() as u32).to_le_bytes());
        for (name, value) in retained {
            push_prefixed(&mut out, name.as_bytes());
            out.push(value.tag());
            push_prefixed(&mut out, value.as_bytes());
        }
        out
    }

    pub fn compute_hash(&self, timestamp: &Timestamp) -> ContentHash {
        sha256(&self.canonical_bytes(timestamp))
    }
}

fn sorted_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let inner: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), sorted_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(sorted_json).collect();
            format!("[{}]", inner.join(","))
        }
        scalar => scalar.to_string(),
    }
}

fn push_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// The legally relevant fields of a notice.
pub fn notice_document(content: &NoticeContent) -> CanonicalDocument {
    CanonicalDocument::new(DocumentKind::Notice)
        .field("employee_id", &content.employee_id)
        .field("company_id", &content.company_id)
        .field("sanction_type", &content.sanction_type)
        .field("sanction_days", content.sanction_days)
        .field("incident_date", content.incident_date.format("%Y-%m-%d"))
        .field("summary", &content.summary)
        .field("body", &content.body)
}

/// Deterministic document hash over the canonical encoding.
pub fn compute_hash(document: &CanonicalDocument, timestamp: &Timestamp) -> ContentHash {
    document.compute_hash(timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use herald_core::{CompanyId, EmployeeId};
    use serde_json::json;

    fn content() -> NoticeContent {
        NoticeContent {
            employee_id: EmployeeId::new("emp-7"),
            company_id: CompanyId::new("acme"),
            sanction_type: "Suspension".into(),
            sanction_days: 2,
            incident_date: NaiveDate::from_ymd_opt(2026, 1, 9).unwrap(),
            summary: "Safety breach".into(),
            body: "Operated the press without guards.".into(),
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let ts = Timestamp::from_seconds(1_700_000_000);
        let a = compute_hash(&notice_document(&content()), &ts);
        let b = compute_hash(&notice_document(&content()), &ts);
        assert_eq!(a, b);
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let ts = Timestamp::from_seconds(5);
        let a = CanonicalDocument::new(DocumentKind::LogEntry)
            .field("a", "1")
            .field("b", "2");
        let b = CanonicalDocument::new(DocumentKind::LogEntry)
            .field("b", "2")
            .field("a", "1");
        assert_eq!(a.compute_hash(&ts), b.compute_hash(&ts));
    }

    #[test]
    fn test_single_byte_change_changes_hash() {
        let ts = Timestamp::from_seconds(5);
        let base = notice_document(&content()).compute_hash(&ts);
        let mut changed = content();
        changed.body = "Operated the press without guardz.".into();
        assert_ne!(notice_document(&changed).compute_hash(&ts), base);
        assert_ne!(
            notice_document(&content()).compute_hash(&Timestamp::from_seconds(6)),
            base
        );
    }

    #[test]
    fn test_volatile_fields_ignored() {
        let ts = Timestamp::from_seconds(5);
        let plain = CanonicalDocument::new(DocumentKind::EvidenceFile).field("sha", "abc");
        let noisy = plain.clone().field("view_count", 42);
        assert_eq!(plain.compute_hash(&ts), noisy.compute_hash(&ts));
    }

    #[test]
    fn test_length_prefix_prevents_ambiguity() {
        let ts = Timestamp::from_seconds(5);
        let a = CanonicalDocument::new(DocumentKind::LogEntry).field("ab", "c");
        let b = CanonicalDocument::new(DocumentKind::LogEntry).field("a", "bc");
        assert_ne!(a.compute_hash(&ts), b.compute_hash(&ts));
    }

    #[test]
    fn test_kind_is_hashed() {
        let ts = Timestamp::from_seconds(5);
        let a = CanonicalDocument::new(DocumentKind::WitnessStatement).field("text", "x");
        let b = CanonicalDocument::new(DocumentKind::DischargeResponse).field("text", "x");
        assert_ne!(a.compute_hash(&ts), b.compute_hash(&ts));
    }

    #[test]
    fn test_from_json() {
        let doc = CanonicalDocument::from_json(
            DocumentKind::WitnessStatement,
            &json!({"witness": "J. Doe", "pages": 3, "meta": {"z": 1, "a": 2}}),
        )
        .unwrap();
        assert_eq!(doc.fields()["witness"], FieldValue::Text("J. Doe".into()));
        assert_eq!(doc.fields()["pages"], FieldValue::Number("3".into()));
        assert_eq!(
            doc.fields()["meta"],
            FieldValue::Json(r#"{"a":2,"z":1}"#.into())
        );
        assert!(CanonicalDocument::from_json(DocumentKind::LogEntry, &json!([1, 2])).is_err());
    }

    #[test]
    fn test_json_types_are_hashed() {
        let ts = Timestamp::from_seconds(5);
        let hash = |value: Value| {
            CanonicalDocument::from_json(DocumentKind::LogEntry, &value)
                .unwrap()
                .compute_hash(&ts)
        };
        assert_ne!(
            hash(json!({"amount": "100", "note": ""})),
            hash(json!({"amount": 100, "note": null}))
        );
        assert_ne!(hash(json!({"flag": true})), hash(json!({"flag": "true"})));
        assert_ne!(hash(json!({"items": [1]})), hash(json!({"items": "[1]"})));
        assert_eq!(
            hash(json!({"amount": 100, "note": null})),
            hash(json!({"note": null, "amount": 100}))
        );
    }
}
