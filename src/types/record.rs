//! Record types: raw source payloads and the normalized cached form.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Record as handed over by a fetcher, before validation.
///
/// Everything is optional here; [`RawRecord::into_record`] decides what is
/// acceptable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: Option<String>,
    pub name: Option<String>,
    pub kind: Option<String>,
    /// RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or `YYYY-MM-DD`.
    pub occurred_at: Option<String>,
    pub magnitude: Option<f64>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Enrichment the source happened to include in the listing.
    #[serde(default)]
    pub enriched: EnrichedFields,
}

impl RawRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_occurred_at(mut self, at: impl Into<String>) -> Self {
        self.occurred_at = Some(at.into());
        self
    }

    pub fn with_magnitude(mut self, magnitude: f64) -> Self {
        self.magnitude = Some(magnitude);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Validate and convert into a cacheable record.
    pub fn into_record(self, excluded_kinds: &[String]) -> Result<Record, RejectReason> {
        let id = match self.id.map(|s| s.trim().to_string()) {
            Some(id) if !id.is_empty() => id,
            _ => return Err(RejectReason::MissingId),
        };
        let raw_date = self
            .occurred_at
            .ok_or_else(|| RejectReason::InvalidDate { id: id.clone(), value: String::new() })?;
        let occurred_at = parse_timestamp(&raw_date).ok_or_else(|| RejectReason::InvalidDate {
            id: id.clone(),
            value: raw_date.clone(),
        })?;
        let kind = self.kind.unwrap_or_default();
        if excluded_kinds.iter().any(|k| k.eq_ignore_ascii_case(&kind)) {
            return Err(RejectReason::ExcludedKind { id, kind });
        }

        let mut enriched = EnrichedFields::default();
        enriched.absorb(&self.enriched);

        Ok(Record {
            id,
            basic: BasicFields {
                name: self.name.unwrap_or_default(),
                kind,
                occurred_at,
                magnitude: self.magnitude,
                attributes: self.attributes,
            },
            enriched,
            enrichment_retry_count: 0,
            last_enrichment_attempt_at: None,
        })
    }
}

/// Why a raw record never made it into the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingId,
    InvalidDate { id: String, value: String },
    ExcludedKind { id: String, kind: String },
    DuplicateId { id: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MissingId => write!(f, "missing id"),
            RejectReason::InvalidDate { id, value } => {
                write!(f, "record {} has unparseable date {:?}", id, value)
            }
            RejectReason::ExcludedKind { id, kind } => {
                write!(f, "record {} has excluded kind {:?}", id, kind)
            }
            RejectReason::DuplicateId { id } => write!(f, "duplicate id {}", id),
        }
    }
}

/// Parse the timestamp shapes sources are known to emit.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Volatile attributes, replaced wholesale on every fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicFields {
    pub name: String,
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnitude: Option<f64>,
    /// Source-specific volatile attributes (counts, flags, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

/// Expensive, lazily fetched attributes.
///
/// Nulls are never stored: a key is either present with a value or absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnrichedFields(BTreeMap<String, Value>);

impl EnrichedFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.get(key).map(|v| !v.is_null()).unwrap_or(false)
    }

    /// Insert a value; nulls are ignored.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> bool {
        if value.is_null() {
            return false;
        }
        let key = key.into();
        if self.0.get(&key) == Some(&value) {
            return false;
        }
        self.0.insert(key, value);
        true
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    /// Overlay every non-null value from `other`. Returns whether anything changed.
    pub fn absorb(&mut self, other: &EnrichedFields) -> bool {
        let mut changed = false;
        for (k, v) in other.0.iter() {
            changed |= self.insert(k.clone(), v.clone());
        }
        changed
    }

    pub fn missing<'a>(&self, keys: &'a [String]) -> Vec<&'a str> {
        keys.iter()
            .filter(|k| !self.has(k))
            .map(|k| k.as_str())
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for EnrichedFields {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut fields = EnrichedFields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

/// A cached domain record (activity, donation, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub basic: BasicFields,
    #[serde(default)]
    pub enriched: EnrichedFields,
    #[serde(default)]
    pub enrichment_retry_count: u32,
    #[serde(default)]
    pub last_enrichment_attempt_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(id: impl Into<String>, basic: BasicFields) -> Self {
        Self {
            id: id.into(),
            basic,
            enriched: EnrichedFields::default(),
            enrichment_retry_count: 0,
            last_enrichment_attempt_at: None,
        }
    }

    pub fn with_enriched(mut self, key: impl Into<String>, value: Value) -> Self {
        self.enriched.insert(key, value);
        self
    }

    pub fn is_missing_any(&self, keys: &[String]) -> bool {
        keys.iter().any(|k| !self.enriched.has(k))
    }
}
