//! Structural validation of persisted snapshots.
//!
//! Bytes are checked as untyped JSON first so that the error names the
//! offending record, then deserialized and checked against the snapshot
//! invariants.

use serde_json::Value;
use std::collections::HashSet;

use crate::types::{parse_timestamp, CacheSnapshot};
use crate::{Error, ErrorContext, Result};

fn invalid(msg: impl Into<String>, field: impl Into<String>) -> Error {
    Error::validation_with_context(
        msg,
        ErrorContext::new()
            .with_field_path(field)
            .with_source("snapshot_validator"),
    )
}

fn check_optional_timestamp(value: Option<&Value>, field: &str) -> Result<()> {
    match value {
        None | Some(Value::Null) => Ok(()),
        Some(Value::String(s)) if parse_timestamp(s).is_some() => Ok(()),
        Some(_) => Err(invalid("unparseable timestamp", field)),
    }
}

/// Parse and validate persisted bytes.
pub fn validate_bytes(data: &[u8]) -> Result<CacheSnapshot> {
    let root: Value = serde_json::from_slice(data)
        .map_err(|e| invalid(format!("not valid JSON: {}", e), "$"))?;
    let obj = root
        .as_object()
        .ok_or_else(|| invalid("snapshot is not an object", "$"))?;

    let records = match obj.get("records") {
        Some(Value::Array(records)) => records,
        Some(_) => return Err(invalid("records is not an array", "records")),
        None => return Err(invalid("records container missing", "records")),
    };
    check_optional_timestamp(obj.get("generated_at"), "generated_at")?;
    check_optional_timestamp(
        obj.get("last_enrichment_sweep_at"),
        "last_enrichment_sweep_at",
    )?;

    for (i, record) in records.iter().enumerate() {
        match record.get("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => {}
            _ => return Err(invalid("record without id", format!("records[{}].id", i))),
        }
        match record.get("basic").and_then(|b| b.get("occurred_at")) {
            Some(Value::String(s)) if parse_timestamp(s).is_some() => {}
            _ => {
                return Err(invalid(
                    "missing or unparseable occurred_at",
                    format!("records[{}].basic.occurred_at", i),
                ))
            }
        }
        check_optional_timestamp(
            record.get("last_enrichment_attempt_at"),
            &format!("records[{}].last_enrichment_attempt_at", i),
        )?;
    }

    let snapshot: CacheSnapshot = serde_json::from_value(root)
        .map_err(|e| invalid(format!("snapshot shape mismatch: {}", e), "$"))?;
    validate_snapshot(&snapshot)?;
    Ok(snapshot)
}

/// Invariants every snapshot must hold before it is persisted or trusted.
pub fn validate_snapshot(snapshot: &CacheSnapshot) -> Result<()> {
    if !snapshot.records.is_empty() && snapshot.generated_at.is_none() {
        return Err(invalid(
            "populated snapshot without generated_at",
            "generated_at",
        ));
    }
    let mut seen = HashSet::with_capacity(snapshot.records.len());
    for (i, record) in snapshot.records.iter().enumerate() {
        if record.id.trim().is_empty() {
            return Err(invalid("record without id", format!("records[{}].id", i)));
        }
        if !seen.insert(record.id.as_str()) {
            return Err(invalid(
                format!("duplicate id {}", record.id),
                format!("records[{}].id", i),
            ));
        }
    }
    Ok(())
}
