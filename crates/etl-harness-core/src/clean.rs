//! Record canonicalization and deduplication.
//!
//! - Field names become lowercase snake case ([`normalize_field_name`]).
//! - String values are trimmed and typed: empty → null, numeric → integer or
//!   float, `true/yes/y` and `false/no/n` → boolean.
//! - Exact duplicates (by canonical, key-sorted serialization) are removed,
//!   keeping the first occurrence.

use std::collections::HashSet;

use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::models::Record;

/// Lowercase, collapse every run of non-`[a-z0-9]` characters to a single
/// `_`, strip leading/trailing `_`. An empty result becomes `field`.
pub fn normalize_field_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_sep = false;
    for ch in lowered.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch);
        } else {
            pending_sep = true;
        }
    }
    if out.is_empty() {
        "field".to_string()
    } else {
        out
    }
}

/// Canonicalize a single value, recursing into sequences and mappings.
/// Keys of nested mappings are left as they are.
pub fn clean_value(value: Value) -> Value {
    match value {
        Value::String(s) => clean_string(&s),
        Value::Array(items) => Value::Array(items.into_iter().map(clean_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, clean_value(v)))
                .collect(),
        ),
        other => other,
    }
}

fn clean_string(raw: &str) -> Value {
    let s = raw.trim();
    if s.is_empty() {
        return Value::Null;
    }
    if let Some(number) = parse_number(s) {
        return number;
    }
    match s.to_lowercase().as_str() {
        "true" | "yes" | "y" => Value::Bool(true),
        "false" | "no" | "n" => Value::Bool(false),
        _ => Value::String(s.to_string()),
    }
}

/// Integral values become integers (`"4.0"` → `4`); `nan` and `inf` are
/// not representable and stay strings.
fn parse_number(s: &str) -> Option<Value> {
    let f: f64 = s.parse().ok()?;
    if !f.is_finite() {
        return None;
    }
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        return Some(Value::Number(Number::from(f as i64)));
    }
    Number::from_f64(f).map(Value::Number)
}

/// Canonicalize names and values of every record and drop exact duplicates.
/// Survivors keep first-seen order.
pub fn clean_records(records: &[Record]) -> Vec<Record> {
    let normalized: Vec<Record> = records
        .iter()
        .map(|record| {
            record
                .iter()
                .map(|(k, v)| (normalize_field_name(k), clean_value(v.clone())))
                .collect()
        })
        .collect();

    let deduplicated = dedup_records(normalized);
    info!(
        input = records.len(),
        unique = deduplicated.len(),
        "cleaned records"
    );
    deduplicated
}

/// Remove records whose canonical serialization has been seen before.
pub fn dedup_records(records: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(records.len());
    for record in records {
        match canonical_hash(&record) {
            Some(hash) => {
                if seen.insert(hash) {
                    unique.push(record);
                }
            }
            None => unique.push(record),
        }
    }
    unique
}

/// SHA-256 of the record serialized with keys sorted at every level.
fn canonical_hash(record: &Record) -> Option<String> {
    let canonical = sorted(&Value::Object(record.clone()));
    let serialized = serde_json::to_string(&canonical).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sorted(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
