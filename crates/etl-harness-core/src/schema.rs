//! Schema inference and versioned merge.
//!
//! A [`SourceSchema`] describes every collection fed by one `source_id`.
//! Each ingest infers a batch schema from its fragments, merges it into the
//! stored current schema, and commits the result as a new immutable version.
//!
//! # Field types
//!
//! [`FieldType`] is a join-semilattice:
//!
//! ```text
//!                          string
//!                            │
//!                          mixed
//!      ┌───────┬───────┬─────┼─────┬───────┬───────┐
//!   boolean integer  float array object  null
//! ```
//!
//! [`FieldType::widen`] is the join: equal types are unchanged, anything
//! joined with `string` is `string`, and two distinct types below `mixed`
//! join to `mixed`. `null` is an ordinary peer, so a field seen only as null
//! and later as an integer is `mixed`. The join is commutative and
//! associative, so batches merge to the same result in any order.
//!
//! # Required flags
//!
//! A field is `required` only if every record of every contributing batch
//! carried a non-null value for it. A field missing from one side of a merge
//! that did contribute records is therefore not required, and a flag that
//! has become `false` never returns to `true`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{EtlError, Result};
use crate::models::{Fragment, FragmentType, Record};
use crate::store::{CommitOutcome, Store};

/// How many times a commit is recomputed after losing a version race.
const MAX_COMMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Array,
    Object,
    Mixed,
}

impl FieldType {
    /// The type of a single value; `None` for JSON null.
    pub fn of(value: &Value) -> Option<FieldType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(FieldType::Boolean),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(FieldType::Integer),
            Value::Number(_) => Some(FieldType::Float),
            Value::String(_) => Some(FieldType::String),
            Value::Array(_) => Some(FieldType::Array),
            Value::Object(_) => Some(FieldType::Object),
        }
    }

    /// Least upper bound of two observations.
    pub fn widen(self, other: FieldType) -> FieldType {
        match (self, other) {
            (a, b) if a == b => a,
            (FieldType::String, _) | (_, FieldType::String) => FieldType::String,
            _ => FieldType::Mixed,
        }
    }

    /// Type of a batch of non-null values. Several kinds collapse to
    /// `string` when a scalar kind (string, float, integer) is among them.
    pub fn infer(values: &[&Value]) -> FieldType {
        let kinds: BTreeSet<FieldType> = values.iter().filter_map(|v| FieldType::of(v)).collect();
        let mut iter = kinds.iter();
        match (iter.next(), iter.next()) {
            (None, _) => FieldType::Null,
            (Some(only), None) => *only,
            _ => {
                let scalar = kinds
                    .iter()
                    .any(|k| matches!(k, FieldType::String | FieldType::Float | FieldType::Integer));
                if scalar {
                    FieldType::String
                } else {
                    FieldType::Mixed
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    /// Last observed non-null value.
    pub sample: Value,
}

impl FieldSchema {
    fn absorb(&mut self, other: FieldSchema) {
        self.field_type = self.field_type.widen(other.field_type);
        self.required = self.required && other.required;
        if !other.sample.is_null() {
            self.sample = other.sample;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub fields: IndexMap<String, FieldSchema>,
    pub record_count: u64,
    pub source_type: FragmentType,
}

impl CollectionSchema {
    /// Infer a collection schema from one batch of records.
    pub fn infer(records: &[Record], source_type: FragmentType) -> Self {
        let mut observed: IndexMap<&str, Vec<&Value>> = IndexMap::new();
        for record in records {
            for (key, value) in record {
                observed.entry(key.as_str()).or_default().push(value);
            }
        }

        let total = records.len();
        let fields = observed
            .into_iter()
            .map(|(name, values)| {
                let non_null: Vec<&Value> = values.into_iter().filter(|v| !v.is_null()).collect();
                let schema = FieldSchema {
                    field_type: FieldType::infer(&non_null),
                    required: !non_null.is_empty() && non_null.len() == total,
                    sample: non_null.last().map(|v| (*v).clone()).unwrap_or(Value::Null),
                };
                (name.to_string(), schema)
            })
            .collect();

        Self {
            fields,
            record_count: total as u64,
            source_type,
        }
    }

    /// Union-merge another observation of the same collection into this one.
    pub fn merge(&mut self, other: CollectionSchema) {
        let self_had_records = self.record_count > 0;
        let other_had_records = other.record_count > 0;

        // Fields this side knows but the other batch never carried.
        if other_had_records {
            for (name, field) in self.fields.iter_mut() {
                if !other.fields.contains_key(name) {
                    field.required = false;
                }
            }
        }
        for (name, mut field) in other.fields {
            match self.fields.get_mut(&name) {
                Some(existing) => existing.absorb(field),
                None => {
                    if self_had_records {
                        field.required = false;
                    }
                    self.fields.insert(name, field);
                }
            }
        }
        self.record_count += other.record_count;
    }
}

/// Versioned schema of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSchema {
    pub source_id: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub collections: IndexMap<String, CollectionSchema>,
    pub data_types_present: BTreeSet<FragmentType>,
}

impl SourceSchema {
    /// Known field names of a collection, if the collection exists.
    pub fn field_names(&self, collection: &str) -> Option<impl Iterator<Item = &str>> {
        self.collections
            .get(collection)
            .map(|c| c.fields.keys().map(String::as_str))
    }
}

/// Infer per-collection schemas for one ingest. Fragments of the same type
/// merge into a single `<type>_data` collection.
pub fn infer_collections(fragments: &[Fragment]) -> IndexMap<String, CollectionSchema> {
    let mut collections: IndexMap<String, CollectionSchema> = IndexMap::new();
    for fragment in fragments {
        let records = fragment.effective_records();
        if records.is_empty() {
            continue;
        }
        let inferred = CollectionSchema::infer(&records, fragment.fragment_type);
        match collections.get_mut(&fragment.fragment_type.collection_name()) {
            Some(existing) => existing.merge(inferred),
            None => {
                collections.insert(fragment.fragment_type.collection_name(), inferred);
            }
        }
    }
    collections
}

/// Infer a batch schema from `fragments` and merge it into `current`.
///
/// Produces version `current.version + 1` (or `1`), even when nothing
/// changed. `created_at` survives from the first version; `updated_at` is
/// `now`.
pub fn infer_and_merge(
    source_id: &str,
    fragments: &[Fragment],
    current: Option<&SourceSchema>,
    now: DateTime<Utc>,
) -> SourceSchema {
    let batch = infer_collections(fragments);
    let batch_types: BTreeSet<FragmentType> = fragments.iter().map(|f| f.fragment_type).collect();

    match current {
        None => SourceSchema {
            source_id: source_id.to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
            collections: batch,
            data_types_present: batch_types,
        },
        Some(previous) => {
            let mut collections = previous.collections.clone();
            for (name, inferred) in batch {
                match collections.get_mut(&name) {
                    Some(existing) => existing.merge(inferred),
                    None => {
                        collections.insert(name, inferred);
                    }
                }
            }
            SourceSchema {
                source_id: source_id.to_string(),
                version: previous.version + 1,
                created_at: previous.created_at,
                updated_at: now,
                collections,
                data_types_present: previous
                    .data_types_present
                    .union(&batch_types)
                    .copied()
                    .collect(),
            }
        }
    }
}

/// Read the current schema, merge `fragments` into it, and commit the new
/// version together with its history entry.
///
/// The commit is conditional on the version that was read. If another
/// writer committed first, the merge is recomputed on top of the newer
/// version, so no intervening version's contribution is lost.
pub async fn evolve_schema(
    store: &dyn Store,
    source_id: &str,
    fragments: &[Fragment],
) -> Result<SourceSchema> {
    for attempt in 1..=MAX_COMMIT_ATTEMPTS {
        let current = store
            .read_schema(source_id)
            .await
            .map_err(|e| EtlError::Schema(e.to_string()))?;
        let expected = current.as_ref().map(|s| s.version);
        let schema = infer_and_merge(source_id, fragments, current.as_ref(), Utc::now());

        match store.commit_schema(&schema, expected).await {
            Ok(CommitOutcome::Committed) => {
                info!(source_id, version = schema.version, "schema committed");
                return Ok(schema);
            }
            Ok(CommitOutcome::VersionConflict { found }) => {
                warn!(
                    source_id,
                    expected = ?expected,
                    found = ?found,
                    attempt,
                    "schema version moved during merge, retrying"
                );
            }
            Err(e) => return Err(EtlError::Schema(e.to_string())),
        }
    }
    Err(EtlError::Schema(format!(
        "gave up committing schema for source_id={} after {} conflicting attempts",
        source_id, MAX_COMMIT_ATTEMPTS
    )))
}
