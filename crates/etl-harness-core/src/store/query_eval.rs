//! Document-query evaluation over JSON records.
//!
//! Implements the subset of document-database query semantics the router
//! and NL translator produce, so every [`Store`](super::Store) backend
//! answers `find` and `aggregate` identically:
//!
//! - filters: implicit equality, `$eq $ne $gt $gte $lt $lte $in $nin
//!   $exists $regex` (`$options`), `$and $or $nor`, field-level `$not`
//! - projections: inclusion, exclusion, `"$path"` renames
//! - pipeline stages: `$match $project $sort $skip $limit $count $unwind
//!   $group` with `$sum $avg $min $max $first $last $push $addToSet $count`
//!
//! Dotted paths descend into nested mappings; numeric segments index arrays.
//! Anything outside this subset is an error rather than a silent no-op.

use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use indexmap::IndexMap;
use regex::{Regex, RegexBuilder};
use serde_json::{Number, Value};

use super::{ID_FIELD, OID_KEY};
use crate::models::Record;

/// Resolve a dotted path inside a record.
pub fn lookup<'a>(doc: &'a Record, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut Record, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Record::new()));
            if !child.is_object() {
                *child = Value::Object(Record::new());
            }
            if let Value::Object(map) = child {
                set_path(map, rest, value);
            }
        }
    }
}

/// Remove a dotted path, preserving the order of the remaining keys.
fn remove_path(doc: &mut Record, path: &str) {
    match path.split_once('.') {
        None => {
            *doc = std::mem::take(doc)
                .into_iter()
                .filter(|(key, _)| key != path)
                .collect();
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ordering and equality

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => {
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
    }
}

/// Total order over JSON values: null < numbers < strings < objects <
/// arrays < booleans, numbers compared numerically.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

// ---------------------------------------------------------------------------
// Filters

/// Whether `doc` satisfies `filter`. An empty filter matches everything.
///
/// Compiles the filter for a single document; use [`CompiledFilter`] when
/// testing many documents against the same filter.
pub fn matches(doc: &Record, filter: &Record) -> Result<bool> {
    CompiledFilter::new(filter)?.matches(doc)
}

/// A filter whose `$regex` patterns are compiled once, up front.
pub struct CompiledFilter<'f> {
    filter: &'f Record,
    regexes: HashMap<(&'f str, &'f str), Regex>,
}

impl<'f> CompiledFilter<'f> {
    pub fn new(filter: &'f Record) -> Result<Self> {
        let mut regexes = HashMap::new();
        collect_regexes(filter, &mut regexes)?;
        Ok(Self { filter, regexes })
    }

    /// Whether `doc` satisfies the filter.
    pub fn matches(&self, doc: &Record) -> Result<bool> {
        self.matches_clause(doc, self.filter)
    }

    fn matches_clause(&self, doc: &Record, filter: &'f Record) -> Result<bool> {
        for (key, condition) in filter {
            let ok = match key.as_str() {
                "$and" => {
                    let mut all = true;
                    for clause in clauses(key, condition)? {
                        if !self.matches_clause(doc, clause)? {
                            all = false;
                            break;
                        }
                    }
                    all
                }
                "$or" => self.any_clause(doc, clauses(key, condition)?)?,
                "$nor" => !self.any_clause(doc, clauses(key, condition)?)?,
                op if op.starts_with('$') => bail!("unsupported top-level operator {}", op),
                path => self.field_matches(lookup(doc, path), condition)?,
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn any_clause(&self, doc: &Record, clauses: Vec<&'f Record>) -> Result<bool> {
        for clause in clauses {
            if self.matches_clause(doc, clause)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn field_matches(&self, value: Option<&Value>, condition: &'f Value) -> Result<bool> {
        let Some(ops) = operator_doc(condition) else {
            return Ok(equals(value, condition));
        };
        let options = regex_options(ops);
        for (op, arg) in ops {
            let ok = match op.as_str() {
                "$eq" => equals(value, arg),
                "$ne" => !equals(value, arg),
                "$gt" => compares(value, arg, |o| o == Ordering::Greater),
                "$gte" => compares(value, arg, |o| o != Ordering::Less),
                "$lt" => compares(value, arg, |o| o == Ordering::Less),
                "$lte" => compares(value, arg, |o| o != Ordering::Greater),
                "$in" => in_list(op, value, arg)?,
                "$nin" => !in_list(op, value, arg)?,
                "$exists" => value.is_some() == truthy(arg),
                "$regex" => {
                    let re = arg
                        .as_str()
                        .and_then(|pattern| self.regexes.get(&(pattern, options)))
                        .ok_or_else(|| anyhow!("$regex expects a string pattern"))?;
                    regex_matches(value, re)
                }
                "$options" => true,
                "$not" => {
                    if !arg.is_object() {
                        bail!("$not expects an operator document");
                    }
                    !self.field_matches(value, arg)?
                }
                other => bail!("unsupported query operator {}", other),
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn clauses<'a>(op: &str, value: &'a Value) -> Result<Vec<&'a Record>> {
    let items = value
        .as_array()
        .ok_or_else(|| anyhow!("{} expects an array of filters", op))?;
    items
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| anyhow!("{} clauses must be objects", op))
        })
        .collect()
}

fn regex_options(ops: &Record) -> &str {
    ops.get("$options").and_then(Value::as_str).unwrap_or("")
}

/// Compile every `$regex` reachable from `filter`. Malformed combinators
/// are left for evaluation to report.
fn collect_regexes<'f>(
    filter: &'f Record,
    out: &mut HashMap<(&'f str, &'f str), Regex>,
) -> Result<()> {
    for (key, condition) in filter {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                for clause in condition.as_array().into_iter().flatten() {
                    if let Some(clause) = clause.as_object() {
                        collect_regexes(clause, out)?;
                    }
                }
            }
            _ => collect_field_regexes(condition, out)?,
        }
    }
    Ok(())
}

fn collect_field_regexes<'f>(
    condition: &'f Value,
    out: &mut HashMap<(&'f str, &'f str), Regex>,
) -> Result<()> {
    let Some(ops) = operator_doc(condition) else {
        return Ok(());
    };
    if let Some(pattern) = ops.get("$regex") {
        let pattern = pattern
            .as_str()
            .ok_or_else(|| anyhow!("$regex expects a string pattern"))?;
        let options = regex_options(ops);
        if !out.contains_key(&(pattern, options)) {
            let re = RegexBuilder::new(pattern)
                .case_insensitive(options.contains('i'))
                .multi_line(options.contains('m'))
                .dot_matches_new_line(options.contains('s'))
                .ignore_whitespace(options.contains('x'))
                .build()
                .map_err(|e| anyhow!("invalid $regex {:?}: {}", pattern, e))?;
            out.insert((pattern, options), re);
        }
    }
    if let Some(inner) = ops.get("$not") {
        collect_field_regexes(inner, out)?;
    }
    Ok(())
}

/// An operator document: every key starts with `$`. An opaque identifier
/// wrapper is a literal, not an operator.
fn operator_doc(value: &Value) -> Option<&Record> {
    match value {
        Value::Object(map)
            if !map.is_empty()
                && map.keys().all(|k| k.starts_with('$'))
                && !(map.len() == 1 && map.contains_key(OID_KEY)) =>
        {
            Some(map)
        }
        _ => None,
    }
}

/// Equality with array membership: `{tags: "a"}` matches `tags: ["a", "b"]`.
/// A null target also matches a missing field.
fn equals(value: Option<&Value>, target: &Value) -> bool {
    match value {
        None => target.is_null(),
        Some(v) => {
            values_equal(v, target)
                || matches!(v, Value::Array(items) if items.iter().any(|i| values_equal(i, target)))
        }
    }
}

/// Ordered comparison only between values of the same type class.
fn compares(value: Option<&Value>, target: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let check = |v: &Value| type_rank(v) == type_rank(target) && accept(compare_values(v, target));
    match value {
        None => false,
        Some(Value::Array(items)) if !target.is_array() => items.iter().any(check),
        Some(v) => check(v),
    }
}

fn in_list(op: &str, value: Option<&Value>, arg: &Value) -> Result<bool> {
    let candidates = arg
        .as_array()
        .ok_or_else(|| anyhow!("{} expects an array", op))?;
    Ok(candidates.iter().any(|c| equals(value, c)))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        _ => true,
    }
}

fn regex_matches(value: Option<&Value>, re: &Regex) -> bool {
    match value {
        Some(Value::String(s)) => re.is_match(s),
        Some(Value::Array(items)) => items
            .iter()
            .any(|i| i.as_str().map(|s| re.is_match(s)).unwrap_or(false)),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Projection

/// Shape a record with an inclusion or exclusion projection. `_id` is kept
/// unless excluded explicitly; an empty projection returns the record as is.
pub fn project(doc: &Record, projection: &Record) -> Result<Record> {
    let mut include_id = true;
    let mut inclusion: Option<bool> = None;
    for (key, spec) in projection {
        let (include, computed) = match spec {
            Value::Bool(b) => (*b, false),
            Value::Number(n) => (n.as_f64().map(|f| f != 0.0).unwrap_or(false), false),
            Value::String(s) if s.starts_with('$') => (true, true),
            other => bail!("unsupported projection for {}: {}", key, other),
        };
        if key == ID_FIELD && !computed {
            include_id = include;
            continue;
        }
        match inclusion {
            None => inclusion = Some(include),
            Some(mode) if mode != include => {
                bail!("projection cannot mix inclusion and exclusion")
            }
            Some(_) => {}
        }
    }

    match inclusion {
        Some(true) => {
            let mut out = Record::new();
            if include_id {
                if let Some(id) = doc.get(ID_FIELD) {
                    out.insert(ID_FIELD.to_string(), id.clone());
                }
            }
            for (key, spec) in projection {
                let source = match spec {
                    Value::String(path) => &path[1..],
                    _ if key == ID_FIELD => continue,
                    _ => key.as_str(),
                };
                if let Some(v) = lookup(doc, source) {
                    set_path(&mut out, key, v.clone());
                }
            }
            Ok(out)
        }
        _ => {
            let mut out = doc.clone();
            if !include_id {
                remove_path(&mut out, ID_FIELD);
            }
            if inclusion == Some(false) {
                for key in projection.keys().filter(|k| k.as_str() != ID_FIELD) {
                    remove_path(&mut out, key);
                }
            }
            Ok(out)
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation

/// Run `pipeline` over `docs`, stage by stage.
pub fn run_pipeline(mut docs: Vec<Record>, pipeline: &[Value]) -> Result<Vec<Record>> {
    for stage in pipeline {
        let (name, arg) = match stage.as_object() {
            Some(map) if map.len() == 1 => map.iter().next().map(|(k, v)| (k.as_str(), v)),
            _ => None,
        }
        .ok_or_else(|| anyhow!("pipeline stage must be an object with one key: {}", stage))?;

        docs = match name {
            "$match" => {
                let filter = CompiledFilter::new(stage_object(name, arg)?)?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if filter.matches(&doc)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$project" => {
                let projection = stage_object(name, arg)?;
                docs.iter()
                    .map(|d| project(d, projection))
                    .collect::<Result<_>>()?
            }
            "$sort" => sort(docs, stage_object(name, arg)?)?,
            "$skip" => docs.into_iter().skip(stage_count(name, arg)?).collect(),
            "$limit" => docs.into_iter().take(stage_count(name, arg)?).collect(),
            "$count" => {
                let field = arg
                    .as_str()
                    .filter(|s| !s.is_empty() && !s.starts_with('$'))
                    .ok_or_else(|| anyhow!("$count expects a field name"))?;
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut out = Record::new();
                    out.insert(field.to_string(), Value::from(docs.len() as u64));
                    vec![out]
                }
            }
            "$unwind" => unwind(docs, arg)?,
            "$group" => group(docs, stage_object(name, arg)?)?,
            other => bail!("unsupported pipeline stage {}", other),
        };
    }
    Ok(docs)
}

fn stage_object<'a>(name: &str, arg: &'a Value) -> Result<&'a Record> {
    arg.as_object()
        .ok_or_else(|| anyhow!("{} expects an object", name))
}

fn stage_count(name: &str, arg: &Value) -> Result<usize> {
    arg.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| anyhow!("{} expects a non-negative integer", name))
}

fn sort(mut docs: Vec<Record>, spec: &Record) -> Result<Vec<Record>> {
    let mut keys = Vec::with_capacity(spec.len());
    for (path, direction) in spec {
        let descending = match direction.as_i64() {
            Some(1) => false,
            Some(-1) => true,
            _ => bail!("$sort direction for {} must be 1 or -1", path),
        };
        keys.push((path.as_str(), descending));
    }
    docs.sort_by(|a, b| {
        for (path, descending) in &keys {
            let left = lookup(a, path).unwrap_or(&Value::Null);
            let right = lookup(b, path).unwrap_or(&Value::Null);
            let ord = compare_values(left, right);
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(docs)
}

fn unwind(docs: Vec<Record>, arg: &Value) -> Result<Vec<Record>> {
    let (path, preserve) = match arg {
        Value::String(p) => (p.as_str(), false),
        Value::Object(spec) => (
            spec.get("path").and_then(Value::as_str).unwrap_or(""),
            spec.get("preserveNullAndEmptyArrays")
                .map(truthy)
                .unwrap_or(false),
        ),
        _ => ("", false),
    };
    let path = path
        .strip_prefix('$')
        .ok_or_else(|| anyhow!("$unwind expects a \"$field\" path"))?;

    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        match lookup(&doc, path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, path, item);
                    out.push(copy);
                }
            }
            None | Some(Value::Null) | Some(Value::Array(_)) => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

/// Evaluate an expression: `"$path"` reads a field (`None` when missing),
/// mappings evaluate member-wise, anything else is a literal.
fn eval_expr(doc: &Record, expr: &Value) -> Result<Option<Value>> {
    match expr {
        Value::String(s) if s.starts_with('$') => Ok(lookup(doc, &s[1..]).cloned()),
        Value::Object(map) => {
            let mut out = Record::new();
            for (key, sub) in map {
                if key.starts_with('$') {
                    bail!("unsupported expression operator {}", key);
                }
                out.insert(key.clone(), eval_expr(doc, sub)?.unwrap_or(Value::Null));
            }
            Ok(Some(Value::Object(out)))
        }
        literal => Ok(Some(literal.clone())),
    }
}

fn group(docs: Vec<Record>, spec: &Record) -> Result<Vec<Record>> {
    let key_expr = spec
        .get(ID_FIELD)
        .ok_or_else(|| anyhow!("$group requires an _id expression"))?;

    let mut buckets: IndexMap<String, (Value, Vec<&Record>)> = IndexMap::new();
    for doc in &docs {
        let key = eval_expr(doc, key_expr)?.unwrap_or(Value::Null);
        let canonical = key.to_string();
        buckets
            .entry(canonical)
            .or_insert_with(|| (key, Vec::new()))
            .1
            .push(doc);
    }

    let mut out = Vec::with_capacity(buckets.len());
    for (_, (key, members)) in buckets {
        let mut row = Record::new();
        row.insert(ID_FIELD.to_string(), key);
        for (field, accumulator) in spec.iter().filter(|(k, _)| k.as_str() != ID_FIELD) {
            let (op, expr) = match accumulator.as_object() {
                Some(map) if map.len() == 1 => map.iter().next(),
                _ => None,
            }
            .ok_or_else(|| anyhow!("accumulator for {} must be an object with one key", field))?;
            row.insert(field.clone(), accumulate(op, expr, &members)?);
        }
        out.push(row);
    }
    Ok(out)
}

fn accumulate(op: &str, expr: &Value, members: &[&Record]) -> Result<Value> {
    let mut values = Vec::with_capacity(members.len());
    for doc in members {
        if let Some(v) = eval_expr(doc, expr)? {
            values.push(v);
        }
    }
    let present = || values.iter().filter(|v| !v.is_null());

    Ok(match op {
        "$sum" => sum(&values),
        "$avg" => {
            let nums: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                float_value(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        "$min" => present()
            .min_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        "$max" => present()
            .max_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        "$first" => members
            .first()
            .map(|d| eval_expr(d, expr))
            .transpose()?
            .flatten()
            .unwrap_or(Value::Null),
        "$last" => members
            .last()
            .map(|d| eval_expr(d, expr))
            .transpose()?
            .flatten()
            .unwrap_or(Value::Null),
        "$push" => Value::Array(values),
        "$addToSet" => {
            let mut set: Vec<Value> = Vec::new();
            for v in values {
                if !set.iter().any(|s| values_equal(s, &v)) {
                    set.push(v);
                }
            }
            Value::Array(set)
        }
        "$count" => Value::from(members.len() as u64),
        other => bail!("unsupported accumulator {}", other),
    })
}

/// Integer sum while every addend is an integer and nothing overflows.
fn sum(values: &[Value]) -> Value {
    let mut int_total: Option<i64> = Some(0);
    let mut float_total = 0.0;
    for n in values.iter().filter_map(Value::as_number) {
        int_total = match (int_total, n.as_i64()) {
            (Some(acc), Some(i)) => acc.checked_add(i),
            _ => None,
        };
        float_total += n.as_f64().unwrap_or(0.0);
    }
    match int_total {
        Some(total) => Value::from(total),
        None => float_value(float_total),
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}
