//! Row type and dotted-path helpers.
//!
//! Rows are JSON objects so the same representation serves SQL result
//! sets, documents and SaaS payloads.

use serde_json::{Map, Value};

/// One retrieved record.
pub type Row = Map<String, Value>;

/// Looks up a dotted path (`address.city`) in a row.
pub fn get_path<'a>(row: &'a Row, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = row.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Replaces the value at a dotted path.
///
/// Returns false if the path does not exist in the row; missing
/// intermediate objects are never created.
pub fn set_path(row: &mut Row, path: &str, value: Value) -> bool {
    match path.split_once('.') {
        None => match row.get_mut(path) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        },
        Some((head, rest)) => match row.get_mut(head).and_then(Value::as_object_mut) {
            Some(inner) => set_path(inner, rest, value),
            None => false,
        },
    }
}

/// Collects the distinct non-null values found at `path` across rows.
///
/// Array values are flattened so a document field holding a list of ids
/// contributes each id. First-seen order is kept.
pub fn collect_values(rows: &[Row], path: &str) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut push = |value: &Value| {
        if !value.is_null() && !out.contains(value) {
            out.push(value.clone());
        }
    };
    for row in rows {
        match get_path(row, path) {
            Some(Value::Array(items)) => items.iter().for_each(&mut push),
            Some(value) => push(value),
            None => {}
        }
    }
    out
}

/// Keeps only the given dotted paths of a row, rebuilding nested objects.
pub fn project(row: &Row, paths: &[String]) -> Row {
    let mut out = Row::new();
    for path in paths {
        if let Some(value) = get_path(row, path) {
            insert_path(&mut out, path, value.clone());
        }
    }
    out
}

fn insert_path(row: &mut Row, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            row.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = row
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(inner) = slot {
                insert_path(inner, rest, value);
            }
        }
    }
}

/// Serialized size of a row set in bytes.
pub fn payload_size(rows: &[Row]) -> usize {
    serde_json::to_vec(rows).map_or(0, |bytes| bytes.len())
}
