//! Slash-path addressing into JSON documents.
//!
//! Agency keys are slash-separated (`Current/Collections/db/1001/s1`). Leading,
//! trailing and repeated slashes are ignored, so `/Plan/` and `Plan` address
//! the same node.

use serde_json::{Map, Value};

use crate::{AgencyError, AgencyResult};

/// Split a path into its non-empty segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Canonical form of a path: segments joined by single slashes.
pub fn normalize(path: &str) -> String {
    segments(path).join("/")
}

/// Segments of a path that must address a key (not the root).
pub fn key_segments(path: &str) -> AgencyResult<Vec<&str>> {
    let segs = segments(path);
    if segs.is_empty() {
        return Err(AgencyError::InvalidPath(path.to_string()));
    }
    Ok(segs)
}

/// JSON pointer (RFC 6901) for a list of segments.
fn pointer(segs: &[&str]) -> String {
    segs.iter()
        .map(|seg| format!("/{}", seg.replace('~', "~0").replace('/', "~1")))
        .collect()
}

pub fn get<'a>(root: &'a Value, segs: &[&str]) -> Option<&'a Value> {
    root.pointer(&pointer(segs))
}

/// Set the value at `segs`, creating (or replacing non-object) intermediate nodes.
pub fn set(root: &mut Value, segs: &[&str], value: Value) {
    let Some((last, parents)) = segs.split_last() else {
        *root = value;
        return;
    };
    let mut node = root;
    for seg in parents {
        node = ensure_object(node)
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(node).insert(last.to_string(), value);
}

/// Remove the key at `segs`. Missing keys are not an error.
pub fn delete(root: &mut Value, segs: &[&str]) {
    let Some((last, parents)) = segs.split_last() else {
        *root = Value::Object(Map::new());
        return;
    };
    if let Some(obj) = root
        .pointer_mut(&pointer(parents))
        .and_then(Value::as_object_mut)
    {
        obj.remove(*last);
    }
}

/// Increment the integer at `segs` by `step`; missing or non-integer values start at zero.
pub fn increment(root: &mut Value, segs: &[&str], step: u64) -> u64 {
    let current = get(root, segs).and_then(Value::as_u64).unwrap_or(0);
    let next = current.saturating_add(step);
    set(root, segs, Value::from(next));
    next
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}
