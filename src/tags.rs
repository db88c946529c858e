//! Tag-name normalization and equivalence-based map access.
//!
//! exiftool may return several differently-qualified variants of logically
//! the same tag (`EXIF:DateTimeOriginal`, `ExifIFD:DateTimeOriginal`, bare
//! `DateTimeOriginal`). All cache lookups treat those as one tag via the
//! normalized form while preserving the raw key set for save-time diffing.

use serde_json::Value;

use crate::types::TagMap;

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Collapse a qualified tag name to its lower-cased `firstGroup:leaf` form.
///
/// `EXIF:SubGroup:DateTimeOriginal` and `exif:datetimeoriginal` normalize
/// equal; a name without groups stays a bare leaf. Empty input maps to
/// itself.
pub fn normalize(tag: &str) -> String {
    if tag.is_empty() {
        return String::new();
    }
    let lower = tag.to_lowercase();
    let mut parts = lower.split(':');
    let first = parts.next().unwrap_or_default();
    match parts.next_back() {
        Some(leaf) => format!("{first}:{leaf}"),
        None => lower,
    }
}

/// Whether two tag names address the same logical tag.
pub fn is_equal(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

// ---------------------------------------------------------------------------
// Equivalence-based map access
// ---------------------------------------------------------------------------

/// Find the first key in `map` matching `tag`, in insertion order.
///
/// `strict` compares raw strings; otherwise normalized forms.
pub fn lookup<'a>(map: &'a TagMap, tag: &str, strict: bool) -> Option<&'a str> {
    if strict {
        return map.get_key_value(tag).map(|(k, _)| k.as_str());
    }
    let target = normalize(tag);
    map.keys()
        .find(|k| normalize(k) == target)
        .map(String::as_str)
}

/// All keys in `map` matching `tag`, preserving insertion order.
pub fn lookup_all<'a>(map: &'a TagMap, tag: &str, strict: bool) -> Vec<&'a str> {
    if strict {
        return map
            .keys()
            .filter(|k| k.as_str() == tag)
            .map(String::as_str)
            .collect();
    }
    let target = normalize(tag);
    map.keys()
        .filter(|k| normalize(k) == target)
        .map(String::as_str)
        .collect()
}

/// Value of the first matching key, if any.
pub fn get<'a>(map: &'a TagMap, tag: &str, strict: bool) -> Option<&'a Value> {
    lookup(map, tag, strict).and_then(|k| map.get(k))
}

/// Value of the first matching key, stringified, or `default`.
pub fn get_or(map: &TagMap, tag: &str, default: &str, strict: bool) -> String {
    get(map, tag, strict).map_or_else(|| default.to_string(), to_display)
}

/// Overwrite the value of the first matching key in place.
///
/// A no-op when no key matches: new tags enter the cache only through the
/// edit layer, keyed by normalized name.
pub fn set(map: &mut TagMap, tag: &str, value: Value, strict: bool) {
    if let Some(key) = lookup(map, tag, strict).map(str::to_string) {
        map.insert(key, value);
    }
}

// ---------------------------------------------------------------------------
// Scalar display
// ---------------------------------------------------------------------------

/// Stringify a scalar tag value.
///
/// Used both for display and for the save-time "did the write take"
/// comparison, so edited strings compare against re-read values of any
/// scalar type.
pub fn to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
