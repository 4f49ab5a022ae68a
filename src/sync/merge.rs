//! Field-level merge over item payloads
//!
//! A stale write carries its author's base version. The payload at that
//! version is reconstructed by undoing the modification log's field diffs
//! newest-first from the current payload; the write's own change set is
//! then the diff between that snapshot and its proposed payload. Disjoint
//! change sets combine into one payload without losing either side.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::storage::history::{diff_keys, field_diff};
use crate::types::{ItemPayload, ModificationRecord};

/// Conventional array field merged by union instead of whole-value replace
pub const TAGS_FIELD: &str = "tags";

/// Reconstruct the payload as it was before `newer_records` were applied
///
/// Records must cover a contiguous version range ending at the current
/// payload (oldest first, as returned by the modification log). Records
/// without a diff are skipped; callers check coverage before trusting the
/// result.
pub fn rewind_payload(current: &ItemPayload, newer_records: &[ModificationRecord]) -> ItemPayload {
    let mut payload = current.clone();

    for record in newer_records.iter().rev() {
        let Some(diff) = record.diff.as_ref().and_then(|d| d.as_object()) else {
            continue;
        };
        for (field, change) in diff {
            match change.get("old") {
                Some(Value::Null) | None => {
                    payload.remove(field);
                }
                Some(old) => {
                    payload.insert(field.clone(), old.clone());
                }
            }
        }
    }

    payload
}

/// Fields whose values differ between a base snapshot and a proposed payload
pub fn changed_fields(base: &ItemPayload, proposed: &ItemPayload) -> BTreeSet<String> {
    diff_keys(&field_diff(Some(base), proposed))
}

/// Overlay one side's field changes onto the current payload
///
/// Only fields the proposal actually changed relative to its base move;
/// everything else keeps the current value. A field the proposal dropped
/// is removed.
pub fn apply_changes(
    current: &ItemPayload,
    base: &ItemPayload,
    proposed: &ItemPayload,
) -> ItemPayload {
    let mut merged = current.clone();

    for field in changed_fields(base, proposed) {
        match proposed.get(&field) {
            Some(value) => {
                merged.insert(field, value.clone());
            }
            None => {
                merged.remove(&field);
            }
        }
    }

    merged
}

/// Union two tag arrays, current side's order first
///
/// Returns None unless both values are JSON arrays.
pub fn union_tags(current: Option<&Value>, proposed: Option<&Value>) -> Option<Value> {
    let current_items = current?.as_array()?;
    let proposed_items = proposed?.as_array()?;

    let mut merged: Vec<Value> = Vec::with_capacity(current_items.len() + proposed_items.len());
    for tag in current_items.iter().chain(proposed_items.iter()) {
        if !merged.contains(tag) {
            merged.push(tag.clone());
        }
    }

    Some(Value::Array(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ModificationRecord, WriteOperation, WriteSource};
    use chrono::Utc;
    use serde_json::json;

    fn payload(pairs: &[(&str, Value)]) -> ItemPayload {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn record(diff: Value, version: i64) -> ModificationRecord {
        ModificationRecord {
            id: version,
            op_id: format!("op-{version}"),
            item_id: 1,
            library_id: 1,
            external_key: "ABCD1234".to_string(),
            actor: "test".to_string(),
            operation: WriteOperation::Update,
            source: WriteSource::Local,
            diff: Some(diff),
            resulting_version: version,
            is_conflict: false,
            conflict_resolution: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_rewind_undoes_newest_first() {
        // v1: {title: A}  v2: title -> B  v3: +pages
        let current = payload(&[("title", json!("B")), ("pages", json!(12))]);
        let records = vec![
            record(json!({"title": {"old": "A", "new": "B"}}), 2),
            record(json!({"pages": {"old": null, "new": 12}}), 3),
        ];

        let base = rewind_payload(&current, &records);
        assert_eq!(base, payload(&[("title", json!("A"))]));
    }

    #[test]
    fn test_rewind_restores_dropped_field() {
        let current = payload(&[("title", json!("A"))]);
        let records = vec![record(json!({"publisher": {"old": "Acme", "new": null}}), 2)];

        let base = rewind_payload(&current, &records);
        assert_eq!(base.get("publisher"), Some(&json!("Acme")));
    }

    #[test]
    fn test_changed_fields_includes_removals() {
        let base = payload(&[("title", json!("A")), ("publisher", json!("Acme"))]);
        let proposed = payload(&[("title", json!("A")), ("year", json!(2001))]);

        let fields = changed_fields(&base, &proposed);
        assert!(fields.contains("publisher"));
        assert!(fields.contains("year"));
        assert!(!fields.contains("title"));
    }

    #[test]
    fn test_apply_changes_keeps_both_sides() {
        let base = payload(&[("title", json!("A")), ("year", json!(1999))]);
        // Current moved the year; the proposal retitled and dropped a field it saw
        let current = payload(&[("title", json!("A")), ("year", json!(2001))]);
        let proposed = payload(&[("title", json!("B")), ("year", json!(1999))]);

        let merged = apply_changes(&current, &base, &proposed);
        assert_eq!(merged.get("title"), Some(&json!("B")));
        assert_eq!(merged.get("year"), Some(&json!(2001)));
    }

    #[test]
    fn test_apply_changes_honors_removal() {
        let base = payload(&[("title", json!("A")), ("note", json!("draft"))]);
        let current = payload(&[("title", json!("A")), ("note", json!("draft"))]);
        let proposed = payload(&[("title", json!("A"))]);

        let merged = apply_changes(&current, &base, &proposed);
        assert!(!merged.contains_key("note"));
    }

    #[test]
    fn test_union_tags_dedups_and_keeps_order() {
        let current = json!(["rust", "syncing"]);
        let proposed = json!(["syncing", "database"]);

        let merged = union_tags(Some(&current), Some(&proposed)).unwrap();
        assert_eq!(merged, json!(["rust", "syncing", "database"]));
    }

    #[test]
    fn test_union_tags_rejects_non_arrays() {
        assert!(union_tags(Some(&json!("rust")), Some(&json!(["a"]))).is_none());
        assert!(union_tags(None, Some(&json!(["a"]))).is_none());
    }
}
