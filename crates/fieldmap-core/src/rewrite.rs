//! Rewriting raw records with a merged [`MappingState`].
//!
//! Each field whose key has a mapping entry is moved under the entry's
//! human-readable name, and `set`/`enum` option ids are replaced with their
//! labels. Ids without a label are kept as they are.
//!
//! The state is only read, so disjoint pages can be rewritten concurrently
//! against one snapshot. When two keys map to the same name the later key in
//! state iteration order wins.

use serde_json::Value as JsonValue;

use crate::coerce::coerce_to_list;
use crate::{bool_key, FieldType, MappingEntry, MappingState, OptionMap, RawRecord, RewrittenRecord};

pub fn rewrite(records: Vec<RawRecord>, state: &MappingState) -> Vec<RewrittenRecord> {
    if state.is_empty() {
        return records;
    }
    records
        .into_iter()
        .map(|mut record| {
            rewrite_record(&mut record, state);
            record
        })
        .collect()
}

/// In-place variant of [`rewrite`] for one page.
pub fn rewrite_page(records: &mut [RawRecord], state: &MappingState) {
    if state.is_empty() {
        return;
    }
    for record in records {
        rewrite_record(record, state);
    }
}

pub fn rewrite_record(record: &mut RawRecord, state: &MappingState) {
    for (key, entry) in state {
        let Some(value) = record.remove(key) else {
            continue;
        };
        let resolved = resolve_value(entry, value);
        record.insert(entry.name.clone(), resolved);
    }
}

/// Resolve one field value through `entry`'s options.
pub fn resolve_value(entry: &MappingEntry, value: JsonValue) -> JsonValue {
    if !is_truthy(&value) {
        return value;
    }
    match entry.field_type {
        FieldType::Set => JsonValue::Array(
            coerce_to_list(&value)
                .into_iter()
                .map(|id| lookup_label(&entry.options, id))
                .collect(),
        ),
        FieldType::Enum => lookup_label(&entry.options, unwrap_single(value)),
        FieldType::Other(_) => value,
    }
}

/// String form of an id as stored in an [`OptionMap`]; `None` for arrays and
/// objects, which never match an option.
pub fn option_key(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(bool_key(*b).to_string()),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

/// `null`, `false`, zero, and empty strings, arrays or objects are falsy.
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

fn lookup_label(options: &OptionMap, id: JsonValue) -> JsonValue {
    match option_key(&id).and_then(|key| options.get(&key)) {
        Some(label) => JsonValue::String(label.clone()),
        None => id,
    }
}

fn unwrap_single(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Array(mut items) if items.len() == 1 => items.remove(0),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(name: &str, field_type: FieldType, options: &[(&str, &str)]) -> MappingEntry {
        MappingEntry {
            name: name.into(),
            normalized_name: name.to_lowercase(),
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            field_type,
        }
    }

    fn record(value: JsonValue) -> RawRecord {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn set_field_is_renamed_and_labelled() {
        let mut state = MappingState::new();
        state.insert(
            "abc123".into(),
            entry("tags", FieldType::Set, &[("1", "Red"), ("2", "Blue")]),
        );
        let out = rewrite(vec![record(json!({"abc123": "1,2"}))], &state);
        assert_eq!(out, vec![record(json!({"tags": ["Red", "Blue"]}))]);
    }

    #[test]
    fn enum_field_unwraps_single_element_lists() {
        let mut state = MappingState::new();
        state.insert("xyz".into(), entry("stage", FieldType::Enum, &[("3", "Gold")]));
        let out = rewrite(vec![record(json!({"xyz": ["3"]}))], &state);
        assert_eq!(out, vec![record(json!({"stage": "Gold"}))]);
    }

    #[test]
    fn unknown_ids_fall_back_to_the_raw_value() {
        let mut state = MappingState::new();
        state.insert("abc".into(), entry("tags", FieldType::Set, &[("1", "Red")]));
        state.insert("xyz".into(), entry("stage", FieldType::Enum, &[("3", "Gold")]));
        let out = rewrite(
            vec![record(json!({"abc": [1, 9, "x"], "xyz": 4}))],
            &state,
        );
        assert_eq!(
            out,
            vec![record(json!({"tags": ["Red", 9, "x"], "stage": 4}))]
        );
    }

    #[test]
    fn enum_with_several_elements_is_left_as_is() {
        let mut state = MappingState::new();
        state.insert("xyz".into(), entry("stage", FieldType::Enum, &[("3", "Gold")]));
        let out = rewrite(vec![record(json!({"xyz": ["3", "4"]}))], &state);
        assert_eq!(out, vec![record(json!({"stage": ["3", "4"]}))]);
    }

    #[test]
    fn falsy_and_untyped_values_pass_through_under_the_new_name() {
        let mut state = MappingState::new();
        state.insert("a".into(), entry("tags", FieldType::Set, &[("1", "Red")]));
        state.insert("b".into(), entry("stage", FieldType::Enum, &[("0", "Zero")]));
        state.insert("c".into(), entry("notes", FieldType::Other("text".into()), &[("1", "x")]));
        let out = rewrite(vec![record(json!({"a": "", "b": 0, "c": "1", "d": true}))], &state);
        assert_eq!(
            out,
            vec![record(json!({"tags": "", "stage": 0, "notes": "1", "d": true}))]
        );
    }

    #[test]
    fn empty_state_is_identity() {
        let records = vec![record(json!({"abc123": "1,2", "title": "Deal"}))];
        assert_eq!(rewrite(records.clone(), &MappingState::new()), records);
    }

    #[test]
    fn fields_without_entries_are_untouched_and_existing_names_overwritten() {
        let mut state = MappingState::new();
        state.insert("abc".into(), entry("tags", FieldType::Set, &[("1", "Red")]));
        let mut page = vec![
            record(json!({"abc": 1, "tags": "stale", "title": "Deal"})),
            record(json!({"title": "Other"})),
        ];
        rewrite_page(&mut page, &state);
        assert_eq!(page[0], record(json!({"tags": ["Red"], "title": "Deal"})));
        assert_eq!(page[1], record(json!({"title": "Other"})));
    }

    #[test]
    fn bool_ids_resolve_against_capitalised_keys() {
        let mut state = MappingState::new();
        state.insert(
            "k".into(),
            entry("Flag", FieldType::Enum, &[("True", "Yes"), ("False", "No")]),
        );
        let out = rewrite(vec![record(json!({"k": true}))], &state);
        assert_eq!(out, vec![record(json!({"Flag": "Yes"}))]);
        assert_eq!(option_key(&json!(false)).as_deref(), Some("False"));
    }

    #[test]
    fn truthiness_matches_dynamic_rules() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!("0")));
        assert!(is_truthy(&json!(-1)));
    }
}
