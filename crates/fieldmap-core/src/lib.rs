//! Core domain model for CRM custom-field mapping.
//!
//! Field definitions fetched from the CRM are folded into a [`MappingState`]
//! (see [`mapping`]), which is then used to rewrite raw records so opaque field
//! keys and option ids become human-readable names and labels (see [`rewrite`]).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

pub mod coerce;
pub mod mapping;
pub mod naming;
pub mod rewrite;

pub use coerce::{coerce_to_list, CoercionInput};
pub use mapping::{merge, merge_options, merge_pages, merge_with_report, MergeReport};
pub use naming::{NamingConvention, SnakeCaseNaming};
pub use rewrite::{is_truthy, option_key, resolve_value, rewrite, rewrite_page, rewrite_record};

pub const CRATE_NAME: &str = "fieldmap-core";

/// One ingested entity instance before field substitution.
pub type RawRecord = Map<String, JsonValue>;

/// One ingested entity instance after field substitution.
pub type RewrittenRecord = Map<String, JsonValue>;

/// Option id (stringified) to label.
pub type OptionMap = BTreeMap<String, String>;

/// Persisted knowledge about every mapped field, keyed by the CRM field key.
pub type MappingState = BTreeMap<String, MappingEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    /// Multi-choice.
    Set,
    /// Single-choice.
    Enum,
    Other(String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Set => "set",
            Self::Enum => "enum",
            Self::Other(other) => other,
        }
    }

    pub fn is_choice(&self) -> bool {
        matches!(self, Self::Set | Self::Enum)
    }
}

impl From<String> for FieldType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "set" => Self::Set,
            "enum" => Self::Enum,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for FieldType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        match value {
            FieldType::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a choice option as the CRM reports it.
///
/// Built-in choice fields are only mapped when their ids are integers, so the
/// variant matters; `Bool` is listed first so `true`/`false` never decode as
/// anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionId {
    Bool(bool),
    Integer(i64),
    Text(String),
    Other(JsonValue),
}

impl OptionId {
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Integer(_))
    }

    /// String form used as the key of an [`OptionMap`]. Bools are stored as
    /// `True`/`False`, the form already present in persisted state.
    pub fn as_key(&self) -> String {
        match self {
            Self::Bool(b) => bool_key(*b).to_string(),
            Self::Integer(n) => n.to_string(),
            Self::Text(s) => s.clone(),
            Self::Other(JsonValue::String(s)) => s.clone(),
            Self::Other(other) => other.to_string(),
        }
    }
}

impl From<i64> for OptionId {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for OptionId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<bool> for OptionId {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOption {
    pub id: OptionId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub label: String,
}

impl FieldOption {
    pub fn new(id: impl Into<OptionId>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// One CRM field's metadata as of the current fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub key: String,
    pub name: String,
    pub field_type: FieldType,
    #[serde(default, deserialize_with = "null_as_default")]
    pub options: Vec<FieldOption>,
    /// `true` for user-defined custom fields.
    #[serde(default, deserialize_with = "null_as_default")]
    pub edit_flag: bool,
}

impl FieldDefinition {
    pub fn first_option_id(&self) -> Option<&OptionId> {
        self.options.first().map(|o| &o.id)
    }

    /// Whether this definition participates in the mapping.
    ///
    /// Custom fields always do. Built-in `set`/`enum` fields only do when their
    /// option ids are integer codes; string or bool keyed options stay as-is.
    pub fn is_mappable(&self) -> bool {
        if self.edit_flag {
            return true;
        }
        self.field_type.is_choice() && self.first_option_id().is_some_and(OptionId::is_integer)
    }

    pub fn option_map(&self) -> OptionMap {
        self.options
            .iter()
            .map(|o| (o.id.as_key(), o.label.clone()))
            .collect()
    }
}

/// Persisted knowledge about one field key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub name: String,
    pub normalized_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub options: OptionMap,
    pub field_type: FieldType,
}

impl MappingEntry {
    pub fn from_definition(def: &FieldDefinition, naming: &dyn NamingConvention) -> Self {
        Self {
            name: def.name.clone(),
            normalized_name: naming.normalize_identifier(def.name.trim()),
            options: def.option_map(),
            field_type: def.field_type.clone(),
        }
    }
}

pub(crate) fn bool_key(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_definition_tolerates_null_options_and_missing_edit_flag() {
        let def: FieldDefinition = serde_json::from_value(json!({
            "id": 12,
            "key": "add_time",
            "name": "Deal created",
            "field_type": "date",
            "options": null,
        }))
        .unwrap();
        assert!(def.options.is_empty());
        assert!(!def.edit_flag);
        assert_eq!(def.field_type, FieldType::Other("date".into()));
    }

    #[test]
    fn option_ids_keep_their_json_shape() {
        let options: Vec<FieldOption> = serde_json::from_value(json!([
            {"id": 7, "label": "Seven"},
            {"id": "open", "label": "Open"},
            {"id": true, "label": "Yes"},
            {"id": 1.5, "label": "Odd"},
        ]))
        .unwrap();
        assert_eq!(options[0].id, OptionId::Integer(7));
        assert_eq!(options[1].id, OptionId::Text("open".into()));
        assert_eq!(options[2].id, OptionId::Bool(true));
        assert_eq!(options[2].id.as_key(), "True");
        assert_eq!(options[3].id.as_key(), "1.5");
    }

    #[test]
    fn built_in_enum_with_string_ids_is_not_mappable() {
        let def = FieldDefinition {
            key: "status".into(),
            name: "Status".into(),
            field_type: FieldType::Enum,
            options: vec![FieldOption::new("open", "Open"), FieldOption::new("won", "Won")],
            edit_flag: false,
        };
        assert!(!def.is_mappable());

        let bool_keyed = FieldDefinition {
            options: vec![FieldOption::new(true, "Yes"), FieldOption::new(false, "No")],
            ..def.clone()
        };
        assert!(!bool_keyed.is_mappable());

        let int_keyed = FieldDefinition {
            options: vec![FieldOption::new(1, "Low")],
            ..def
        };
        assert!(int_keyed.is_mappable());
    }

    #[test]
    fn mapping_entry_loads_null_options_as_empty() {
        let entry: MappingEntry = serde_json::from_value(json!({
            "name": "Region",
            "normalized_name": "region",
            "options": null,
            "field_type": "varchar",
        }))
        .unwrap();
        assert!(entry.options.is_empty());
        assert_eq!(
            serde_json::to_value(&entry).unwrap()["field_type"],
            json!("varchar")
        );
    }
}
