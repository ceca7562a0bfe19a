//! Normalizing multi-choice values into an ordered list of option ids.
//!
//! CRM exports deliver `set` values as arrays, bare integers, comma separated
//! strings or JSON-encoded arrays. The input is classified into a
//! [`CoercionInput`] first and each shape is handled on its own.

use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoercionInput<'a> {
    /// `null` or `""`.
    Empty,
    /// A value that is not a sequence and not a string.
    Scalar(&'a JsonValue),
    Sequence(&'a [JsonValue]),
    /// A string that may hold one id, comma separated ids or a JSON array.
    EncodedString(&'a str),
}

impl<'a> CoercionInput<'a> {
    pub fn classify(value: &'a JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Empty,
            JsonValue::String(s) if s.is_empty() => Self::Empty,
            JsonValue::String(s) => Self::EncodedString(s),
            JsonValue::Array(items) => Self::Sequence(items),
            other => Self::Scalar(other),
        }
    }

    pub fn into_list(self) -> Vec<JsonValue> {
        match self {
            Self::Empty => Vec::new(),
            // Objects are one opaque value here; their keys are not ids.
            Self::Scalar(value) => vec![value.clone()],
            Self::Sequence(items) => items.to_vec(),
            Self::EncodedString(raw) => decode_string(raw),
        }
    }
}

pub fn coerce_to_list(value: &JsonValue) -> Vec<JsonValue> {
    CoercionInput::classify(value).into_list()
}

fn decode_string(raw: &str) -> Vec<JsonValue> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    // Checked before the comma split: `["a","b"]` contains commas too.
    if let Some(items) = parse_bracketed(trimmed) {
        return items;
    }
    if trimmed.contains(',') {
        return trimmed
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| JsonValue::String(part.to_string()))
            .collect();
    }
    vec![JsonValue::String(trimmed.to_string())]
}

fn parse_bracketed(text: &str) -> Option<Vec<JsonValue>> {
    if !(text.starts_with('[') && text.ends_with(']')) {
        return None;
    }
    match serde_json::from_str::<JsonValue>(text) {
        Ok(JsonValue::Array(items)) => Some(items),
        _ => None,
    }
}
