use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

/// A field that arrived in a shape the normalizers do not accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {field} field: {reason}")]
pub struct MalformedInput {
    pub field: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyedSkill {
    pub name: String,
    pub confidence: Option<f64>,
}

/// The three accepted skill shapes, discriminated once at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SkillsField {
    StringList(Vec<String>),
    KeyedList(Vec<KeyedSkill>),
    Mapping(BTreeMap<String, Option<f64>>),
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn confidence_of(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64().filter(|c| c.is_finite()),
        JsonValue::Bool(true) => Some(1.0),
        _ => None,
    }
}

impl SkillsField {
    /// Rows that do not fit the list's shape are skipped with a warning; only a
    /// wholly unrecognized top-level shape is an error.
    pub fn from_value(value: &JsonValue) -> Result<Self, MalformedInput> {
        match value {
            JsonValue::Null => Ok(SkillsField::StringList(Vec::new())),
            JsonValue::Array(rows) => {
                let first = rows.iter().find(|row| !row.is_null());
                match first {
                    None => Ok(SkillsField::StringList(Vec::new())),
                    Some(JsonValue::String(_)) => Ok(SkillsField::StringList(
                        rows.iter()
                            .enumerate()
                            .filter_map(|(idx, row)| match row {
                                JsonValue::String(s) => Some(s.clone()),
                                other => {
                                    warn!(row = idx, kind = json_kind(other), "skipping non-string skill row");
                                    None
                                }
                            })
                            .collect(),
                    )),
                    Some(JsonValue::Object(_)) => Ok(SkillsField::KeyedList(
                        rows.iter()
                            .enumerate()
                            .filter_map(|(idx, row)| {
                                let name = row.get("name").and_then(JsonValue::as_str);
                                match name {
                                    Some(name) => Some(KeyedSkill {
                                        name: name.to_string(),
                                        confidence: row.get("confidence").and_then(confidence_of),
                                    }),
                                    None => {
                                        warn!(row = idx, kind = json_kind(row), "skipping skill row without name");
                                        None
                                    }
                                }
                            })
                            .collect(),
                    )),
                    Some(other) => Err(MalformedInput {
                        field: "skills",
                        reason: format!("list of {}", json_kind(other)),
                    }),
                }
            }
            JsonValue::Object(map) => Ok(SkillsField::Mapping(
                map.iter()
                    .map(|(name, conf)| (name.clone(), confidence_of(conf)))
                    .collect(),
            )),
            other => Err(MalformedInput {
                field: "skills",
                reason: format!("unexpected {}", json_kind(other)),
            }),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        match self {
            SkillsField::StringList(names) => names.iter().map(String::as_str).collect(),
            SkillsField::KeyedList(rows) => rows.iter().map(|r| r.name.as_str()).collect(),
            SkillsField::Mapping(map) => map.keys().map(String::as_str).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
