//! `class_mapping.json` parsing.
//!
//! Three on-disk schemas exist:
//! - object of index to label (tagging, object detection)
//! - object of index to `{attribute_name, attribute_value}` (attribute models)
//! - list of `{model_idx, class_name}` (segmentation)
//!
//! All of them must describe contiguous indices `0..N-1`.

use std::{fs, path::Path};

use serde::Deserialize;
use serde_json::Value;

use crate::error::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttributeClass {
    pub attribute_name: String,
    pub attribute_value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingShape {
    LabelObject,
    AttributeObject,
    IndexedList,
    Unknown,
}

/// Looks at the mapping layout only, without validating indices.
pub fn classify(value: &Value) -> MappingShape {
    match value {
        Value::Object(map) if !map.is_empty() => {
            if map.values().all(Value::is_string) {
                MappingShape::LabelObject
            } else if map.values().all(|v| {
                v.get("attribute_name").is_some() && v.get("attribute_value").is_some()
            }) {
                MappingShape::AttributeObject
            } else {
                MappingShape::Unknown
            }
        }
        Value::Array(items)
            if !items.is_empty()
                && items
                    .iter()
                    .all(|v| v.get("model_idx").is_some() && v.get("class_name").is_some()) =>
        {
            MappingShape::IndexedList
        }
        _ => MappingShape::Unknown,
    }
}

pub fn read_mapping(path: &Path) -> Result<Value, ServiceError> {
    let raw = fs::read_to_string(path).map_err(|e| ServiceError::load(path, e))?;
    serde_json::from_str(&raw).map_err(|e| ServiceError::load(path, e))
}

/// Same as [`read_mapping`] but swallows every error. Used by family
/// predicates, which must never fail.
pub fn peek_shape(path: &Path) -> MappingShape {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .map(|value| classify(&value))
        .unwrap_or(MappingShape::Unknown)
}

pub fn parse_labels(value: &Value) -> Result<Vec<String>, String> {
    let map = value
        .as_object()
        .ok_or("expected an object of index to label")?;
    let mut entries = Vec::with_capacity(map.len());
    for (key, label) in map {
        let label = label
            .as_str()
            .ok_or_else(|| format!("label for index {key:?} is not a string"))?;
        entries.push((parse_index(key)?, label.to_string()));
    }
    into_contiguous(entries)
}

pub fn parse_attributes(value: &Value) -> Result<Vec<AttributeClass>, String> {
    let map = value
        .as_object()
        .ok_or("expected an object of index to attribute descriptor")?;
    let mut entries = Vec::with_capacity(map.len());
    for (key, descriptor) in map {
        let class: AttributeClass = serde_json::from_value(descriptor.clone())
            .map_err(|e| format!("attribute descriptor for index {key:?}: {e}"))?;
        entries.push((parse_index(key)?, class));
    }
    into_contiguous(entries)
}

#[derive(Deserialize)]
struct IndexedClass {
    model_idx: Value,
    class_name: String,
}

pub fn parse_indexed_list(value: &Value) -> Result<Vec<String>, String> {
    let items: Vec<IndexedClass> =
        serde_json::from_value(value.clone()).map_err(|e| format!("expected a class list: {e}"))?;
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let idx = match &item.model_idx {
            Value::Number(n) => n
                .as_u64()
                .map(|n| n as usize)
                .ok_or_else(|| format!("model_idx {n} is not a non-negative integer"))?,
            Value::String(s) => parse_index(s)?,
            other => return Err(format!("model_idx {other} is not an integer")),
        };
        entries.push((idx, item.class_name));
    }
    into_contiguous(entries)
}

fn parse_index(key: &str) -> Result<usize, String> {
    key.trim()
        .parse::<usize>()
        .map_err(|_| format!("class index {key:?} is not a non-negative integer"))
}

fn into_contiguous<T>(mut entries: Vec<(usize, T)>) -> Result<Vec<T>, String> {
    if entries.is_empty() {
        return Err("class mapping is empty".into());
    }
    entries.sort_by_key(|(idx, _)| *idx);
    for (expected, (idx, _)) in entries.iter().enumerate() {
        if *idx != expected {
            return Err(format!(
                "class indices must be contiguous from 0; expected {expected}, found {idx}"
            ));
        }
    }
    Ok(entries.into_iter().map(|(_, v)| v).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_each_schema() {
        assert_eq!(classify(&json!({"0": "cat"})), MappingShape::LabelObject);
        assert_eq!(
            classify(&json!({"0": {"attribute_name": "color", "attribute_value": "red"}})),
            MappingShape::AttributeObject
        );
        assert_eq!(
            classify(&json!([{"model_idx": 0, "class_name": "bg"}])),
            MappingShape::IndexedList
        );
        assert_eq!(classify(&json!({})), MappingShape::Unknown);
        assert_eq!(classify(&json!({"0": 1})), MappingShape::Unknown);
    }

    #[test]
    fn labels_are_ordered_by_index() {
        let labels = parse_labels(&json!({"2": "dog", "0": "cat", "1": "bird"})).unwrap();
        assert_eq!(labels, vec!["cat", "bird", "dog"]);
    }

    #[test]
    fn rejects_non_integer_and_gapped_indices() {
        assert!(parse_labels(&json!({"zero": "cat"})).is_err());
        assert!(parse_labels(&json!({"-1": "cat"})).is_err());
        assert!(parse_labels(&json!({"0": "cat", "2": "dog"})).is_err());
        assert!(parse_indexed_list(&json!([
            {"model_idx": 0, "class_name": "bg"},
            {"model_idx": 0, "class_name": "road"}
        ]))
        .is_err());
        assert!(parse_indexed_list(&json!([{"model_idx": 1.5, "class_name": "x"}])).is_err());
    }

    #[test]
    fn parses_attribute_descriptors() {
        let classes = parse_attributes(&json!({
            "1": {"attribute_name": "color", "attribute_value": "blue"},
            "0": {"attribute_name": "color", "attribute_value": "red"}
        }))
        .unwrap();
        assert_eq!(classes[0].attribute_value, "red");
        assert_eq!(classes[1].attribute_value, "blue");
    }

    #[test]
    fn parses_segmentation_list() {
        let names = parse_indexed_list(&json!([
            {"model_idx": 1, "class_name": "road"},
            {"model_idx": 0, "class_name": "background"}
        ]))
        .unwrap();
        assert_eq!(names, vec!["background", "road"]);
    }
}
