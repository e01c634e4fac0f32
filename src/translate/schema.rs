//! Tool-schema normalization for upstream strict mode.
//!
//! Strict mode requires every object schema to name all of its properties as
//! required and to forbid additional properties, and it rejects a handful of
//! `format` annotations. The normalizer rewrites a clone of the schema so
//! the caller's value is never mutated, and it is idempotent.

use serde_json::{json, Value};

/// `format` values the upstream rejects under strict mode.
const REJECTED_FORMATS: &[&str] = &["uri", "uri-reference"];

/// Subschema-bearing keywords worth descending into. Data-carrying keys
/// (`enum`, `default`, `examples`) are deliberately left alone.
const NESTED_KEYWORDS: &[&str] = &["items", "anyOf", "oneOf", "allOf", "$defs", "definitions"];

/// Return a strict-mode-compatible copy of `schema`. Any JSON shape is
/// tolerated; non-schema values pass through untouched.
pub fn normalize(schema: &Value) -> Value {
    let mut out = schema.clone();
    normalize_node(&mut out);
    out
}

fn normalize_node(node: &mut Value) {
    let Some(map) = node.as_object_mut() else {
        return;
    };

    if map.get("type").and_then(Value::as_str) == Some("object") {
        if let Some(Value::Object(props)) = map.get("properties") {
            let mut required: Vec<String> = match map.get("required") {
                Some(Value::Array(entries)) => entries
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                _ => Vec::new(),
            };
            for name in props.keys() {
                if !required.iter().any(|r| r == name) {
                    required.push(name.clone());
                }
            }
            map.insert("required".to_string(), json!(required));
        }
        map.insert("additionalProperties".to_string(), json!(false));
    }

    if let Some(format) = map.get("format").and_then(Value::as_str) {
        if REJECTED_FORMATS.contains(&format) {
            map.remove("format");
        }
    }

    if let Some(Value::Object(props)) = map.get_mut("properties") {
        for subschema in props.values_mut() {
            normalize_node(subschema);
        }
    }

    for keyword in NESTED_KEYWORDS {
        let Some(value) = map.get_mut(*keyword) else {
            continue;
        };
        match value {
            Value::Array(entries) => {
                for entry in entries {
                    normalize_node(entry);
                }
            }
            Value::Object(defs) if *keyword == "$defs" || *keyword == "definitions" => {
                for def in defs.values_mut() {
                    normalize_node(def);
                }
            }
            Value::Object(_) => normalize_node(value),
            _ => {}
        }
    }
}
