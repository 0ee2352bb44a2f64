//! Cleans a JSON-Schema-ish tool input definition into the shape the
//! upstream's stricter protobuf-backed validator accepts (SPEC_FULL.md
//! §4.C): unknown keywords dropped, nullable unions collapsed, disallowed
//! keys stripped, and recursion into nested schemas.

use ccrelay_protocol::gemini::{Schema, Type};
use serde_json::Value;
use std::collections::BTreeMap;

/// Only the keywords read below ever survive sanitisation; everything else
/// — including `$schema`, `$id`, `default`, and any keyword the upstream
/// validator doesn't recognise — is dropped by omission.
pub fn sanitize(value: &Value) -> Schema {
    let Value::Object(map) = value else {
        return Schema {
            r#type: Type::Object,
            format: None,
            description: None,
            nullable: None,
            enum_values: None,
            properties: None,
            required: None,
            items: None,
            any_of: None,
        };
    };

    let (r#type, nullable) = sanitize_type(map);

    let description = str_field(map, "description");
    let format = str_field(map, "format");
    let enum_values = map.get("enum").and_then(|v| v.as_array()).map(|values| {
        values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
    });

    let properties = map.get("properties").and_then(Value::as_object).map(|props| {
        props.iter().map(|(k, v)| (k.clone(), sanitize(v))).collect::<BTreeMap<_, _>>()
    });

    let required = map.get("required").and_then(|v| v.as_array()).map(|values| {
        values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
    });

    let items = map.get("items").map(|v| Box::new(sanitize(v)));

    let any_of = ["anyOf", "oneOf", "allOf"]
        .iter()
        .find_map(|key| map.get(*key))
        .and_then(Value::as_array)
        .map(|values| values.iter().map(sanitize).collect());

    Schema {
        r#type,
        format,
        description,
        nullable,
        enum_values,
        properties,
        required,
        items,
        any_of,
    }
}

fn str_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Determines the cleaned `type`/`nullable` pair. Handles the `type:
/// ["string","null"]` union shape by collapsing it into a single type with
/// `nullable: true`.
fn sanitize_type(map: &serde_json::Map<String, Value>) -> (Type, Option<bool>) {
    match map.get("type") {
        Some(Value::String(s)) => (type_from_str(s), None),
        Some(Value::Array(variants)) => {
            let mut nullable = false;
            let mut chosen = None;
            for variant in variants {
                match variant.as_str() {
                    Some("null") => nullable = true,
                    Some(other) => chosen = chosen.or_else(|| Some(type_from_str(other))),
                    None => {}
                }
            }
            (chosen.unwrap_or(Type::String), if nullable { Some(true) } else { None })
        }
        _ => (Type::Object, None),
    }
}

fn type_from_str(s: &str) -> Type {
    match s {
        "string" => Type::String,
        "number" => Type::Number,
        "integer" => Type::Integer,
        "boolean" => Type::Boolean,
        "array" => Type::Array,
        "object" => Type::Object,
        "null" => Type::Null,
        _ => Type::Object,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerces_nullable_union_type() {
        let schema = sanitize(&json!({"type": ["string", "null"]}));
        assert_eq!(schema.r#type, Type::String);
        assert_eq!(schema.nullable, Some(true));
    }

    #[test]
    fn drops_disallowed_and_unknown_keywords() {
        let schema = sanitize(&json!({
            "type": "object",
            "$schema": "http://json-schema.org/draft-07/schema#",
            "$id": "https://example.invalid/schema",
            "default": {"a": 1},
            "somethingWeird": true,
            "properties": {"a": {"type": "string"}}
        }));
        assert_eq!(schema.r#type, Type::Object);
        assert!(schema.properties.is_some());
    }

    #[test]
    fn recurses_into_properties_and_items() {
        let schema = sanitize(&json!({
            "type": "array",
            "items": {"type": "object", "properties": {"n": {"type": "integer"}}}
        }));
        let items = schema.items.expect("items");
        assert_eq!(items.r#type, Type::Object);
        let props = items.properties.expect("props");
        assert_eq!(props["n"].r#type, Type::Integer);
    }

    #[test]
    fn stable_output_for_equal_inputs() {
        let input = json!({"type": "object", "properties": {"x": {"type": "string"}}});
        assert_eq!(sanitize(&input), sanitize(&input));
    }
}
