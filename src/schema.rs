//! Minimal JSON-schema-like validation for capability boundaries
//!
//! Capability input/output schemas are documentation-first descriptors; the
//! subset enforced here is `type`, `required`, `properties`, and `enum`.
//! Anything else in a schema is carried for documentation and ignored by the
//! validator.

use serde_json::Value;

/// Validates `value` against a JSON-schema-like descriptor
///
/// Returns the list of violations; empty means valid. Paths are dotted from
/// the root (`$`), e.g. `$.parameters.limit`.
pub fn validate(schema: &Value, value: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    validate_at(schema, value, "$", &mut violations);
    violations
}

fn validate_at(schema: &Value, value: &Value, path: &str, violations: &mut Vec<String>) {
    let Some(schema_obj) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema_obj.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            violations.push(format!(
                "{path}: expected type '{expected}', got '{}'",
                type_name(value)
            ));
            return;
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            violations.push(format!("{path}: value not in enum"));
        }
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    violations.push(format!("{path}: missing required property '{key}'"));
                }
            }
        }

        if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
            for (key, property_schema) in properties {
                if let Some(property_value) = object.get(key) {
                    let child_path = format!("{path}.{key}");
                    validate_at(property_schema, property_value, &child_path, violations);
                }
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(item_schema) = schema_obj.get("items") {
            for (index, item) in items.iter().enumerate() {
                let child_path = format!("{path}[{index}]");
                validate_at(item_schema, item, &child_path, violations);
            }
        }
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
