//! JSON shape checks.
//!
//! Supports the subset of JSON Schema keywords mock definitions use to
//! describe payloads: `type`, `required`, `properties`, `items`, `enum` and
//! `additionalProperties: false`. Unknown keywords are ignored.

use crate::error::{EngineError, Result};
use serde_json::Value;

/// Check `value` against `schema`.
pub fn validate(schema: &Value, value: &Value) -> Result<()> {
    check(schema, value, "$")
}

/// Parse `payload` as JSON and check it against `schema`.
pub fn validate_str(schema: &Value, payload: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| EngineError::SchemaValidation(format!("payload is not JSON: {}", e)))?;
    validate(schema, &value)?;
    Ok(value)
}

fn check(schema: &Value, value: &Value, at: &str) -> Result<()> {
    let Value::Object(schema) = schema else {
        // `true` / `{}`-like schemas accept everything
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let ok = match expected {
            Value::String(name) => has_type(value, name),
            Value::Array(names) => names
                .iter()
                .filter_map(Value::as_str)
                .any(|name| has_type(value, name)),
            _ => true,
        };
        if !ok {
            return Err(fail(at, format!("expected type {}", expected)));
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            let allowed = Value::Array(allowed.clone());
            return Err(fail(at, format!("{} is not one of {}", value, allowed)));
        }
    }

    if let Value::Object(obj) = value {
        if let Some(Value::Array(required)) = schema.get("required") {
            for key in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(key) {
                    return Err(fail(at, format!("missing required property {:?}", key)));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        if let Some(properties) = properties {
            for (key, sub) in properties {
                if let Some(child) = obj.get(key) {
                    check(sub, child, &format!("{}.{}", at, key))?;
                }
            }
        }

        if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
            let extra = obj
                .keys()
                .find(|k| properties.map(|p| !p.contains_key(*k)).unwrap_or(true));
            if let Some(key) = extra {
                return Err(fail(at, format!("unexpected property {:?}", key)));
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check(item_schema, item, &format!("{}[{}]", at, i))?;
        }
    }

    Ok(())
}

fn has_type(value: &Value, name: &str) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        _ => false,
    }
}

fn fail(at: &str, msg: String) -> EngineError {
    EngineError::SchemaValidation(format!("{}: {}", at, msg))
}
