//! Write discipline: nothing goes to the store with an explicit "no value".

use serde::Serialize;
use serde_json::{Map, Value};

use super::error::{Result, StoreError};

/// Recursively drop `null` members from objects and `null` elements from arrays.
pub fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|v| !v.is_null())
                .map(strip_nulls)
                .collect(),
        ),
        other => other,
    }
}

/// Serialize `value` and strip nulls, ready for `set`/`push`.
pub fn to_store_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(strip_nulls(serde_json::to_value(value)?))
}

/// Serialize a partial update into the field map expected by `update`.
pub fn to_store_fields<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match to_store_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Serialization(format!(
            "expected an object of fields, got {other}"
        ))),
    }
}
