// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payload codec.
//!
//! Job arguments and results travel as "packed" strings: the value is wrapped
//! in a `{"value": ...}` envelope and serialized as JSON.

use serde_json::{Map, Value};

use crate::error::{Result, SdkError};

const ENVELOPE_KEY: &str = "value";

/// Wrap a value in the envelope and serialize it.
pub fn pack(value: &Value) -> String {
    let mut envelope = Map::with_capacity(1);
    envelope.insert(ENVELOPE_KEY.to_string(), value.clone());
    Value::Object(envelope).to_string()
}

/// Inverse of [`pack`].
pub fn unpack(packed: &str) -> Result<Value> {
    let envelope: Value = serde_json::from_str(packed)
        .map_err(|e| SdkError::MalformedPayload(format!("not valid JSON: {}", e)))?;

    match envelope {
        Value::Object(mut map) => map.remove(ENVELOPE_KEY).ok_or_else(|| {
            SdkError::MalformedPayload("envelope is missing the 'value' key".to_string())
        }),
        other => Err(SdkError::MalformedPayload(format!(
            "expected an envelope object, got {}",
            json_type_name(&other)
        ))),
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
