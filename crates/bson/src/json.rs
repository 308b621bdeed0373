// Conversions between BSON values and serde_json values. The JSON side is
// the model-interchange form: training, enum detection, and canonical model
// persistence all flow through it. BSON-only types map to lossy-but-stable
// JSON renderings.

use super::{Document, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Render a BSON value as JSON. ObjectIds become their 24-hex form,
/// datetimes become RFC 3339 strings, binary becomes hex, and decimal128
/// is carried as its raw hex bytes.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Double(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) | Value::JavaScript(s) => serde_json::Value::String(s.clone()),
        Value::Document(d) => document_to_json(d),
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect())
        }
        Value::Binary(b) => serde_json::Value::String(hex::encode(&b.bytes)),
        Value::Undefined | Value::Null | Value::MinKey | Value::MaxKey => serde_json::Value::Null,
        Value::ObjectId(oid) => serde_json::Value::String(oid.to_string()),
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::DateTime(millis) => {
            let rendered = OffsetDateTime::from_unix_timestamp_nanos(*millis as i128 * 1_000_000)
                .ok()
                .and_then(|t| t.format(&Rfc3339).ok())
                .unwrap_or_else(|| millis.to_string());
            serde_json::Value::String(rendered)
        }
        Value::Regex(re) => serde_json::Value::String(re.pattern.clone()),
        Value::JavaScriptWithScope(code, _) => serde_json::Value::String(code.clone()),
        Value::Int32(n) => serde_json::Value::Number((*n).into()),
        Value::Timestamp(ts) => {
            serde_json::Value::Number((((ts.time as u64) << 32) | ts.increment as u64).into())
        }
        Value::Int64(n) => serde_json::Value::Number((*n).into()),
        Value::Decimal128(bytes) => serde_json::Value::String(hex::encode(bytes)),
    }
}

pub fn document_to_json(doc: &Document) -> serde_json::Value {
    serde_json::Value::Object(
        doc.iter()
            .map(|(k, v)| (k.to_owned(), value_to_json(v)))
            .collect(),
    )
}

/// Interpret JSON as BSON. Integers that fit in 32 bits narrow to Int32,
/// wider integers become Int64, and all other numbers become Double.
pub fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
                    Value::Int32(i as i32)
                } else {
                    Value::Int64(i)
                }
            } else {
                Value::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => Value::Document(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ),
    }
}
