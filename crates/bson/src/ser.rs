// Encoding: each document is `int32 size || (type, cstring key, value)* || 0x00`,
// all integers little-endian. Sizes are computed by construction: the size
// slot is reserved, elements are appended, and the slot is patched with the
// exact length (including the size field and trailing NUL).

use super::value::*;
use super::{Document, Error, Result, Value, MAX_DOCUMENT_LEN};

impl Document {
    /// Encode this document to its exact wire form.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(128);
        write_document(&mut out, self)?;
        Ok(out)
    }
}

pub(crate) fn write_document(out: &mut Vec<u8>, doc: &Document) -> Result<()> {
    let base = out.len();
    out.extend_from_slice(&[0u8; 4]); // Size slot, patched below.

    for (key, value) in doc.iter() {
        out.push(value.element_type());
        write_cstring(out, key);
        write_value(out, value)?;
    }
    out.push(0);

    let size = out.len() - base;
    if size > MAX_DOCUMENT_LEN {
        return Err(Error::TooLarge(size));
    }
    out[base..base + 4].copy_from_slice(&(size as i32).to_le_bytes());
    Ok(())
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Double(f) => out.extend_from_slice(&f.to_le_bytes()),
        Value::String(s) | Value::JavaScript(s) => write_string(out, s),
        Value::Document(d) => write_document(out, d)?,
        Value::Array(items) => {
            // Arrays are documents whose keys are ASCII decimal indices.
            let as_doc: Document = items
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v.clone()))
                .collect();
            write_document(out, &as_doc)?;
        }
        Value::Binary(Binary { subtype, bytes }) => {
            out.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
            out.push(*subtype);
            out.extend_from_slice(bytes);
        }
        Value::Undefined | Value::Null | Value::MinKey | Value::MaxKey => {}
        Value::ObjectId(oid) => out.extend_from_slice(oid.bytes()),
        Value::Boolean(b) => out.push(*b as u8),
        Value::DateTime(millis) => out.extend_from_slice(&millis.to_le_bytes()),
        Value::Regex(Regex { pattern, options }) => {
            write_cstring(out, pattern);
            write_cstring(out, options);
        }
        Value::JavaScriptWithScope(code, scope) => {
            // int32 total || string code || document scope, where total
            // includes the int32 itself.
            let base = out.len();
            out.extend_from_slice(&[0u8; 4]);
            write_string(out, code);
            write_document(out, scope)?;
            let total = (out.len() - base) as i32;
            out[base..base + 4].copy_from_slice(&total.to_le_bytes());
        }
        Value::Int32(n) => out.extend_from_slice(&n.to_le_bytes()),
        Value::Timestamp(Timestamp { time, increment }) => {
            out.extend_from_slice(&increment.to_le_bytes());
            out.extend_from_slice(&time.to_le_bytes());
        }
        Value::Int64(n) => out.extend_from_slice(&n.to_le_bytes()),
        Value::Decimal128(bytes) => out.extend_from_slice(bytes),
    }
    Ok(())
}

// `int32 size-with-null || bytes || 0x00`.
fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&((s.len() + 1) as i32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

// NUL-terminated; interior NULs cannot be represented and are dropped.
fn write_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend(s.bytes().filter(|b| *b != 0));
    out.push(0);
}
