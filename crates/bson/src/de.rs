// Decoding: a bounds-checked reader over a byte slice. The declared
// document size must fit the buffer exactly; truncation, bad type tags,
// and unterminated strings are errors, never panics.

use super::value::*;
use super::{Binary, Document, Error, Regex, Result, Timestamp, Value, MAX_DOCUMENT_LEN};

/// Options controlling decode behavior.
#[derive(Copy, Clone, Debug, Default)]
pub struct DecodeOptions {
    /// When set, an int64 whose magnitude is at most 2^53 decodes as a
    /// `Double` ("promote to native number when safe-integer"). Off by
    /// default so that decode∘encode is the identity.
    pub promote_safe_int64: bool,
}

const SAFE_INTEGER_MAX: i64 = 1 << 53;

impl Document {
    /// Decode one document from the front of `buf`.
    pub fn from_slice(buf: &[u8]) -> Result<Self> {
        Self::from_slice_with(buf, DecodeOptions::default())
    }

    pub fn from_slice_with(buf: &[u8], options: DecodeOptions) -> Result<Self> {
        let mut decoder = Decoder::new(buf, options);
        let doc = decoder.read_document()?;
        Ok(doc)
    }
}

/// Decoder reads successive BSON values from a slice. The session layer
/// uses it directly to stream the document sequences of OP_MSG kind-1
/// sections and OP_REPLY batches.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    options: DecodeOptions,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], options: DecodeOptions) -> Self {
        Self {
            buf,
            pos: 0,
            options,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Truncated {
                at: self.pos,
                need: n,
                have: self.remaining(),
            });
        }
        let buf: &'a [u8] = self.buf;
        let slice = &buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_cstring(&mut self) -> Result<&'a str> {
        let buf: &'a [u8] = self.buf;
        let rest = &buf[self.pos..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(Error::UnterminatedCString)?;
        let s = std::str::from_utf8(&rest[..nul])?;
        self.pos += nul + 1;
        Ok(s)
    }

    // `int32 size-with-null || bytes || 0x00`.
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 1 {
            return Err(Error::InvalidStringLength(len));
        }
        let bytes = self.take(len as usize)?;
        let (content, terminator) = bytes.split_at(len as usize - 1);
        if terminator != [0] {
            return Err(Error::MissingTerminator);
        }
        Ok(std::str::from_utf8(content)?.to_owned())
    }

    /// Read one complete document, validating its declared size.
    pub fn read_document(&mut self) -> Result<Document> {
        let start = self.pos;
        let declared = self.read_i32()?;

        if declared < 5 {
            return Err(Error::LengthUnderrun(declared.max(0) as usize));
        }
        let declared = declared as usize;
        if declared > MAX_DOCUMENT_LEN {
            return Err(Error::TooLarge(declared));
        }
        if declared > self.buf.len() - start {
            return Err(Error::LengthOverrun {
                declared,
                available: self.buf.len() - start,
            });
        }
        let end = start + declared;

        let mut doc = Document::new();
        loop {
            if self.pos >= end {
                return Err(Error::MissingTerminator);
            }
            let tag = self.read_u8()?;
            if tag == 0 {
                if self.pos != end {
                    return Err(Error::MissingTerminator);
                }
                return Ok(doc);
            }
            let key = self.read_cstring()?.to_owned();
            let value = self.read_value(tag)?;
            doc.insert(key, value);
        }
    }

    fn read_value(&mut self, tag: u8) -> Result<Value> {
        Ok(match tag {
            TYPE_DOUBLE => Value::Double(self.read_f64()?),
            TYPE_STRING => Value::String(self.read_string()?),
            TYPE_DOCUMENT => Value::Document(self.read_document()?),
            TYPE_ARRAY => {
                let doc = self.read_document()?;
                Value::Array(doc.into_iter().map(|(_, v)| v).collect())
            }
            TYPE_BINARY => {
                let len = self.read_i32()?;
                if len < 0 {
                    return Err(Error::InvalidBinaryLength(len));
                }
                let subtype = self.read_u8()?;
                let bytes = self.take(len as usize)?.to_vec();
                Value::Binary(Binary { subtype, bytes })
            }
            TYPE_UNDEFINED => Value::Undefined,
            TYPE_OBJECT_ID => {
                let bytes: [u8; 12] = self.take(12)?.try_into().unwrap();
                Value::ObjectId(super::ObjectId::from_bytes(bytes))
            }
            TYPE_BOOLEAN => Value::Boolean(self.read_u8()? != 0),
            TYPE_DATETIME => Value::DateTime(self.read_i64()?),
            TYPE_NULL => Value::Null,
            TYPE_REGEX => Value::Regex(Regex {
                pattern: self.read_cstring()?.to_owned(),
                options: self.read_cstring()?.to_owned(),
            }),
            TYPE_JAVASCRIPT => Value::JavaScript(self.read_string()?),
            TYPE_JAVASCRIPT_SCOPE => {
                let _total = self.read_i32()?;
                let code = self.read_string()?;
                let scope = self.read_document()?;
                Value::JavaScriptWithScope(code, scope)
            }
            TYPE_INT32 => Value::Int32(self.read_i32()?),
            TYPE_TIMESTAMP => {
                let increment = self.read_u32()?;
                let time = self.read_u32()?;
                Value::Timestamp(Timestamp { time, increment })
            }
            TYPE_INT64 => {
                let n = self.read_i64()?;
                if self.options.promote_safe_int64 && n.abs() <= SAFE_INTEGER_MAX {
                    Value::Double(n as f64)
                } else {
                    Value::Int64(n)
                }
            }
            TYPE_DECIMAL128 => Value::Decimal128(self.take(16)?.try_into().unwrap()),
            TYPE_MIN_KEY => Value::MinKey,
            TYPE_MAX_KEY => Value::MaxKey,
            other => return Err(Error::InvalidElementType(other)),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::doc;
    use pretty_assertions::assert_eq;

    #[test]
    fn rejects_overrun_and_truncation() {
        let bytes = doc! { "a": 1 }.to_vec().unwrap();

        // Declared size exceeding the buffer is an overrun.
        let mut inflated = bytes.clone();
        inflated[0] += 1;
        assert!(matches!(
            Document::from_slice(&inflated),
            Err(Error::LengthOverrun { .. })
        ));

        // A truncated buffer cannot satisfy the declared size.
        assert!(matches!(
            Document::from_slice(&bytes[..bytes.len() - 2]),
            Err(Error::LengthOverrun { .. })
        ));

        // Chopping the size prefix itself is a short read.
        assert!(matches!(
            Document::from_slice(&bytes[..3]),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_unknown_element_type() {
        let mut bytes = doc! { "a": 1 }.to_vec().unwrap();
        bytes[4] = 0x7E;
        assert!(matches!(
            Document::from_slice(&bytes),
            Err(Error::InvalidElementType(0x7E))
        ));
    }

    #[test]
    fn promotes_safe_int64_when_asked() {
        let bytes = doc! { "n": 42i64, "big": i64::MAX }.to_vec().unwrap();

        let plain = Document::from_slice(&bytes).unwrap();
        assert_eq!(plain.get("n"), Some(&Value::Int64(42)));

        let promoted = Document::from_slice_with(
            &bytes,
            DecodeOptions {
                promote_safe_int64: true,
            },
        )
        .unwrap();
        assert_eq!(promoted.get("n"), Some(&Value::Double(42.0)));
        // Out of the safe range: left alone.
        assert_eq!(promoted.get("big"), Some(&Value::Int64(i64::MAX)));
    }

    #[test]
    fn array_keys_are_indices() {
        let d = doc! { "xs": vec![Value::from(10), Value::from("y")] };
        let decoded = Document::from_slice(&d.to_vec().unwrap()).unwrap();
        assert_eq!(decoded, d);
    }
}
