// BSON is the little-endian, length-prefixed binary document format spoken
// on the MongoDB wire. This crate implements the document value model, an
// exact-size encoder, a bounds-checked decoder, and the orderings used by
// query sorting and accumulator comparison.

mod compare;
mod de;
mod document;
mod json;
mod oid;
mod ser;
mod value;

pub use compare::compare;
pub use de::{DecodeOptions, Decoder};
pub use document::Document;
pub use json::{json_to_value, value_to_json};
pub use oid::ObjectId;
pub use value::{Binary, Regex, Timestamp, Value};

/// Largest document the codec will encode or decode, matching the
/// `maxBsonObjectSize` advertised during the `hello` handshake.
pub const MAX_DOCUMENT_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("buffer truncated: need {need} bytes at offset {at}, have {have}")]
    Truncated { at: usize, need: usize, have: usize },
    #[error("declared document length {declared} exceeds available {available} bytes")]
    LengthOverrun { declared: usize, available: usize },
    #[error("declared document length {0} is shorter than the minimal document")]
    LengthUnderrun(usize),
    #[error("document of {0} bytes exceeds the {MAX_DOCUMENT_LEN} byte maximum")]
    TooLarge(usize),
    #[error("invalid element type 0x{0:02x}")]
    InvalidElementType(u8),
    #[error("unterminated cstring")]
    UnterminatedCString,
    #[error("string value is not UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("invalid string length {0}")]
    InvalidStringLength(i32),
    #[error("invalid binary length {0}")]
    InvalidBinaryLength(i32),
    #[error("document is missing its trailing NUL terminator")]
    MissingTerminator,
    #[error("invalid ObjectId {0:?}")]
    InvalidObjectId(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Build a [`Document`] from literal keys and values.
/// Values are anything with an `Into<Value>` conversion:
///
/// ```
/// let d = bson::doc! { "ok": 1.0, "n": 3, "tag": "generated" };
/// assert_eq!(d.get("n"), Some(&bson::Value::Int32(3)));
/// ```
#[macro_export]
macro_rules! doc {
    () => { $crate::Document::new() };
    ($($key:literal : $value:expr),+ $(,)?) => {{
        let mut d = $crate::Document::new();
        $( d.insert($key, $value); )+
        d
    }};
}
