use bson::{Binary, Document, ObjectId, Regex, Timestamp, Value};
use quickcheck::{Arbitrary, Gen, QuickCheck};

// Newtype wrapper generating well-formed documents over the encodable
// type set. Doubles are drawn from finite values so that equality is
// reflexive, and Undefined is excluded because it is decode-only.
#[derive(Clone, Debug)]
struct ArbitraryDocument(Document);

impl Arbitrary for ArbitraryDocument {
    fn arbitrary(g: &mut Gen) -> Self {
        ArbitraryDocument(arbitrary_document(g, 2))
    }
}

fn arbitrary_key(g: &mut Gen) -> String {
    let len = usize::arbitrary(g) % 8 + 1;
    (0..len)
        .map(|_| char::from(*g.choose(b"abcdefghijklmnopqrstuvwxyz_0").unwrap()))
        .collect()
}

fn arbitrary_string(g: &mut Gen) -> String {
    // Arbitrary UTF-8, minus NUL which a cstring cannot carry.
    String::arbitrary(g).replace('\0', "")
}

fn arbitrary_document(g: &mut Gen, depth: usize) -> Document {
    let len = usize::arbitrary(g) % 6;
    (0..len)
        .map(|_| (arbitrary_key(g), arbitrary_value(g, depth)))
        .collect()
}

fn arbitrary_value(g: &mut Gen, depth: usize) -> Value {
    let scalars: &[fn(&mut Gen) -> Value] = &[
        |g| {
            let mut f = f64::arbitrary(g);
            if !f.is_finite() {
                f = 0.0;
            }
            Value::Double(f)
        },
        |g| Value::String(arbitrary_string(g)),
        |g| {
            Value::Binary(Binary {
                subtype: *g.choose(&[0u8, 4]).unwrap(),
                bytes: Vec::arbitrary(g),
            })
        },
        |g| {
            let mut bytes = [0u8; 12];
            for b in bytes.iter_mut() {
                *b = u8::arbitrary(g);
            }
            Value::ObjectId(ObjectId::from_bytes(bytes))
        },
        |g| Value::Boolean(bool::arbitrary(g)),
        |g| Value::DateTime(i64::arbitrary(g)),
        |_| Value::Null,
        |g| {
            Value::Regex(Regex {
                pattern: arbitrary_key(g),
                options: "i".repeat(usize::arbitrary(g) % 2),
            })
        },
        |g| Value::JavaScript(arbitrary_string(g)),
        |g| Value::Int32(i32::arbitrary(g)),
        |g| {
            Value::Timestamp(Timestamp {
                time: u32::arbitrary(g),
                increment: u32::arbitrary(g),
            })
        },
        |g| Value::Int64(i64::arbitrary(g)),
        |g| {
            let mut bytes = [0u8; 16];
            for b in bytes.iter_mut() {
                *b = u8::arbitrary(g);
            }
            Value::Decimal128(bytes)
        },
        |_| Value::MinKey,
        |_| Value::MaxKey,
    ];

    if depth == 0 {
        return g.choose(scalars).unwrap()(g);
    }
    match usize::arbitrary(g) % 8 {
        0 => Value::Document(arbitrary_document(g, depth - 1)),
        1 => {
            let len = usize::arbitrary(g) % 4;
            Value::Array((0..len).map(|_| arbitrary_value(g, depth - 1)).collect())
        }
        _ => g.choose(scalars).unwrap()(g),
    }
}

#[test]
fn fuzz_decode_of_encode_is_identity() {
    fn inner(doc: ArbitraryDocument) -> bool {
        let bytes = doc.0.to_vec().unwrap();
        let decoded = Document::from_slice(&bytes).unwrap();
        decoded == doc.0
    }

    QuickCheck::new()
        .gen(Gen::new(50))
        .tests(500)
        .quickcheck(inner as fn(ArbitraryDocument) -> bool);
}

#[test]
fn fuzz_encode_of_decode_is_identity() {
    fn inner(doc: ArbitraryDocument) -> bool {
        // Any encoder output is a well-formed buffer; decode and re-encode
        // must reproduce it byte-for-byte.
        let bytes = doc.0.to_vec().unwrap();
        let reencoded = Document::from_slice(&bytes).unwrap().to_vec().unwrap();
        reencoded == bytes
    }

    QuickCheck::new()
        .gen(Gen::new(50))
        .tests(500)
        .quickcheck(inner as fn(ArbitraryDocument) -> bool);
}

#[test]
fn fuzz_decoder_never_panics_on_mutation() {
    fn inner(doc: ArbitraryDocument, flips: Vec<(usize, u8)>) -> bool {
        let mut bytes = doc.0.to_vec().unwrap();
        for (at, byte) in flips {
            let len = bytes.len();
            bytes[at % len] = byte;
        }
        // Either outcome is fine; reaching it without panicking is the test.
        let _ = Document::from_slice(&bytes);
        true
    }

    QuickCheck::new()
        .gen(Gen::new(50))
        .tests(500)
        .quickcheck(inner as fn(ArbitraryDocument, Vec<(usize, u8)>) -> bool);
}
