use super::{Document, Value};
use itertools::{EitherOrBoth, Itertools};
use std::cmp::Ordering;

// Rank of each type within the cross-type sort order. Values of different
// types order by rank; numeric types share a rank and compare by value.
fn type_rank(v: &Value) -> u8 {
    match v {
        Value::MinKey => 0,
        Value::Undefined => 1,
        Value::Null => 2,
        Value::Double(_) | Value::Int32(_) | Value::Int64(_) | Value::Decimal128(_) => 3,
        Value::String(_) => 4,
        Value::Document(_) => 5,
        Value::Array(_) => 6,
        Value::Binary(_) => 7,
        Value::ObjectId(_) => 8,
        Value::Boolean(_) => 9,
        Value::DateTime(_) => 10,
        Value::Timestamp(_) => 11,
        Value::Regex(_) => 12,
        Value::JavaScript(_) => 13,
        Value::JavaScriptWithScope(..) => 14,
        Value::MaxKey => 15,
    }
}

/// compare evaluates the deep ordering of `lhs` and `rhs`, establishing the
/// total order used by sorts and by `$min`/`$max` accumulators. Numeric
/// types compare by value across widths; other cross-type pairs order by a
/// fixed type ranking. Arrays and documents compare lexicographically.
pub fn compare(lhs: &Value, rhs: &Value) -> Ordering {
    match (type_rank(lhs), type_rank(rhs)) {
        (l, r) if l != r => l.cmp(&r),
        _ => compare_same_rank(lhs, rhs),
    }
}

fn compare_same_rank(lhs: &Value, rhs: &Value) -> Ordering {
    match (lhs, rhs) {
        (Value::Int32(l), Value::Int32(r)) => l.cmp(r),
        (Value::Int64(l), Value::Int64(r)) => l.cmp(r),
        (Value::Int32(l), Value::Int64(r)) => (*l as i64).cmp(r),
        (Value::Int64(l), Value::Int32(r)) => l.cmp(&(*r as i64)),
        (Value::Decimal128(l), Value::Decimal128(r)) => l.cmp(r),
        // Any other numeric pairing falls back to f64 comparison.
        (l, r) if l.is_number() || r.is_number() => {
            let (l, r) = (l.as_f64().unwrap_or(0.0), r.as_f64().unwrap_or(0.0));
            l.partial_cmp(&r).unwrap_or(Ordering::Equal)
        }
        (Value::String(l), Value::String(r)) => l.cmp(r),
        (Value::Document(l), Value::Document(r)) => compare_documents(l, r),
        (Value::Array(l), Value::Array(r)) => l
            .iter()
            .zip_longest(r.iter())
            .map(|eob| match eob {
                EitherOrBoth::Both(l, r) => compare(l, r),
                EitherOrBoth::Right(_) => Ordering::Less,
                EitherOrBoth::Left(_) => Ordering::Greater,
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),
        (Value::Binary(l), Value::Binary(r)) => l
            .subtype
            .cmp(&r.subtype)
            .then_with(|| l.bytes.cmp(&r.bytes)),
        (Value::ObjectId(l), Value::ObjectId(r)) => l.cmp(r),
        (Value::Boolean(l), Value::Boolean(r)) => l.cmp(r),
        (Value::DateTime(l), Value::DateTime(r)) => l.cmp(r),
        (Value::Timestamp(l), Value::Timestamp(r)) => l
            .time
            .cmp(&r.time)
            .then_with(|| l.increment.cmp(&r.increment)),
        (Value::Regex(l), Value::Regex(r)) => l
            .pattern
            .cmp(&r.pattern)
            .then_with(|| l.options.cmp(&r.options)),
        (Value::JavaScript(l), Value::JavaScript(r)) => l.cmp(r),
        (Value::JavaScriptWithScope(lc, ls), Value::JavaScriptWithScope(rc, rs)) => {
            lc.cmp(rc).then_with(|| compare_documents(ls, rs))
        }
        // Singleton types of equal rank.
        _ => Ordering::Equal,
    }
}

fn compare_documents(lhs: &Document, rhs: &Document) -> Ordering {
    lhs.iter()
        .zip_longest(rhs.iter())
        .map(|eob| match eob {
            EitherOrBoth::Both((lk, lv), (rk, rv)) => {
                lk.cmp(rk).then_with(|| compare(lv, rv))
            }
            EitherOrBoth::Right(_) => Ordering::Less,
            EitherOrBoth::Left(_) => Ordering::Greater,
        })
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}
