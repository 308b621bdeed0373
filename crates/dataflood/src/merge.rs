// Merging two models produces one that matches the union of both sample
// populations. Bounds widen, frequency maps sum, required intersects.
// `format` and `pattern` are order-sensitive: when both sides carry a
// value the left side wins, so merge(a, b) and merge(b, a) may differ.

use super::model::{Kind, Model};
use super::{Histogram, StringModel};
use itertools::{EitherOrBoth, Itertools};
use std::collections::BTreeSet;

const MAX_MERGED_BINS: usize = 20;

/// Merge `rhs` into `lhs`, yielding the union model.
pub fn merge(lhs: Model, rhs: Model) -> Model {
    // Differing (or composite) types promote to anyOf.
    match (lhs.kind, rhs.kind) {
        _ if !lhs.any_of.is_empty() || !rhs.any_of.is_empty() => merge_any_of(lhs, rhs),
        (Some(l), Some(r)) if l != r => {
            // Integer widens into number rather than splitting the union.
            if matches!(
                (l, r),
                (Kind::Integer, Kind::Number) | (Kind::Number, Kind::Integer)
            ) {
                let mut merged = merge_same_kind(lhs, rhs);
                merged.kind = Some(Kind::Number);
                merged
            } else {
                merge_any_of(lhs, rhs)
            }
        }
        _ => merge_same_kind(lhs, rhs),
    }
}

fn merge_any_of(lhs: Model, rhs: Model) -> Model {
    let mut members: Vec<Model> = Vec::new();
    for side in [lhs, rhs] {
        if side.any_of.is_empty() {
            members.push(side);
        } else {
            members.extend(side.any_of);
        }
    }

    // Fold members of the same kind together, then deduplicate by
    // canonical form.
    let mut folded: Vec<Model> = Vec::new();
    for member in members {
        match folded
            .iter_mut()
            .find(|m| m.kind == member.kind && m.kind.is_some())
        {
            Some(existing) => {
                let merged = merge_same_kind(existing.clone(), member);
                *existing = merged;
            }
            None => folded.push(member),
        }
    }
    let mut seen = BTreeSet::new();
    folded.retain(|m| seen.insert(m.canonical_json().to_string()));

    if folded.len() == 1 {
        return folded.pop().unwrap();
    }
    Model {
        any_of: folded,
        ..Model::default()
    }
}

fn merge_same_kind(lhs: Model, rhs: Model) -> Model {
    let mut out = Model {
        schema: lhs.schema.or(rhs.schema),
        kind: lhs.kind.or(rhs.kind),
        ..Model::default()
    };

    // Numeric bounds widen.
    out.minimum = min_option(lhs.minimum, rhs.minimum);
    out.maximum = max_option(lhs.maximum, rhs.maximum);
    out.multiple_of = match (lhs.multiple_of, rhs.multiple_of) {
        (Some(l), Some(r)) if l == r => Some(l),
        (Some(_), Some(_)) => None,
        (l, r) => l.or(r),
    };
    out.histogram = match (lhs.histogram, rhs.histogram) {
        (Some(l), Some(r)) => Some(Histogram::merge(&l, &r, MAX_MERGED_BINS)),
        (l, r) => l.or(r),
    };

    // String bounds widen; format and pattern keep the first non-null.
    out.min_length = min_option_usize(lhs.min_length, rhs.min_length);
    out.max_length = max_option_usize(lhs.max_length, rhs.max_length);
    out.format = lhs.format.or(rhs.format);
    out.pattern = lhs.pattern.or(rhs.pattern);
    out.string_model = match (lhs.string_model, rhs.string_model) {
        (Some(l), Some(r)) => Some(StringModel::merge(&l, &r)),
        (l, r) => l.or(r),
    };

    // Enum union preserves left-then-right first-seen order.
    out.enum_values = lhs.enum_values;
    for value in rhs.enum_values {
        if !out.enum_values.contains(&value) {
            out.enum_values.push(value);
        }
    }

    // Object properties: union keys, recursively merging where both sides
    // describe the property. Required is the intersection, restricted to
    // keys which remain.
    let rhs_required: BTreeSet<String> = rhs.required.into_iter().collect();
    out.properties = itertools::merge_join_by(
        lhs.properties.into_iter(),
        rhs.properties.into_iter(),
        |(l, _), (r, _)| Ord::cmp(l, r),
    )
    .map(|eob| match eob {
        EitherOrBoth::Both((name, l), (_, r)) => (name, merge(l, r)),
        EitherOrBoth::Left((name, l)) => (name, l),
        EitherOrBoth::Right((name, r)) => (name, r),
    })
    .collect();
    out.required = lhs
        .required
        .into_iter()
        .filter(|name| rhs_required.contains(name) && out.properties.contains_key(name))
        .collect();

    // Arrays merge their item models and widen bounds.
    out.items = match (lhs.items, rhs.items) {
        (Some(l), Some(r)) => Some(Box::new(merge(*l, *r))),
        (l, r) => l.or(r),
    };
    out.min_items = min_option_usize(lhs.min_items, rhs.min_items);
    out.max_items = max_option_usize(lhs.max_items, rhs.max_items);
    out.unique_items = match (lhs.unique_items, rhs.unique_items) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (l, r) => l.or(r),
    };

    out.default = lhs.default.or(rhs.default);
    out.tides_config = lhs.tides_config.or(rhs.tides_config);

    out.relationships = lhs.relationships;
    for hint in rhs.relationships {
        if !out.relationships.iter().any(|r| r.field == hint.field) {
            out.relationships.push(hint);
        }
    }

    out
}

fn min_option(l: Option<f64>, r: Option<f64>) -> Option<f64> {
    match (l, r) {
        (Some(l), Some(r)) => Some(l.min(r)),
        (l, r) => l.or(r),
    }
}

fn max_option(l: Option<f64>, r: Option<f64>) -> Option<f64> {
    match (l, r) {
        (Some(l), Some(r)) => Some(l.max(r)),
        (l, r) => l.or(r),
    }
}

fn min_option_usize(l: Option<usize>, r: Option<usize>) -> Option<usize> {
    match (l, r) {
        (Some(l), Some(r)) => Some(l.min(r)),
        (l, r) => l.or(r),
    }
}

fn max_option_usize(l: Option<usize>, r: Option<usize>) -> Option<usize> {
    match (l, r) {
        (Some(l), Some(r)) => Some(l.max(r)),
        (l, r) => l.or(r),
    }
}
