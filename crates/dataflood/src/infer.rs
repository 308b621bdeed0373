// Schema inference: derive a Model from a batch of documents. Each
// document nudges the model outward, property by property, so the result
// describes the union of everything observed.

use super::enum_detect::{detect_enum, EnumConfig};
use super::model::{Kind, Model, Relationship, RelationshipKind};
use super::string_model::StringModel;
use super::{Error, Format, Histogram, Result};
use bson::Value;
use lazy_static::lazy_static;
use rand::{rngs::StdRng, SeedableRng};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug)]
pub struct InferConfig {
    pub detect_formats: bool,
    pub detect_patterns: bool,
    pub detect_enums: bool,
    pub detect_relationships: bool,
    pub histogram_bins: usize,
    /// Numeric fields with fewer samples than this get plain bounds only.
    pub histogram_min_samples: usize,
    pub enum_config: EnumConfig,
    /// Seeds the reservoir sampler so inference over a fixed batch is
    /// reproducible.
    pub sample_seed: u64,
}

impl Default for InferConfig {
    fn default() -> Self {
        Self {
            detect_formats: true,
            detect_patterns: true,
            detect_enums: true,
            detect_relationships: true,
            histogram_bins: 10,
            histogram_min_samples: 10,
            enum_config: EnumConfig::default(),
            sample_seed: 0,
        }
    }
}

lazy_static! {
    static ref FOREIGN_KEY_RE: Regex =
        Regex::new(r"(?i)^(parent_|child_|reference_|related_)?.+_(id|ref|key)$")
            .expect("is a valid regex");
}

/// Infer a model describing every document in `docs`.
pub fn infer(docs: &[Value], config: &InferConfig) -> Result<Model> {
    if docs.is_empty() {
        return Err(Error::EmptyInput);
    }
    tracing::debug!(documents = docs.len(), "inferring model");
    let mut rng = StdRng::seed_from_u64(config.sample_seed);
    let refs: Vec<&Value> = docs.iter().collect();
    Ok(infer_values(&refs, None, config, &mut rng))
}

/// The semantic type a BSON value observes into model space. Extended
/// types fold onto the seven JSON-schema kinds: ids, regexes, and binary
/// read as strings, datetimes as date-time-formatted strings, timestamps
/// as integers.
fn kind_of(value: &Value) -> Kind {
    match value {
        Value::Document(_) => Kind::Object,
        Value::Array(_) => Kind::Array,
        Value::String(_)
        | Value::JavaScript(_)
        | Value::JavaScriptWithScope(..)
        | Value::ObjectId(_)
        | Value::Regex(_)
        | Value::Binary(_)
        | Value::DateTime(_) => Kind::String,
        Value::Int32(_) | Value::Int64(_) | Value::Timestamp(_) => Kind::Integer,
        Value::Double(f) => {
            if f.fract() == 0.0 {
                Kind::Integer
            } else {
                Kind::Number
            }
        }
        Value::Decimal128(_) => Kind::Number,
        Value::Boolean(_) => Kind::Boolean,
        Value::Null | Value::Undefined | Value::MinKey | Value::MaxKey => Kind::Null,
    }
}

fn infer_values(
    values: &[&Value],
    field: Option<&str>,
    config: &InferConfig,
    rng: &mut StdRng,
) -> Model {
    let mut by_kind: BTreeMap<Kind, Vec<&Value>> = BTreeMap::new();
    for v in values {
        by_kind.entry(kind_of(v)).or_default().push(*v);
    }

    // Integers appearing beside fractional numbers widen to one number model.
    if by_kind.contains_key(&Kind::Integer) && by_kind.contains_key(&Kind::Number) {
        let mut merged = by_kind.remove(&Kind::Integer).unwrap();
        merged.extend(by_kind.remove(&Kind::Number).unwrap());
        by_kind.insert(Kind::Number, merged);
    }

    if by_kind.len() == 1 {
        let (kind, members) = by_kind.into_iter().next().unwrap();
        return infer_typed(kind, &members, field, config, rng);
    }
    Model {
        any_of: by_kind
            .into_iter()
            .map(|(kind, members)| infer_typed(kind, &members, field, config, rng))
            .collect(),
        ..Model::default()
    }
}

fn infer_typed(
    kind: Kind,
    values: &[&Value],
    field: Option<&str>,
    config: &InferConfig,
    rng: &mut StdRng,
) -> Model {
    match kind {
        Kind::Object => infer_object(values, config, rng),
        Kind::Array => infer_array(values, field, config, rng),
        Kind::String => infer_string(values, field, config, rng),
        Kind::Integer | Kind::Number => infer_numeric(kind, values, config),
        Kind::Boolean => Model::typed(Kind::Boolean),
        Kind::Null => Model::typed(Kind::Null),
    }
}

fn infer_object(values: &[&Value], config: &InferConfig, rng: &mut StdRng) -> Model {
    let docs: Vec<&bson::Document> = values.iter().filter_map(|v| v.as_document()).collect();

    let mut names: BTreeSet<&str> = BTreeSet::new();
    for doc in &docs {
        names.extend(doc.keys());
    }

    let mut model = Model::typed(Kind::Object);
    for name in names {
        let observed: Vec<&Value> = docs.iter().filter_map(|d| d.get(name)).collect();

        // Required demands presence in every single document.
        if observed.len() == docs.len() {
            model.required.push(name.to_owned());
        }

        // Property models describe the non-null observations; an all-null
        // property stays null-typed.
        let non_null: Vec<&Value> = observed
            .iter()
            .copied()
            .filter(|v| kind_of(v) != Kind::Null)
            .collect();
        let property = if non_null.is_empty() {
            Model::typed(Kind::Null)
        } else {
            infer_values(&non_null, Some(name), config, rng)
        };

        if config.detect_relationships {
            if let Some(relationship) = detect_relationship(name, &non_null) {
                model.relationships.push(relationship);
            }
        }
        model.properties.insert(name.to_owned(), property);
    }
    model
}

fn detect_relationship(name: &str, values: &[&Value]) -> Option<Relationship> {
    if values.is_empty() || !FOREIGN_KEY_RE.is_match(name) {
        return None;
    }
    let distinct: BTreeSet<String> = values
        .iter()
        .map(|v| bson::value_to_json(v).to_string())
        .collect();
    let unique_ratio = distinct.len() as f64 / values.len() as f64;
    if unique_ratio <= 0.5 {
        return None;
    }

    let lower = name.to_lowercase();
    let relationship_type = if lower.starts_with("parent_") {
        RelationshipKind::Parent
    } else if lower.starts_with("child_") {
        RelationshipKind::Child
    } else {
        RelationshipKind::Reference
    };
    let stem = lower
        .trim_start_matches("parent_")
        .trim_start_matches("child_")
        .trim_start_matches("reference_")
        .trim_start_matches("related_");
    let referenced_entity = stem
        .rsplit_once('_')
        .map(|(entity, _)| entity.to_owned())
        .unwrap_or_else(|| stem.to_owned());

    Some(Relationship {
        field: name.to_owned(),
        kind: "foreign_key".to_owned(),
        confidence: unique_ratio,
        referenced_entity,
        relationship_type,
    })
}

fn infer_array(
    values: &[&Value],
    field: Option<&str>,
    config: &InferConfig,
    rng: &mut StdRng,
) -> Model {
    let arrays: Vec<&[Value]> = values.iter().filter_map(|v| v.as_array()).collect();

    let mut model = Model::typed(Kind::Array);
    model.min_items = arrays.iter().map(|a| a.len()).min();
    model.max_items = arrays.iter().map(|a| a.len()).max();

    // Any array whose elements are all distinct marks the field unique.
    let has_distinct = arrays.iter().any(|a| {
        !a.is_empty() && {
            let canonical: BTreeSet<String> = a
                .iter()
                .map(|v| bson::value_to_json(v).to_string())
                .collect();
            canonical.len() == a.len()
        }
    });
    if has_distinct {
        model.unique_items = Some(true);
    }

    let elements: Vec<&Value> = arrays.iter().flat_map(|a| a.iter()).collect();
    if !elements.is_empty() {
        model.items = Some(Box::new(infer_values(&elements, field, config, rng)));
    }
    model
}

fn infer_string(
    values: &[&Value],
    field: Option<&str>,
    config: &InferConfig,
    rng: &mut StdRng,
) -> Model {
    // Extended types read through their JSON string renderings.
    let contents: Vec<String> = values
        .iter()
        .map(|v| match bson::value_to_json(v) {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .collect();
    let refs: Vec<&str> = contents.iter().map(|s| s.as_str()).collect();

    let mut model = Model::typed(Kind::String);
    model.min_length = refs.iter().map(|s| s.chars().count()).min();
    model.max_length = refs.iter().map(|s| s.chars().count()).max();

    if config.detect_enums {
        let decision = detect_enum(&refs, field.unwrap_or(""), rng, &config.enum_config);
        if decision.should_create_enum {
            model.enum_values = decision.enum_values;
            return model;
        }
    }

    // A format applies only when every value matches the same one.
    if config.detect_formats {
        if let Some(format) = Format::detect(refs[0]) {
            if refs.iter().all(|v| format.validate(v)) {
                model.format = Some(format);
                return model;
            }
        }
    }

    if config.detect_patterns {
        model.pattern = super::patterns::detect(&refs).map(str::to_owned);
    }

    model.string_model = Some(StringModel::build(&refs));
    model
}

fn infer_numeric(kind: Kind, values: &[&Value], config: &InferConfig) -> Model {
    let samples: Vec<f64> = values.iter().filter_map(|v| numeric_value(v)).collect();

    let mut model = Model::typed(kind);
    if samples.is_empty() {
        return model;
    }
    model.minimum = Some(samples.iter().copied().fold(f64::INFINITY, f64::min));
    model.maximum = Some(samples.iter().copied().fold(f64::NEG_INFINITY, f64::max));

    if kind == Kind::Integer {
        model.multiple_of = detect_multiple_of(&samples);
    }
    if samples.len() >= config.histogram_min_samples {
        model.histogram = Histogram::build(&samples, config.histogram_bins);
    }
    model
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Double(f) => Some(*f),
        Value::Int32(n) => Some(*n as f64),
        Value::Int64(n) => Some(*n as f64),
        Value::Timestamp(ts) => Some((((ts.time as u64) << 32) | ts.increment as u64) as f64),
        _ => None,
    }
}

// The GCD of consecutive differences, when greater than one and every
// value is itself a multiple of it.
fn detect_multiple_of(samples: &[f64]) -> Option<f64> {
    let mut sorted: Vec<i64> = samples.iter().map(|v| *v as i64).collect();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() < 2 {
        return None;
    }

    let gcd = sorted
        .windows(2)
        .map(|w| (w[1] - w[0]).unsigned_abs())
        .fold(0u64, gcd_u64);
    if gcd > 1 && sorted.iter().all(|v| v.rem_euclid(gcd as i64) == 0) {
        Some(gcd as f64)
    } else {
        None
    }
}

fn gcd_u64(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd_u64(b, a % b)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    fn infer_docs(docs: Vec<bson::Document>) -> Model {
        let values: Vec<Value> = docs.into_iter().map(Value::Document).collect();
        infer(&values, &InferConfig::default()).unwrap()
    }

    #[test]
    fn two_documents_union() {
        let model = infer_docs(vec![
            doc! { "a": 1, "b": "x" },
            doc! { "a": 2, "b": "y", "c": true },
        ]);

        assert_eq!(model.kind, Some(Kind::Object));
        assert_eq!(model.required, vec!["a".to_owned(), "b".to_owned()]);

        let a = &model.properties["a"];
        assert_eq!(a.kind, Some(Kind::Integer));
        assert_eq!(a.minimum, Some(1.0));
        assert_eq!(a.maximum, Some(2.0));

        let b = &model.properties["b"];
        assert_eq!(b.kind, Some(Kind::String));
        assert_eq!(b.min_length, Some(1));
        assert_eq!(b.max_length, Some(1));

        assert_eq!(model.properties["c"].kind, Some(Kind::Boolean));
    }

    #[test]
    fn empty_batch_is_an_error() {
        assert!(matches!(
            infer(&[], &InferConfig::default()),
            Err(Error::EmptyInput)
        ));
    }

    #[test]
    fn mixed_root_types_become_any_of() {
        let model = infer(
            &[Value::from("text"), Value::from(4), Value::Boolean(true)],
            &InferConfig::default(),
        )
        .unwrap();

        assert!(model.kind.is_none());
        let kinds: Vec<Option<Kind>> = model.any_of.iter().map(|m| m.kind).collect();
        assert!(kinds.contains(&Some(Kind::String)));
        assert!(kinds.contains(&Some(Kind::Integer)));
        assert!(kinds.contains(&Some(Kind::Boolean)));
    }

    #[test]
    fn fractional_values_widen_integers_to_number() {
        let model = infer(
            &[Value::from(1), Value::from(2.5), Value::from(3)],
            &InferConfig::default(),
        )
        .unwrap();
        assert_eq!(model.kind, Some(Kind::Number));
        assert_eq!(model.minimum, Some(1.0));
        assert_eq!(model.maximum, Some(3.0));
    }

    #[test]
    fn nulls_are_excluded_from_property_models() {
        let model = infer_docs(vec![
            doc! { "x": 5 },
            doc! { "x": bson::Value::Null },
            doc! { "x": 7 },
        ]);
        let x = &model.properties["x"];
        assert_eq!(x.kind, Some(Kind::Integer));
        assert_eq!(x.minimum, Some(5.0));
        // Present in every document, nulls included.
        assert_eq!(model.required, vec!["x".to_owned()]);
    }

    #[test]
    fn consistent_dates_pin_the_format() {
        let model = infer_docs(vec![
            doc! { "day": "2024-01-02" },
            doc! { "day": "2024-02-03" },
            doc! { "day": "2024-03-04" },
        ]);
        assert_eq!(model.properties["day"].format, Some(Format::Date));
        assert!(model.properties["day"].string_model.is_none());
    }

    #[test]
    fn ten_samples_build_a_histogram() {
        let values: Vec<Value> = (1..=10).map(Value::from).collect();
        let model = infer(&values, &InferConfig::default()).unwrap();

        let histogram = model.histogram.expect("ten samples warrant a histogram");
        assert_eq!(histogram.bins.len(), 10);
        assert_eq!(histogram.total_count, 10);

        // Nine samples do not.
        let fewer: Vec<Value> = (1..=9).map(Value::from).collect();
        let model = infer(&fewer, &InferConfig::default()).unwrap();
        assert!(model.histogram.is_none());
    }

    #[test]
    fn multiples_are_detected() {
        let values: Vec<Value> = [10, 20, 40, 70].into_iter().map(Value::from).collect();
        let model = infer(&values, &InferConfig::default()).unwrap();
        assert_eq!(model.multiple_of, Some(10.0));

        let values: Vec<Value> = [3, 7, 11].into_iter().map(Value::from).collect();
        let model = infer(&values, &InferConfig::default()).unwrap();
        assert_eq!(model.multiple_of, None);
    }

    #[test]
    fn array_bounds_and_uniqueness() {
        let model = infer_docs(vec![
            doc! { "tags": vec![Value::from("a"), Value::from("b")] },
            doc! { "tags": vec![Value::from("c")] },
        ]);
        let tags = &model.properties["tags"];
        assert_eq!(tags.kind, Some(Kind::Array));
        assert_eq!(tags.min_items, Some(1));
        assert_eq!(tags.max_items, Some(2));
        assert_eq!(tags.unique_items, Some(true));
        assert_eq!(
            tags.items.as_ref().unwrap().kind,
            Some(Kind::String)
        );
    }

    #[test]
    fn foreign_key_names_yield_relationship_hints() {
        let docs: Vec<bson::Document> = (0..8)
            .map(|i| doc! { "customer_id": format!("c-{i}"), "note": "x" })
            .collect();
        let model = infer_docs(docs);

        assert_eq!(model.relationships.len(), 1);
        let hint = &model.relationships[0];
        assert_eq!(hint.field, "customer_id");
        assert_eq!(hint.kind, "foreign_key");
        assert_eq!(hint.referenced_entity, "customer");
        assert_eq!(hint.relationship_type, RelationshipKind::Reference);
        assert!(hint.confidence > 0.5);
    }

    #[test]
    fn object_ids_observe_as_strings() {
        let docs = vec![doc! { "_id": bson::ObjectId::new() }];
        let model = infer_docs(docs);
        assert_eq!(model.properties["_id"].kind, Some(Kind::String));
        assert_eq!(model.properties["_id"].min_length, Some(24));
    }
}
