// Query preprocessing for generation: lift the `$seed`/`$entropy`
// generation parameters out of a filter, and derive per-field generation
// constraints from its comparison operators. The stripped filter is still
// applied in full as a post-filter, so constraints only need to steer the
// generator toward documents likely to survive it.

use bson::{value_to_json, Document, Value};
use dataflood::Constraint;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct PreparedQuery {
    /// The filter minus generation parameters.
    pub filter: Document,
    pub seed: Option<u64>,
    pub entropy: Option<f64>,
    pub constraints: BTreeMap<String, Constraint>,
}

pub fn prepare(query: &Document) -> PreparedQuery {
    let mut prepared = PreparedQuery::default();

    for (key, value) in query.iter() {
        match key {
            "$seed" | "_seed" => {
                prepared.seed = value.as_i64().map(|s| s as u64).or_else(|| {
                    value.as_f64().map(|f| f as i64 as u64)
                });
            }
            "$entropy" | "_entropy" => {
                prepared.entropy = value.as_f64();
            }
            _ => {
                prepared.filter.insert(key, value.clone());
            }
        }
    }

    collect_constraints(&prepared.filter, &mut prepared.constraints);
    prepared
}

fn collect_constraints(filter: &Document, out: &mut BTreeMap<String, Constraint>) {
    for (field, condition) in filter.iter() {
        // Logical connectives contribute through $and only: its branches
        // all apply, so their constraints do too.
        if field == "$and" {
            if let Some(branches) = condition.as_array() {
                for branch in branches.iter().filter_map(|b| b.as_document()) {
                    collect_constraints(branch, out);
                }
            }
            continue;
        }
        if field.starts_with('$') {
            continue;
        }

        let constraint = out.entry(field.to_owned()).or_default();
        match condition {
            Value::Document(spec) if spec.keys().any(|k| k.starts_with('$')) => {
                for (op, operand) in spec.iter() {
                    match op {
                        "$eq" => constraint.equals = Some(value_to_json(operand)),
                        "$gt" => {
                            constraint.minimum = operand.as_f64();
                            constraint.exclusive_minimum = true;
                        }
                        "$gte" => {
                            constraint.minimum = operand.as_f64();
                            constraint.exclusive_minimum = false;
                        }
                        "$lt" => {
                            constraint.maximum = operand.as_f64();
                            constraint.exclusive_maximum = true;
                        }
                        "$lte" => {
                            constraint.maximum = operand.as_f64();
                            constraint.exclusive_maximum = false;
                        }
                        "$in" => {
                            if let Some(allowed) = operand.as_array() {
                                constraint.one_of =
                                    allowed.iter().map(value_to_json).collect();
                            }
                        }
                        "$nin" => {
                            if let Some(denied) = operand.as_array() {
                                constraint.not_in =
                                    denied.iter().map(value_to_json).collect();
                            }
                        }
                        _ => {}
                    }
                }
            }
            // A scalar condition pins the field outright.
            scalar => constraint.equals = Some(value_to_json(scalar)),
        }
    }

    // Drop entries which gained no actual guidance (e.g. `$exists`-only).
    out.retain(|_, c| {
        c.equals.is_some()
            || c.minimum.is_some()
            || c.maximum.is_some()
            || !c.one_of.is_empty()
            || !c.not_in.is_empty()
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn lifts_generation_parameters() {
        let prepared = prepare(&doc! {
            "sector": "Tech",
            "$seed": 7,
            "$entropy": 0.5,
        });
        assert_eq!(prepared.seed, Some(7));
        assert_eq!(prepared.entropy, Some(0.5));
        // The stripped filter keeps only the real condition.
        assert_eq!(prepared.filter, doc! { "sector": "Tech" });
        assert_eq!(
            prepared.constraints["sector"].equals,
            Some(json!("Tech"))
        );
    }

    #[test]
    fn underscore_aliases_work_too() {
        let prepared = prepare(&doc! { "_seed": 42i64, "_entropy": 1.5 });
        assert_eq!(prepared.seed, Some(42));
        assert_eq!(prepared.entropy, Some(1.5));
        assert!(prepared.filter.is_empty());
    }

    #[test]
    fn operators_become_range_and_set_constraints() {
        let prepared = prepare(&doc! {
            "price": doc! { "$gt": 10, "$lte": 99 },
            "state": doc! { "$in": vec![Value::from("a"), Value::from("b")] },
            "kind": doc! { "$nin": vec![Value::from("junk")] },
        });

        let price = &prepared.constraints["price"];
        assert_eq!(price.minimum, Some(10.0));
        assert!(price.exclusive_minimum);
        assert_eq!(price.maximum, Some(99.0));
        assert!(!price.exclusive_maximum);

        assert_eq!(
            prepared.constraints["state"].one_of,
            vec![json!("a"), json!("b")]
        );
        assert_eq!(prepared.constraints["kind"].not_in, vec![json!("junk")]);
    }

    #[test]
    fn and_branches_contribute_constraints() {
        let prepared = prepare(&doc! {
            "$and": vec![
                Value::Document(doc! { "a": 1 }),
                Value::Document(doc! { "b": doc! { "$gte": 5 } }),
            ],
        });
        assert_eq!(prepared.constraints["a"].equals, Some(json!(1)));
        assert_eq!(prepared.constraints["b"].minimum, Some(5.0));
    }

    #[test]
    fn exists_only_conditions_yield_no_constraint() {
        let prepared = prepare(&doc! { "x": doc! { "$exists": true } });
        assert!(prepared.constraints.is_empty());
    }
}
