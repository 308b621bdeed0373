// Query match semantics: a document matches iff every top-level condition
// holds. Used as the post-filter over generator output, by updates and
// deletes, and by the `$match` aggregation stage.

use bson::{compare, Document, Value};
use std::cmp::Ordering;

pub fn matches(doc: &Document, query: &Document) -> bool {
    query.iter().all(|(key, condition)| match key {
        "$and" => as_queries(condition)
            .map_or(false, |qs| qs.iter().all(|q| matches(doc, q))),
        "$or" => as_queries(condition)
            .map_or(false, |qs| qs.iter().any(|q| matches(doc, q))),
        "$nor" => as_queries(condition)
            .map_or(false, |qs| !qs.iter().any(|q| matches(doc, q))),
        "$not" => condition
            .as_document()
            .map_or(false, |q| !matches(doc, q)),
        field => field_matches(doc.get_path(field), condition),
    })
}

fn as_queries(value: &Value) -> Option<Vec<&Document>> {
    let items = value.as_array()?;
    items.iter().map(|v| v.as_document()).collect()
}

fn field_matches(actual: Option<&Value>, condition: &Value) -> bool {
    match condition {
        Value::Document(spec) if is_operator_object(spec) => spec
            .iter()
            .all(|(op, operand)| operator_matches(actual, op, operand)),
        // A scalar (or plain document) condition is strict equality.
        expected => actual.map_or(false, |v| compare(v, expected) == Ordering::Equal),
    }
}

fn is_operator_object(spec: &Document) -> bool {
    !spec.is_empty() && spec.keys().all(|k| k.starts_with('$'))
}

fn operator_matches(actual: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$eq" => actual.map_or(false, |v| compare(v, operand) == Ordering::Equal),
        "$ne" => actual.map_or(true, |v| compare(v, operand) != Ordering::Equal),
        "$gt" => actual.map_or(false, |v| compare(v, operand) == Ordering::Greater),
        "$gte" => actual.map_or(false, |v| compare(v, operand) != Ordering::Less),
        "$lt" => actual.map_or(false, |v| compare(v, operand) == Ordering::Less),
        "$lte" => actual.map_or(false, |v| compare(v, operand) != Ordering::Greater),
        "$in" => match (actual, operand.as_array()) {
            (Some(v), Some(allowed)) => allowed
                .iter()
                .any(|candidate| compare(v, candidate) == Ordering::Equal),
            _ => false,
        },
        "$nin" => match operand.as_array() {
            Some(denied) => actual.map_or(true, |v| {
                !denied
                    .iter()
                    .any(|candidate| compare(v, candidate) == Ordering::Equal)
            }),
            None => false,
        },
        "$exists" => {
            let wanted = operand.is_truthy();
            actual.is_some() == wanted
        }
        "$type" => actual.map_or(false, |v| type_matches(v, operand)),
        "$regex" => match actual {
            Some(Value::String(s)) => regex_for(operand)
                .map_or(false, |re| re.is_match(s)),
            _ => false,
        },
        "$size" => match (actual, operand.as_i64()) {
            (Some(Value::Array(items)), Some(n)) => items.len() as i64 == n,
            _ => false,
        },
        "$all" => match (actual, operand.as_array()) {
            (Some(Value::Array(items)), Some(wanted)) => wanted.iter().all(|w| {
                items.iter().any(|item| compare(item, w) == Ordering::Equal)
            }),
            _ => false,
        },
        // `$options` rides alongside `$regex` and is consumed there.
        "$options" => true,
        _ => false,
    }
}

fn type_matches(value: &Value, operand: &Value) -> bool {
    match operand {
        Value::String(alias) => value.type_name() == alias || alias == "number" && value.is_number(),
        other => other
            .as_i64()
            .map_or(false, |code| value.element_type() as i64 == code),
    }
}

fn regex_for(operand: &Value) -> Option<regex::Regex> {
    let (pattern, options) = match operand {
        Value::String(p) => (p.as_str(), ""),
        Value::Regex(r) => (r.pattern.as_str(), r.options.as_str()),
        _ => return None,
    };
    let mut builder = regex::RegexBuilder::new(pattern);
    builder.case_insensitive(options.contains('i'));
    builder.multi_line(options.contains('m'));
    builder.dot_matches_new_line(options.contains('s'));
    builder.build().ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    fn sample() -> Document {
        doc! {
            "name": "widget",
            "qty": 25,
            "tags": vec![Value::from("red"), Value::from("blank")],
            "dim": doc! { "h": 10, "w": 15 },
        }
    }

    #[test]
    fn scalar_equality_and_dotted_paths() {
        assert!(matches(&sample(), &doc! { "name": "widget" }));
        assert!(!matches(&sample(), &doc! { "name": "gadget" }));
        assert!(matches(&sample(), &doc! { "dim.h": 10 }));
        assert!(!matches(&sample(), &doc! { "dim.h": 11 }));
        assert!(!matches(&sample(), &doc! { "missing": 1 }));
    }

    #[test]
    fn comparison_operators() {
        assert!(matches(&sample(), &doc! { "qty": doc! { "$gt": 20 } }));
        assert!(matches(&sample(), &doc! { "qty": doc! { "$gte": 25 } }));
        assert!(matches(&sample(), &doc! { "qty": doc! { "$lt": 30, "$gt": 10 } }));
        assert!(!matches(&sample(), &doc! { "qty": doc! { "$lt": 25 } }));
        assert!(matches(&sample(), &doc! { "qty": doc! { "$ne": 24 } }));
        // Numeric comparison crosses widths.
        assert!(matches(&sample(), &doc! { "qty": doc! { "$eq": 25.0 } }));
    }

    #[test]
    fn set_and_array_operators() {
        assert!(matches(
            &sample(),
            &doc! { "qty": doc! { "$in": vec![Value::from(10), Value::from(25)] } }
        ));
        assert!(matches(
            &sample(),
            &doc! { "qty": doc! { "$nin": vec![Value::from(1)] } }
        ));
        assert!(matches(&sample(), &doc! { "tags": doc! { "$size": 2 } }));
        assert!(matches(
            &sample(),
            &doc! { "tags": doc! { "$all": vec![Value::from("red")] } }
        ));
        assert!(!matches(
            &sample(),
            &doc! { "tags": doc! { "$all": vec![Value::from("red"), Value::from("blue")] } }
        ));
        // A missing field satisfies $nin and $ne.
        assert!(matches(
            &sample(),
            &doc! { "missing": doc! { "$nin": vec![Value::from(1)] } }
        ));
    }

    #[test]
    fn existence_type_and_regex() {
        assert!(matches(&sample(), &doc! { "name": doc! { "$exists": true } }));
        assert!(matches(&sample(), &doc! { "nope": doc! { "$exists": false } }));
        assert!(matches(&sample(), &doc! { "qty": doc! { "$type": "int" } }));
        assert!(matches(&sample(), &doc! { "qty": doc! { "$type": 16 } }));
        assert!(matches(&sample(), &doc! { "qty": doc! { "$type": "number" } }));
        assert!(matches(
            &sample(),
            &doc! { "name": doc! { "$regex": "^wid" } }
        ));
        assert!(matches(
            &sample(),
            &doc! { "name": doc! { "$regex": "^WID", "$options": "i" } }
        ));
        assert!(!matches(
            &sample(),
            &doc! { "name": doc! { "$regex": "^WID" } }
        ));
    }

    #[test]
    fn logical_connectives() {
        let and = doc! { "$and": vec![
            Value::Document(doc! { "qty": doc! { "$gt": 10 } }),
            Value::Document(doc! { "name": "widget" }),
        ] };
        assert!(matches(&sample(), &and));

        let or = doc! { "$or": vec![
            Value::Document(doc! { "qty": 1 }),
            Value::Document(doc! { "name": "widget" }),
        ] };
        assert!(matches(&sample(), &or));

        let nor = doc! { "$nor": vec![
            Value::Document(doc! { "qty": 1 }),
            Value::Document(doc! { "name": "gadget" }),
        ] };
        assert!(matches(&sample(), &nor));

        let not = doc! { "$not": doc! { "qty": 1 } };
        assert!(matches(&sample(), &not));
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(matches(&sample(), &doc! {}));
    }
}
