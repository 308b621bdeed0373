// Update operators: $set, $unset, $inc, $push, $pull, and whole-document
// replacement when no operator is present. Returns whether the document
// actually changed, which feeds the reported nModified.

use crate::CommandError;
use bson::{compare, Document, Value};
use std::cmp::Ordering;

pub fn apply(doc: &mut Document, update: &Document) -> anyhow::Result<bool> {
    let has_operators = update.keys().any(|k| k.starts_with('$'));
    if !has_operators {
        return Ok(replace(doc, update));
    }

    let mut changed = false;
    for (op, spec) in update.iter() {
        let spec = spec.as_document().ok_or_else(|| {
            CommandError::failed_to_parse(format!("update operator {op} expects a document"))
        })?;
        match op {
            "$set" => {
                for (path, value) in spec.iter() {
                    if doc.get_path(path) != Some(value) {
                        doc.set_path(path, value.clone());
                        changed = true;
                    }
                }
            }
            "$unset" => {
                for (path, _) in spec.iter() {
                    if doc.remove_path(path).is_some() {
                        changed = true;
                    }
                }
            }
            "$inc" => {
                for (path, delta) in spec.iter() {
                    let delta = delta.as_f64().ok_or_else(|| {
                        CommandError::type_mismatch(format!(
                            "$inc amount for {path} must be numeric"
                        ))
                    })?;
                    let next = match doc.get_path(path) {
                        None => number(delta),
                        Some(current) => {
                            let base = current.as_f64().ok_or_else(|| {
                                CommandError::type_mismatch(format!(
                                    "cannot $inc non-numeric field {path}"
                                ))
                            })?;
                            number(base + delta)
                        }
                    };
                    if delta != 0.0 || doc.get_path(path).is_none() {
                        changed = true;
                    }
                    doc.set_path(path, next);
                }
            }
            "$push" => {
                for (path, value) in spec.iter() {
                    match doc.get_path(path).cloned() {
                        None => {
                            doc.set_path(path, Value::Array(vec![value.clone()]));
                            changed = true;
                        }
                        Some(Value::Array(mut items)) => {
                            items.push(value.clone());
                            doc.set_path(path, Value::Array(items));
                            changed = true;
                        }
                        Some(_) => {
                            return Err(CommandError::type_mismatch(format!(
                                "cannot $push to non-array field {path}"
                            ))
                            .into());
                        }
                    }
                }
            }
            "$pull" => {
                for (path, needle) in spec.iter() {
                    if let Some(Value::Array(items)) = doc.get_path(path).cloned() {
                        let kept: Vec<Value> = items
                            .iter()
                            .filter(|item| compare(item, needle) != Ordering::Equal)
                            .cloned()
                            .collect();
                        if kept.len() != items.len() {
                            changed = true;
                        }
                        doc.set_path(path, Value::Array(kept));
                    }
                }
            }
            other => {
                return Err(CommandError::failed_to_parse(format!(
                    "unsupported update operator {other}"
                ))
                .into());
            }
        }
    }
    Ok(changed)
}

// Full replacement keeps the existing `_id`.
fn replace(doc: &mut Document, update: &Document) -> bool {
    let id = doc.get("_id").cloned();
    let mut next: Document = update
        .iter()
        .filter(|(k, _)| *k != "_id")
        .map(|(k, v)| (k.to_owned(), v.clone()))
        .collect();
    if let Some(id) = id {
        let mut with_id = Document::new();
        with_id.insert("_id", id);
        for (k, v) in next.into_iter() {
            with_id.insert(k, v);
        }
        next = with_id;
    }
    if *doc == next {
        return false;
    }
    *doc = next;
    true
}

// Integral results stay integers, like driver-side arithmetic expects.
fn number(v: f64) -> Value {
    if v.fract() == 0.0 && (i32::MIN as f64..=i32::MAX as f64).contains(&v) {
        Value::Int32(v as i32)
    } else if v.fract() == 0.0 && (i64::MIN as f64..=i64::MAX as f64).contains(&v) {
        Value::Int64(v as i64)
    } else {
        Value::Double(v)
    }
}
