// Projections are classified as inclusion (any truthy value) or exclusion
// (any falsy value); mixing the two is forbidden, except that `_id` may be
// toggled off inside an inclusion.

use crate::CommandError;
use bson::{Document, Value};

pub fn apply(doc: &Document, projection: &Document) -> anyhow::Result<Document> {
    if projection.is_empty() {
        return Ok(doc.clone());
    }

    let mut include = None;
    for (field, flag) in projection.iter() {
        let truthy = flag.is_truthy();
        if field == "_id" {
            continue;
        }
        match include {
            None => include = Some(truthy),
            Some(mode) if mode != truthy => {
                return Err(CommandError::bad_value(format!(
                    "cannot mix inclusion and exclusion in projection (field {field})"
                ))
                .into());
            }
            Some(_) => {}
        }
    }
    // A projection naming only `_id` classifies by its flag.
    let include = include.unwrap_or_else(|| {
        projection.get("_id").map_or(true, |flag| flag.is_truthy())
    });

    let id_included = projection
        .get("_id")
        .map_or(include || !projection.contains_key("_id"), |flag| flag.is_truthy());

    if include {
        let mut out = Document::new();
        if id_included {
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
        }
        for (field, flag) in projection.iter() {
            if field == "_id" || !flag.is_truthy() {
                continue;
            }
            if let Some(value) = doc.get_path(field) {
                out.set_path(field, value.clone());
            }
        }
        Ok(out)
    } else {
        let mut out = doc.clone();
        for (field, flag) in projection.iter() {
            if field == "_id" {
                continue;
            }
            if !flag.is_truthy() {
                out.remove_path(field);
            }
        }
        if !id_included {
            out.remove("_id");
        }
        Ok(out)
    }
}
