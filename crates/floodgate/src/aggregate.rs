// Aggregation: an ordered list of stages executed over generator output.
// Stages transform a materialized Vec<Document>; the executor aborts if
// any intermediate result exceeds the configured ceiling.

use crate::{collection::sort_documents, matcher, projection, App, Collection, CommandError, FindOptions};
use bson::{compare, Document, Value};
use indexmap::IndexMap;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use time::OffsetDateTime;

pub fn execute(
    app: &App,
    database: &str,
    mut docs: Vec<Document>,
    pipeline: &[Document],
) -> anyhow::Result<Vec<Document>> {
    for stage_doc in pipeline {
        let mut stages = stage_doc.iter();
        let (name, spec) = stages.next().ok_or_else(|| {
            CommandError::failed_to_parse("pipeline stage must have exactly one field")
        })?;
        if stages.next().is_some() {
            return Err(CommandError::failed_to_parse(format!(
                "pipeline stage {name} must have exactly one field"
            ))
            .into());
        }

        docs = apply_stage(app, database, docs, name, spec)?;
        if docs.len() > app.config.aggregate_ceiling {
            return Err(CommandError::exceeded_limit(format!(
                "stage {name} produced {} documents, over the {} ceiling",
                docs.len(),
                app.config.aggregate_ceiling
            ))
            .into());
        }
    }
    Ok(docs)
}

fn apply_stage(
    app: &App,
    database: &str,
    docs: Vec<Document>,
    name: &str,
    spec: &Value,
) -> anyhow::Result<Vec<Document>> {
    match name {
        "$match" => {
            let query = expect_document(name, spec)?;
            Ok(docs
                .into_iter()
                .filter(|doc| matcher::matches(doc, query))
                .collect())
        }
        "$project" => project(docs, expect_document(name, spec)?),
        "$group" => group(docs, expect_document(name, spec)?),
        "$sort" => {
            let mut docs = docs;
            sort_documents(&mut docs, expect_document(name, spec)?);
            Ok(docs)
        }
        "$limit" => {
            let n = expect_non_negative(name, spec)?;
            Ok(docs.into_iter().take(n).collect())
        }
        "$skip" => {
            let n = expect_non_negative(name, spec)?;
            Ok(docs.into_iter().skip(n).collect())
        }
        "$unwind" => unwind(docs, spec),
        "$lookup" => lookup(app, database, docs, expect_document(name, spec)?),
        "$addFields" | "$set" => add_fields(docs, expect_document(name, spec)?),
        "$unset" => unset(docs, spec),
        "$replaceRoot" => {
            let spec = expect_document(name, spec)?;
            let new_root = spec
                .get("newRoot")
                .ok_or_else(|| CommandError::failed_to_parse("$replaceRoot needs newRoot"))?;
            replace_root(docs, new_root)
        }
        "$replaceWith" => replace_root(docs, spec),
        "$count" => {
            let field = spec
                .as_str()
                .ok_or_else(|| CommandError::failed_to_parse("$count takes a field name"))?;
            let mut out = Document::new();
            out.insert(field, docs.len() as i64);
            Ok(vec![out])
        }
        "$facet" => facet(app, database, docs, expect_document(name, spec)?),
        "$bucket" => bucket(docs, expect_document(name, spec)?),
        "$bucketAuto" => bucket_auto(docs, expect_document(name, spec)?),
        "$sample" => {
            let spec = expect_document(name, spec)?;
            let size = spec
                .get("size")
                .and_then(Value::as_i64)
                .ok_or_else(|| CommandError::failed_to_parse("$sample needs a size"))?
                .max(0) as usize;
            let mut docs = docs;
            let mut rng = rand::thread_rng();
            docs.shuffle(&mut rng);
            docs.truncate(size);
            Ok(docs)
        }
        "$merge" => {
            let (db, name) = merge_target(database, spec)?;
            app.collections.collection(&db, &name).insert(docs)?;
            Ok(Vec::new())
        }
        "$out" => {
            let (db, name) = merge_target(database, spec)?;
            let target = app.collections.collection(&db, &name);
            Collection::drop(&target)?;
            target.insert(docs)?;
            Ok(Vec::new())
        }
        other => Err(CommandError::bad_value(format!(
            "unrecognized pipeline stage {other}"
        ))
        .into()),
    }
}

fn expect_document<'v>(stage: &str, spec: &'v Value) -> anyhow::Result<&'v Document> {
    spec.as_document()
        .ok_or_else(|| CommandError::failed_to_parse(format!("{stage} expects a document")).into())
}

fn expect_non_negative(stage: &str, spec: &Value) -> anyhow::Result<usize> {
    spec.as_i64()
        .filter(|n| *n >= 0)
        .map(|n| n as usize)
        .ok_or_else(|| {
            CommandError::failed_to_parse(format!("{stage} expects a non-negative integer")).into()
        })
}

// $project distinguishes include/exclude flags from computed expressions.
fn project(docs: Vec<Document>, spec: &Document) -> anyhow::Result<Vec<Document>> {
    let mut flags = Document::new();
    let mut computed: Vec<(&str, &Value)> = Vec::new();
    for (field, value) in spec.iter() {
        match value {
            Value::Boolean(_) | Value::Int32(_) | Value::Int64(_) | Value::Double(_) => {
                flags.insert(field, value.clone());
            }
            expr => computed.push((field, expr)),
        }
    }

    docs.into_iter()
        .map(|doc| {
            let mut base = if flags.is_empty() {
                // Computed-only projections implicitly keep _id.
                let mut base = Document::new();
                if let Some(id) = doc.get("_id") {
                    base.insert("_id", id.clone());
                }
                base
            } else {
                projection::apply(&doc, &flags)?
            };
            for (field, expr) in &computed {
                base.set_path(field, eval(expr, &doc, &doc)?);
            }
            Ok(base)
        })
        .collect()
}

fn group(docs: Vec<Document>, spec: &Document) -> anyhow::Result<Vec<Document>> {
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| CommandError::failed_to_parse("$group needs an _id expression"))?;

    // Group buckets keep first-seen order.
    let mut groups: IndexMap<String, (Value, Vec<Document>)> = IndexMap::new();
    for doc in docs {
        let key = eval(id_expr, &doc, &doc)?;
        let canonical = bson::value_to_json(&key).to_string();
        groups
            .entry(canonical)
            .or_insert_with(|| (key, Vec::new()))
            .1
            .push(doc);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_, (key, members)) in groups {
        let mut result = Document::new();
        result.insert("_id", key);
        for (field, accumulator) in spec.iter() {
            if field == "_id" {
                continue;
            }
            let accumulator = accumulator.as_document().ok_or_else(|| {
                CommandError::failed_to_parse(format!("accumulator for {field} must be a document"))
            })?;
            let (op, operand) = accumulator.iter().next().ok_or_else(|| {
                CommandError::failed_to_parse(format!("accumulator for {field} is empty"))
            })?;
            result.insert(field, accumulate(op, operand, &members)?);
        }
        out.push(result);
    }
    Ok(out)
}

fn accumulate(op: &str, operand: &Value, members: &[Document]) -> anyhow::Result<Value> {
    let values = |members: &[Document]| -> anyhow::Result<Vec<Value>> {
        members
            .iter()
            .map(|doc| eval(operand, doc, doc))
            .collect()
    };

    Ok(match op {
        "$sum" => {
            let total: f64 = values(members)?
                .iter()
                .filter_map(Value::as_f64)
                .sum();
            number(total)
        }
        "$avg" => {
            let nums: Vec<f64> = values(members)?
                .iter()
                .filter_map(Value::as_f64)
                .collect();
            if nums.is_empty() {
                Value::Null
            } else {
                Value::Double(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        "$min" => values(members)?
            .into_iter()
            .filter(|v| !v.is_null())
            .min_by(|a, b| compare(a, b))
            .unwrap_or(Value::Null),
        "$max" => values(members)?
            .into_iter()
            .filter(|v| !v.is_null())
            .max_by(|a, b| compare(a, b))
            .unwrap_or(Value::Null),
        "$count" => Value::Int64(members.len() as i64),
        "$first" => values(members)?.into_iter().next().unwrap_or(Value::Null),
        "$last" => values(members)?.into_iter().last().unwrap_or(Value::Null),
        "$push" => Value::Array(values(members)?),
        "$addToSet" => {
            let mut set: Vec<Value> = Vec::new();
            for value in values(members)? {
                if !set.iter().any(|seen| compare(seen, &value) == Ordering::Equal) {
                    set.push(value);
                }
            }
            Value::Array(set)
        }
        "$stdDevPop" | "$stdDevSamp" => {
            let nums: Vec<f64> = values(members)?
                .iter()
                .filter_map(Value::as_f64)
                .collect();
            let denominator = if op == "$stdDevPop" {
                nums.len()
            } else {
                nums.len().saturating_sub(1)
            };
            if denominator == 0 {
                Value::Null
            } else {
                let mean = nums.iter().sum::<f64>() / nums.len() as f64;
                let variance = nums.iter().map(|n| (n - mean) * (n - mean)).sum::<f64>()
                    / denominator as f64;
                Value::Double(variance.sqrt())
            }
        }
        other => {
            return Err(
                CommandError::bad_value(format!("unknown accumulator {other}")).into(),
            )
        }
    })
}

fn unwind(docs: Vec<Document>, spec: &Value) -> anyhow::Result<Vec<Document>> {
    let (path, preserve_empty) = match spec {
        Value::String(path) => (path.as_str(), false),
        Value::Document(options) => {
            let path = options
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| CommandError::failed_to_parse("$unwind needs a path"))?;
            let preserve = options
                .get("preserveNullAndEmptyArrays")
                .map_or(false, Value::is_truthy);
            (path, preserve)
        }
        _ => return Err(CommandError::failed_to_parse("$unwind needs a path").into()),
    };
    let path = path.strip_prefix('$').unwrap_or(path);

    let mut out = Vec::new();
    for doc in docs {
        match doc.get_path(path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut clone = doc.clone();
                    clone.set_path(path, item);
                    out.push(clone);
                }
            }
            Some(Value::Array(_)) | None => {
                if preserve_empty {
                    out.push(doc);
                }
            }
            // A non-array value unwinds to itself.
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

fn lookup(
    app: &App,
    database: &str,
    docs: Vec<Document>,
    spec: &Document,
) -> anyhow::Result<Vec<Document>> {
    let from = spec
        .get("from")
        .and_then(Value::as_str)
        .ok_or_else(|| CommandError::failed_to_parse("$lookup needs from"))?;
    let local_field = spec
        .get("localField")
        .and_then(Value::as_str)
        .ok_or_else(|| CommandError::failed_to_parse("$lookup needs localField"))?;
    let foreign_field = spec
        .get("foreignField")
        .and_then(Value::as_str)
        .ok_or_else(|| CommandError::failed_to_parse("$lookup needs foreignField"))?;
    let as_field = spec
        .get("as")
        .and_then(Value::as_str)
        .ok_or_else(|| CommandError::failed_to_parse("$lookup needs as"))?;

    // The foreign side is generated too, bounded by the pipeline source size.
    let foreign = app.collections.collection(database, from).find(
        &Document::new(),
        &FindOptions {
            limit: Some(app.config.aggregate_source_size),
            ..FindOptions::default()
        },
    )?;

    Ok(docs
        .into_iter()
        .map(|mut doc| {
            let matches: Vec<Value> = match doc.get_path(local_field) {
                Some(local) => foreign
                    .iter()
                    .filter(|f| {
                        f.get_path(foreign_field)
                            .map_or(false, |v| compare(v, local) == Ordering::Equal)
                    })
                    .cloned()
                    .map(Value::Document)
                    .collect(),
                None => Vec::new(),
            };
            doc.set_path(as_field, Value::Array(matches));
            doc
        })
        .collect())
}

fn add_fields(docs: Vec<Document>, spec: &Document) -> anyhow::Result<Vec<Document>> {
    docs.into_iter()
        .map(|mut doc| {
            let snapshot = doc.clone();
            for (field, expr) in spec.iter() {
                doc.set_path(field, eval(expr, &snapshot, &snapshot)?);
            }
            Ok(doc)
        })
        .collect()
}

fn unset(docs: Vec<Document>, spec: &Value) -> anyhow::Result<Vec<Document>> {
    let fields: Vec<&str> = match spec {
        Value::String(field) => vec![field.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => {
            return Err(
                CommandError::failed_to_parse("$unset takes a field or array of fields").into(),
            )
        }
    };
    Ok(docs
        .into_iter()
        .map(|mut doc| {
            for field in &fields {
                doc.remove_path(field);
            }
            doc
        })
        .collect())
}

fn replace_root(docs: Vec<Document>, expr: &Value) -> anyhow::Result<Vec<Document>> {
    docs.into_iter()
        .map(|doc| match eval(expr, &doc, &doc)? {
            Value::Document(new_root) => Ok(new_root),
            other => Err(CommandError::type_mismatch(format!(
                "newRoot must resolve to a document, got {}",
                other.type_name()
            ))
            .into()),
        })
        .collect()
}

fn facet(
    app: &App,
    database: &str,
    docs: Vec<Document>,
    spec: &Document,
) -> anyhow::Result<Vec<Document>> {
    let mut out = Document::new();
    for (name, sub_pipeline) in spec.iter() {
        let stages: Vec<Document> = sub_pipeline
            .as_array()
            .ok_or_else(|| {
                CommandError::failed_to_parse(format!("$facet field {name} must be a pipeline"))
            })?
            .iter()
            .filter_map(|v| v.as_document().cloned())
            .collect();
        let results = execute(app, database, docs.clone(), &stages)?;
        out.insert(name, Value::Array(results.into_iter().map(Value::Document).collect()));
    }
    Ok(vec![out])
}

fn bucket(docs: Vec<Document>, spec: &Document) -> anyhow::Result<Vec<Document>> {
    let group_by = spec
        .get("groupBy")
        .ok_or_else(|| CommandError::failed_to_parse("$bucket needs groupBy"))?;
    let boundaries = spec
        .get("boundaries")
        .and_then(Value::as_array)
        .ok_or_else(|| CommandError::failed_to_parse("$bucket needs boundaries"))?;
    if boundaries.len() < 2 {
        return Err(CommandError::bad_value("$bucket needs at least two boundaries").into());
    }
    let default = spec.get("default");

    let mut buckets: IndexMap<String, (Value, Vec<Document>)> = IndexMap::new();
    for boundary in &boundaries[..boundaries.len() - 1] {
        buckets.insert(
            bson::value_to_json(boundary).to_string(),
            (boundary.clone(), Vec::new()),
        );
    }

    for doc in docs {
        let value = eval(group_by, &doc, &doc)?;
        let slot = boundaries.windows(2).find_map(|window| {
            (compare(&value, &window[0]) != Ordering::Less
                && compare(&value, &window[1]) == Ordering::Less)
                .then(|| bson::value_to_json(&window[0]).to_string())
        });
        match (slot, default) {
            (Some(slot), _) => buckets.get_mut(&slot).expect("slot was seeded").1.push(doc),
            (None, Some(default_id)) => {
                buckets
                    .entry(bson::value_to_json(default_id).to_string())
                    .or_insert_with(|| (default_id.clone(), Vec::new()))
                    .1
                    .push(doc);
            }
            (None, None) => {
                return Err(CommandError::bad_value(
                    "$bucket value outside boundaries and no default",
                )
                .into())
            }
        }
    }

    let output = spec.get("output").and_then(Value::as_document);
    let mut out = Vec::new();
    for (_, (id, members)) in buckets {
        if members.is_empty() {
            continue;
        }
        out.push(bucket_output(id, &members, output)?);
    }
    Ok(out)
}

fn bucket_auto(docs: Vec<Document>, spec: &Document) -> anyhow::Result<Vec<Document>> {
    let group_by = spec
        .get("groupBy")
        .ok_or_else(|| CommandError::failed_to_parse("$bucketAuto needs groupBy"))?;
    let bucket_count = spec
        .get("buckets")
        .and_then(Value::as_i64)
        .filter(|n| *n > 0)
        .ok_or_else(|| CommandError::failed_to_parse("$bucketAuto needs a positive buckets"))?
        as usize;

    let mut keyed: Vec<(Value, Document)> = docs
        .into_iter()
        .map(|doc| Ok((eval(group_by, &doc, &doc)?, doc)))
        .collect::<anyhow::Result<_>>()?;
    keyed.sort_by(|a, b| compare(&a.0, &b.0));
    if keyed.is_empty() {
        return Ok(Vec::new());
    }

    let per_bucket = (keyed.len() + bucket_count - 1) / bucket_count;
    let output = spec.get("output").and_then(Value::as_document);

    let mut out = Vec::new();
    for chunk in keyed.chunks(per_bucket.max(1)) {
        let min = chunk.first().expect("chunks are non-empty").0.clone();
        let max = chunk.last().expect("chunks are non-empty").0.clone();
        let members: Vec<Document> = chunk.iter().map(|(_, d)| d.clone()).collect();

        let mut id = Document::new();
        id.insert("min", min);
        id.insert("max", max);
        out.push(bucket_output(Value::Document(id), &members, output)?);
    }
    Ok(out)
}

fn bucket_output(
    id: Value,
    members: &[Document],
    output: Option<&Document>,
) -> anyhow::Result<Document> {
    let mut doc = Document::new();
    doc.insert("_id", id);
    match output {
        None => {
            doc.insert("count", members.len() as i64);
        }
        Some(output) => {
            for (field, accumulator) in output.iter() {
                let accumulator = accumulator.as_document().ok_or_else(|| {
                    CommandError::failed_to_parse(format!(
                        "accumulator for {field} must be a document"
                    ))
                })?;
                let (op, operand) = accumulator.iter().next().ok_or_else(|| {
                    CommandError::failed_to_parse(format!("accumulator for {field} is empty"))
                })?;
                doc.insert(field, accumulate(op, operand, members)?);
            }
        }
    }
    Ok(doc)
}

fn merge_target(database: &str, spec: &Value) -> anyhow::Result<(String, String)> {
    match spec {
        Value::String(name) => Ok((database.to_owned(), name.clone())),
        Value::Document(options) => {
            let into = options.get("into").unwrap_or(spec);
            match into {
                Value::String(name) => Ok((database.to_owned(), name.clone())),
                Value::Document(target) => {
                    let db = target
                        .get("db")
                        .and_then(Value::as_str)
                        .unwrap_or(database);
                    let name = target.get("coll").and_then(Value::as_str).ok_or_else(|| {
                        CommandError::failed_to_parse("merge target needs coll")
                    })?;
                    Ok((db.to_owned(), name.to_owned()))
                }
                _ => Err(CommandError::failed_to_parse("invalid merge target").into()),
            }
        }
        _ => Err(CommandError::failed_to_parse("invalid merge target").into()),
    }
}

/// Evaluate an aggregation expression against `doc`, with `root` bound to
/// `$$ROOT`.
pub fn eval(expr: &Value, doc: &Document, root: &Document) -> anyhow::Result<Value> {
    match expr {
        Value::String(s) if s.starts_with("$$") => {
            let (var, path) = match s[2..].split_once('.') {
                Some((var, path)) => (var, Some(path)),
                None => (&s[2..], None),
            };
            let bound = match var {
                "ROOT" => root,
                "CURRENT" => doc,
                other => {
                    return Err(
                        CommandError::bad_value(format!("unknown variable $${other}")).into(),
                    )
                }
            };
            Ok(match path {
                Some(path) => bound.get_path(path).cloned().unwrap_or(Value::Null),
                None => Value::Document(bound.clone()),
            })
        }
        Value::String(s) if s.starts_with('$') => {
            Ok(doc.get_path(&s[1..]).cloned().unwrap_or(Value::Null))
        }
        Value::Document(d) => {
            if let Some((op, operand)) = d.iter().next() {
                if op.starts_with('$') && d.len() == 1 {
                    return eval_operator(op, operand, doc, root);
                }
            }
            // A literal document evaluates field-wise.
            let mut out = Document::new();
            for (field, value) in d.iter() {
                out.insert(field, eval(value, doc, root)?);
            }
            Ok(Value::Document(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| eval(item, doc, root))
                .collect::<anyhow::Result<_>>()?,
        )),
        literal => Ok(literal.clone()),
    }
}

fn eval_operator(
    op: &str,
    operand: &Value,
    doc: &Document,
    root: &Document,
) -> anyhow::Result<Value> {
    let args = |operand: &Value| -> anyhow::Result<Vec<Value>> {
        match operand {
            Value::Array(items) => items.iter().map(|i| eval(i, doc, root)).collect(),
            single => Ok(vec![eval(single, doc, root)?]),
        }
    };

    Ok(match op {
        "$literal" => operand.clone(),

        // Arithmetic.
        "$add" => number(numeric_args(&args(operand)?).iter().sum()),
        "$multiply" => number(numeric_args(&args(operand)?).iter().product()),
        "$subtract" => {
            let args = binary_numeric(op, &args(operand)?)?;
            number(args.0 - args.1)
        }
        "$divide" => {
            let args = binary_numeric(op, &args(operand)?)?;
            if args.1 == 0.0 {
                return Err(CommandError::bad_value("$divide by zero").into());
            }
            Value::Double(args.0 / args.1)
        }
        "$mod" => {
            let args = binary_numeric(op, &args(operand)?)?;
            if args.1 == 0.0 {
                return Err(CommandError::bad_value("$mod by zero").into());
            }
            number(args.0 % args.1)
        }
        "$abs" => unary_numeric(op, &args(operand)?, f64::abs)?,
        "$ceil" => unary_numeric(op, &args(operand)?, f64::ceil)?,
        "$floor" => unary_numeric(op, &args(operand)?, f64::floor)?,
        "$round" => unary_numeric(op, &args(operand)?, f64::round)?,
        "$trunc" => unary_numeric(op, &args(operand)?, f64::trunc)?,

        // Strings.
        "$concat" => {
            let mut out = String::new();
            for arg in args(operand)? {
                match arg {
                    Value::String(s) => out.push_str(&s),
                    Value::Null => return Ok(Value::Null),
                    other => out.push_str(&render(&other)),
                }
            }
            Value::String(out)
        }
        "$toUpper" => Value::String(render(&single_arg(op, &args(operand)?)?).to_uppercase()),
        "$toLower" => Value::String(render(&single_arg(op, &args(operand)?)?).to_lowercase()),
        "$strLenCP" => {
            Value::Int32(render(&single_arg(op, &args(operand)?)?).chars().count() as i32)
        }
        "$toString" => Value::String(render(&single_arg(op, &args(operand)?)?)),
        "$substr" | "$substrCP" => {
            let args = args(operand)?;
            let [s, start, len] = &args[..] else {
                return Err(
                    CommandError::failed_to_parse(format!("{op} takes three arguments")).into(),
                );
            };
            let s = render(s);
            let start = start.as_i64().unwrap_or(0).max(0) as usize;
            let len = len.as_i64().unwrap_or(0).max(0) as usize;
            Value::String(s.chars().skip(start).take(len).collect())
        }
        "$split" => {
            let args = args(operand)?;
            let [s, sep] = &args[..] else {
                return Err(
                    CommandError::failed_to_parse("$split takes two arguments").into(),
                );
            };
            Value::Array(
                render(s)
                    .split(&render(sep))
                    .map(|part| Value::String(part.to_owned()))
                    .collect(),
            )
        }

        // Comparison.
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$cmp" => {
            let args = args(operand)?;
            let [l, r] = &args[..] else {
                return Err(
                    CommandError::failed_to_parse(format!("{op} takes two arguments")).into(),
                );
            };
            let ordering = compare(l, r);
            match op {
                "$eq" => Value::Boolean(ordering == Ordering::Equal),
                "$ne" => Value::Boolean(ordering != Ordering::Equal),
                "$gt" => Value::Boolean(ordering == Ordering::Greater),
                "$gte" => Value::Boolean(ordering != Ordering::Less),
                "$lt" => Value::Boolean(ordering == Ordering::Less),
                "$lte" => Value::Boolean(ordering != Ordering::Greater),
                _ => Value::Int32(match ordering {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                }),
            }
        }

        // Logical.
        "$and" => Value::Boolean(args(operand)?.iter().all(Value::is_truthy)),
        "$or" => Value::Boolean(args(operand)?.iter().any(Value::is_truthy)),
        "$not" => Value::Boolean(!single_arg(op, &args(operand)?)?.is_truthy()),

        // Conditional.
        "$cond" => match operand {
            Value::Array(_) => {
                let args = args(operand)?;
                let [condition, then, otherwise] = &args[..] else {
                    return Err(
                        CommandError::failed_to_parse("$cond takes three arguments").into(),
                    );
                };
                if condition.is_truthy() {
                    then.clone()
                } else {
                    otherwise.clone()
                }
            }
            Value::Document(spec) => {
                let condition = spec
                    .get("if")
                    .ok_or_else(|| CommandError::failed_to_parse("$cond needs if"))?;
                let branch = if eval(condition, doc, root)?.is_truthy() {
                    spec.get("then")
                } else {
                    spec.get("else")
                };
                match branch {
                    Some(expr) => eval(expr, doc, root)?,
                    None => Value::Null,
                }
            }
            _ => return Err(CommandError::failed_to_parse("invalid $cond").into()),
        },
        "$ifNull" => {
            let args = args(operand)?;
            args.iter()
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or(Value::Null)
        }
        "$switch" => {
            let spec = operand
                .as_document()
                .ok_or_else(|| CommandError::failed_to_parse("$switch takes a document"))?;
            let branches = spec
                .get("branches")
                .and_then(Value::as_array)
                .ok_or_else(|| CommandError::failed_to_parse("$switch needs branches"))?;
            for branch in branches {
                let branch = branch
                    .as_document()
                    .ok_or_else(|| CommandError::failed_to_parse("$switch branch"))?;
                let case = branch
                    .get("case")
                    .ok_or_else(|| CommandError::failed_to_parse("$switch branch needs case"))?;
                if eval(case, doc, root)?.is_truthy() {
                    let then = branch.get("then").ok_or_else(|| {
                        CommandError::failed_to_parse("$switch branch needs then")
                    })?;
                    return eval(then, doc, root);
                }
            }
            match spec.get("default") {
                Some(default) => eval(default, doc, root)?,
                None => Value::Null,
            }
        }

        // Arrays.
        "$size" => match single_arg(op, &args(operand)?)? {
            Value::Array(items) => Value::Int32(items.len() as i32),
            _ => return Err(CommandError::type_mismatch("$size expects an array").into()),
        },
        "$arrayElemAt" => {
            let args = args(operand)?;
            let [array, index] = &args[..] else {
                return Err(
                    CommandError::failed_to_parse("$arrayElemAt takes two arguments").into(),
                );
            };
            let items = array
                .as_array()
                .ok_or_else(|| CommandError::type_mismatch("$arrayElemAt expects an array"))?;
            let index = index.as_i64().unwrap_or(0);
            let index = if index < 0 {
                items.len() as i64 + index
            } else {
                index
            };
            items
                .get(index.max(0) as usize)
                .cloned()
                .unwrap_or(Value::Null)
        }
        "$first" => match single_arg(op, &args(operand)?)? {
            Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
            _ => return Err(CommandError::type_mismatch("$first expects an array").into()),
        },
        "$last" => match single_arg(op, &args(operand)?)? {
            Value::Array(items) => items.into_iter().last().unwrap_or(Value::Null),
            _ => return Err(CommandError::type_mismatch("$last expects an array").into()),
        },
        "$in" => {
            let args = args(operand)?;
            let [needle, haystack] = &args[..] else {
                return Err(CommandError::failed_to_parse("$in takes two arguments").into());
            };
            let items = haystack
                .as_array()
                .ok_or_else(|| CommandError::type_mismatch("$in expects an array"))?;
            Value::Boolean(
                items
                    .iter()
                    .any(|item| compare(item, needle) == Ordering::Equal),
            )
        }
        "$concatArrays" => {
            let mut out = Vec::new();
            for arg in args(operand)? {
                match arg {
                    Value::Array(items) => out.extend(items),
                    Value::Null => return Ok(Value::Null),
                    _ => {
                        return Err(
                            CommandError::type_mismatch("$concatArrays expects arrays").into()
                        )
                    }
                }
            }
            Value::Array(out)
        }
        "$slice" => {
            let args = args(operand)?;
            let items = args
                .first()
                .and_then(Value::as_array)
                .ok_or_else(|| CommandError::type_mismatch("$slice expects an array"))?;
            match &args[1..] {
                [n] => {
                    let n = n.as_i64().unwrap_or(0);
                    if n >= 0 {
                        Value::Array(items.iter().take(n as usize).cloned().collect())
                    } else {
                        let skip = items.len().saturating_sub((-n) as usize);
                        Value::Array(items.iter().skip(skip).cloned().collect())
                    }
                }
                [skip, n] => {
                    let skip = skip.as_i64().unwrap_or(0).max(0) as usize;
                    let n = n.as_i64().unwrap_or(0).max(0) as usize;
                    Value::Array(items.iter().skip(skip).take(n).cloned().collect())
                }
                _ => {
                    return Err(
                        CommandError::failed_to_parse("$slice takes two or three arguments")
                            .into(),
                    )
                }
            }
        }

        // Dates, over epoch-millisecond datetimes.
        "$year" | "$month" | "$dayOfMonth" | "$hour" | "$minute" | "$second" => {
            let arg = single_arg(op, &args(operand)?)?;
            let Value::DateTime(millis) = arg else {
                return Err(CommandError::type_mismatch(format!("{op} expects a date")).into());
            };
            let datetime = OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
                .map_err(|_| CommandError::bad_value("date out of range"))?;
            Value::Int32(match op {
                "$year" => datetime.year(),
                "$month" => u8::from(datetime.month()) as i32,
                "$dayOfMonth" => datetime.day() as i32,
                "$hour" => datetime.hour() as i32,
                "$minute" => datetime.minute() as i32,
                _ => datetime.second() as i32,
            })
        }

        other => {
            return Err(
                CommandError::bad_value(format!("unknown expression operator {other}")).into(),
            )
        }
    })
}

fn numeric_args(values: &[Value]) -> Vec<f64> {
    values.iter().filter_map(Value::as_f64).collect()
}

fn binary_numeric(op: &str, values: &[Value]) -> anyhow::Result<(f64, f64)> {
    match values {
        [l, r] => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => Ok((l, r)),
            _ => Err(CommandError::type_mismatch(format!("{op} expects numbers")).into()),
        },
        _ => Err(CommandError::failed_to_parse(format!("{op} takes two arguments")).into()),
    }
}

fn unary_numeric(op: &str, values: &[Value], f: fn(f64) -> f64) -> anyhow::Result<Value> {
    let value = single_arg(op, values)?;
    let n = value
        .as_f64()
        .ok_or_else(|| CommandError::type_mismatch(format!("{op} expects a number")))?;
    Ok(number(f(n)))
}

fn single_arg(op: &str, values: &[Value]) -> anyhow::Result<Value> {
    match values {
        [one] => Ok(one.clone()),
        _ => Err(CommandError::failed_to_parse(format!("{op} takes one argument")).into()),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Int32(n) => n.to_string(),
        Value::Int64(n) => n.to_string(),
        Value::Double(f) => f.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::ObjectId(oid) => oid.to_string(),
        Value::Null => String::new(),
        other => bson::value_to_json(other).to_string(),
    }
}

fn number(v: f64) -> Value {
    if v.fract() == 0.0 && (i32::MIN as f64..=i32::MAX as f64).contains(&v) {
        Value::Int32(v as i32)
    } else if v.fract() == 0.0 && (i64::MIN as f64..=i64::MAX as f64).contains(&v) {
        Value::Int64(v as i64)
    } else {
        Value::Double(v)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;
    use bson::doc;
    use pretty_assertions::assert_eq;

    fn app() -> (tempfile::TempDir, App) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        (dir, App::new(config))
    }

    fn sales() -> Vec<Document> {
        vec![
            doc! { "item": "a", "price": 10, "qty": 2, "tags": vec![Value::from("x"), Value::from("y")] },
            doc! { "item": "b", "price": 20, "qty": 1, "tags": vec![Value::from("x")] },
            doc! { "item": "a", "price": 5, "qty": 10, "tags": Vec::<Value>::new() },
        ]
    }

    #[test]
    fn match_group_sort() {
        let (_dir, app) = app();
        let pipeline = vec![
            doc! { "$match": doc! { "price": doc! { "$gte": 5 } } },
            doc! { "$group": doc! {
                "_id": "$item",
                "total": doc! { "$sum": "$price" },
                "avgQty": doc! { "$avg": "$qty" },
                "n": doc! { "$count": doc! {} },
            } },
            doc! { "$sort": doc! { "_id": 1 } },
        ];
        let out = execute(&app, "test", sales(), &pipeline).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("_id"), Some(&Value::from("a")));
        assert_eq!(out[0].get("total"), Some(&Value::Int32(15)));
        assert_eq!(out[0].get("avgQty"), Some(&Value::Double(6.0)));
        assert_eq!(out[0].get("n"), Some(&Value::Int64(2)));
        assert_eq!(out[1].get("_id"), Some(&Value::from("b")));
    }

    #[test]
    fn project_computed_fields() {
        let (_dir, app) = app();
        let pipeline = vec![doc! { "$project": doc! {
            "item": 1,
            "revenue": doc! { "$multiply": vec![Value::from("$price"), Value::from("$qty")] },
        } }];
        let out = execute(&app, "test", sales(), &pipeline).unwrap();
        assert_eq!(out[0].get("revenue"), Some(&Value::Int32(20)));
        assert_eq!(out[0].get("item"), Some(&Value::from("a")));
        assert!(out[0].get("price").is_none());
    }

    #[test]
    fn unwind_and_count() {
        let (_dir, app) = app();
        let pipeline = vec![
            doc! { "$unwind": "$tags" },
            doc! { "$count": "tagged" },
        ];
        let out = execute(&app, "test", sales(), &pipeline).unwrap();
        assert_eq!(out, vec![doc! { "tagged": 3i64 }]);
    }

    #[test]
    fn add_fields_cond_and_replace_root() {
        let (_dir, app) = app();
        let pipeline = vec![
            doc! { "$addFields": doc! {
                "pricey": doc! { "$cond": doc! {
                    "if": doc! { "$gte": vec![Value::from("$price"), Value::from(10)] },
                    "then": true,
                    "else": false,
                } },
                "wrapped": doc! { "inner": "$item" },
            } },
            doc! { "$replaceRoot": doc! { "newRoot": "$wrapped" } },
        ];
        let out = execute(&app, "test", sales(), &pipeline).unwrap();
        assert_eq!(out[0], doc! { "inner": "a" });
    }

    #[test]
    fn facet_runs_sub_pipelines() {
        let (_dir, app) = app();
        let pipeline = vec![doc! { "$facet": doc! {
            "counts": vec![Value::Document(doc! { "$count": "n" })],
            "skipped": vec![Value::Document(doc! { "$skip": 2 })],
        } }];
        let out = execute(&app, "test", sales(), &pipeline).unwrap();
        assert_eq!(out.len(), 1);
        let counts = out[0].get("counts").unwrap().as_array().unwrap();
        assert_eq!(counts[0].as_document().unwrap().get("n"), Some(&Value::Int64(3)));
        assert_eq!(out[0].get("skipped").unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn bucket_by_boundaries() {
        let (_dir, app) = app();
        let pipeline = vec![doc! { "$bucket": doc! {
            "groupBy": "$price",
            "boundaries": vec![Value::from(0), Value::from(10), Value::from(100)],
        } }];
        let out = execute(&app, "test", sales(), &pipeline).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("_id"), Some(&Value::Int32(0)));
        assert_eq!(out[0].get("count"), Some(&Value::Int64(1)));
        assert_eq!(out[1].get("_id"), Some(&Value::Int32(10)));
        assert_eq!(out[1].get("count"), Some(&Value::Int64(2)));
    }

    #[test]
    fn bucket_auto_splits_evenly() {
        let (_dir, app) = app();
        let docs: Vec<Document> = (0..10).map(|i| doc! { "v": i }).collect();
        let pipeline = vec![doc! { "$bucketAuto": doc! { "groupBy": "$v", "buckets": 5 } }];
        let out = execute(&app, "test", docs, &pipeline).unwrap();
        assert_eq!(out.len(), 5);
        for bucket in &out {
            assert_eq!(bucket.get("count"), Some(&Value::Int64(2)));
        }
    }

    #[test]
    fn lookup_joins_generated_collections() {
        let (_dir, app) = app();
        // Train the foreign side so it generates documents with a stable key.
        let foreign = app.collections.collection("test", "kinds");
        foreign
            .insert((0..10).map(|_| doc! { "kind": "a", "note": "known" }).collect())
            .unwrap();

        let pipeline = vec![doc! { "$lookup": doc! {
            "from": "kinds",
            "localField": "item",
            "foreignField": "kind",
            "as": "joined",
        } }];
        let out = execute(&app, "test", sales(), &pipeline).unwrap();
        // Every "a" sale joins the constant-keyed foreign docs.
        let joined = out[0].get("joined").unwrap().as_array().unwrap();
        assert!(!joined.is_empty());
        let unjoined = out[1].get("joined").unwrap().as_array().unwrap();
        assert!(unjoined.is_empty());
    }

    #[test]
    fn out_writes_and_returns_nothing() {
        let (_dir, app) = app();
        let pipeline = vec![doc! { "$out": "archive" }];
        let out = execute(&app, "test", sales(), &pipeline).unwrap();
        assert!(out.is_empty());
        // Three inserted documents are enough to be buffered, not trained.
        let info = app.collections.collection("test", "archive").info();
        assert_eq!(info.document_count, 3);
    }

    #[test]
    fn ceiling_aborts_the_pipeline() {
        let (dir, _) = app();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            aggregate_ceiling: 4,
            ..Config::default()
        };
        let app = App::new(config);
        let pipeline = vec![doc! { "$unwind": "$tags" }];
        let docs: Vec<Document> = (0..3)
            .map(|_| doc! { "tags": vec![Value::from(1), Value::from(2)] })
            .collect();
        assert!(execute(&app, "test", docs, &pipeline).is_err());
    }

    #[test]
    fn unknown_stage_is_an_error() {
        let (_dir, app) = app();
        let pipeline = vec![doc! { "$teleport": doc! {} }];
        let err = execute(&app, "test", sales(), &pipeline).unwrap_err();
        let command_error = err.downcast_ref::<CommandError>().unwrap();
        assert_eq!(command_error.code, 2);
    }
}
