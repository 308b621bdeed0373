// A Collection is the per-(database, name) unit of state: a model, its
// metadata and indexes, the pending-training buffer, and a bounded scratch
// cache that updates and deletes operate against. No user document is ever
// persisted; inserts only train the model.

use crate::{matcher, projection, query, storage::ModelStore, update, CommandError, Config};
use bson::{compare, Document, ObjectId, Value};
use dataflood::{infer, merge, GenerateOptions, Generator, InferConfig, Model};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

// The scratch cache holds at most this many documents.
const MAX_CACHED_DOCUMENTS: usize = 1000;
// Post-filtering may reject generated documents; generation stops after
// this many candidates even if the target count was not reached.
const MAX_GENERATED_PER_QUERY: usize = 100_000;

#[derive(Clone, Debug)]
pub struct CollectionInfo {
    pub database: String,
    pub name: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    /// Monotonic counter of accepted inserts; deletes decrement it.
    pub document_count: u64,
    pub model_trained: bool,
    pub model_version: u64,
    pub query_count: u64,
    pub insert_count: u64,
    pub update_count: u64,
    pub delete_count: u64,
    pub generate_count: u64,
}

#[derive(Clone, Debug)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Document,
}

#[derive(Clone, Debug, Default)]
pub struct FindOptions {
    pub skip: usize,
    pub limit: Option<usize>,
    pub sort: Option<Document>,
    pub projection: Option<Document>,
}

#[derive(Debug, Default)]
pub struct InsertResult {
    pub inserted: usize,
    pub ids: Vec<Value>,
}

#[derive(Debug, Default)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Value>,
}

struct State {
    model: Option<Arc<Model>>,
    model_loaded: bool,
    info: CollectionInfo,
    pending: Vec<Document>,
    cache: IndexMap<String, Document>,
    indexes: Vec<IndexSpec>,
}

pub struct Collection {
    database: String,
    name: String,
    store: Arc<ModelStore>,
    config: Config,
    state: Mutex<State>,
}

impl Collection {
    pub fn new(database: &str, name: &str, store: Arc<ModelStore>, config: Config) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            database: database.to_owned(),
            name: name.to_owned(),
            store,
            config,
            state: Mutex::new(State {
                model: None,
                model_loaded: false,
                info: CollectionInfo {
                    database: database.to_owned(),
                    name: name.to_owned(),
                    created_at: now,
                    updated_at: now,
                    document_count: 0,
                    model_trained: false,
                    model_version: 0,
                    query_count: 0,
                    insert_count: 0,
                    update_count: 0,
                    delete_count: 0,
                    generate_count: 0,
                },
                pending: Vec::new(),
                cache: IndexMap::new(),
                indexes: vec![default_id_index()],
            }),
        }
    }

    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }

    pub fn info(&self) -> CollectionInfo {
        self.state.lock().unwrap().info.clone()
    }

    /// Insert documents: assign missing `_id`s, buffer for training, and
    /// train the model once the buffer crosses the batch threshold.
    pub fn insert(&self, docs: Vec<Document>) -> anyhow::Result<InsertResult> {
        let mut state = self.state.lock().unwrap();
        self.load_model_locked(&mut state)?;

        let mut result = InsertResult::default();
        for mut doc in docs {
            if !doc.contains_key("_id") {
                let mut with_id = Document::new();
                with_id.insert("_id", ObjectId::new());
                for (k, v) in doc.into_iter() {
                    with_id.insert(k, v);
                }
                doc = with_id;
            }
            result.ids.push(doc.get("_id").cloned().unwrap_or(Value::Null));
            result.inserted += 1;

            cache_insert(&mut state.cache, &doc);
            state.pending.push(doc);
            state.info.document_count += 1;
        }
        state.info.insert_count += 1;
        state.info.updated_at = OffsetDateTime::now_utc();

        if state.pending.len() >= self.config.train_batch_size {
            self.train_locked(&mut state)?;
        }
        Ok(result)
    }

    /// Force a training pass over whatever is pending.
    pub fn flush_training(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        self.load_model_locked(&mut state)?;
        if !state.pending.is_empty() {
            self.train_locked(&mut state)?;
        }
        Ok(())
    }

    // First training infers a fresh model; later passes merge into the
    // existing one. The result is adopted and persisted atomically under
    // the collection lock, so readers see either the old or new model.
    fn train_locked(&self, state: &mut State) -> anyhow::Result<()> {
        let batch: Vec<Value> = std::mem::take(&mut state.pending)
            .into_iter()
            .map(Value::Document)
            .collect();

        let inferred = infer(&batch, &InferConfig::default())
            .map_err(|err| CommandError::bad_value(format!("training failed: {err}")))?;

        let next = match &state.model {
            Some(current) => merge(current.as_ref().clone(), inferred),
            None => inferred,
        };
        let next = Arc::new(next);
        self.store.store(&self.database, &self.name, next.clone())?;

        state.model = Some(next);
        state.info.model_trained = true;
        state.info.model_version += 1;
        tracing::info!(
            namespace = %self.namespace(),
            version = state.info.model_version,
            batch = batch.len(),
            "trained collection model"
        );
        Ok(())
    }

    fn load_model_locked(&self, state: &mut State) -> anyhow::Result<()> {
        if !state.model_loaded {
            state.model = self.store.load(&self.database, &self.name)?;
            state.model_loaded = true;
            if state.model.is_some() {
                state.info.model_trained = true;
            }
        }
        Ok(())
    }

    fn model(&self) -> anyhow::Result<Option<Arc<Model>>> {
        let mut state = self.state.lock().unwrap();
        self.load_model_locked(&mut state)?;
        Ok(state.model.clone())
    }

    /// Generate, post-filter, sort, slice, and project one result set.
    pub fn find(&self, raw_query: &Document, options: &FindOptions) -> anyhow::Result<Vec<Document>> {
        let Some(model) = self.model()? else {
            return Ok(Vec::new());
        };

        let prepared = query::prepare(raw_query);
        // An explicit limit is honored as-is; an absent one falls back to
        // the configured implicit cap so unbounded finds still terminate.
        let limit = options.limit.unwrap_or(self.config.max_result_size);
        let target = options.skip + limit;
        if target > MAX_GENERATED_PER_QUERY {
            return Err(CommandError::exceeded_limit(format!(
                "skip + limit of {target} exceeds the {MAX_GENERATED_PER_QUERY} document ceiling"
            ))
            .into());
        }

        // Query parameters override the model's persisted defaults.
        let tides = model.tides_config.clone().unwrap_or_default();
        let generate_options = GenerateOptions {
            seed: prepared.seed.or(tides.seed),
            entropy: prepared.entropy.or(tides.entropy),
            constraints: prepared.constraints,
        };
        let generator = Generator::new(&model, generate_options);

        // Generate in chunks until enough documents survive the filter.
        let mut matched: Vec<Document> = Vec::with_capacity(target.min(1024));
        let mut generated: u64 = 0;
        while matched.len() < target && (generated as usize) < MAX_GENERATED_PER_QUERY {
            let chunk = self
                .config
                .generate_chunk_size
                .min(MAX_GENERATED_PER_QUERY - generated as usize)
                .max(1);
            for _ in 0..chunk {
                let value = generator.generate_nth(generated);
                generated += 1;
                let doc = match value {
                    Value::Document(doc) => doc,
                    other => {
                        // Non-object roots wrap under a `value` field.
                        let mut wrapper = Document::new();
                        wrapper.insert("value", other);
                        wrapper
                    }
                };
                if matcher::matches(&doc, &prepared.filter) {
                    matched.push(doc);
                    if matched.len() >= target {
                        break;
                    }
                }
            }
            // A fully unconstrained pass that filtered everything out will
            // never converge; bail after one chunk of zero matches.
            if matched.is_empty() && generated >= self.config.generate_chunk_size as u64 {
                break;
            }
        }

        if let Some(sort) = &options.sort {
            sort_documents(&mut matched, sort);
        }

        let mut out: Vec<Document> = matched
            .into_iter()
            .skip(options.skip)
            .take(limit)
            .collect();

        if let Some(projection_doc) = &options.projection {
            out = out
                .iter()
                .map(|doc| projection::apply(doc, projection_doc))
                .collect::<anyhow::Result<Vec<_>>>()?;
        }

        let mut state = self.state.lock().unwrap();
        state.info.query_count += 1;
        state.info.generate_count += generated;
        Ok(out)
    }

    pub fn find_one(&self, query: &Document) -> anyhow::Result<Option<Document>> {
        let mut docs = self.find(
            query,
            &FindOptions {
                limit: Some(1),
                ..FindOptions::default()
            },
        )?;
        let first = docs.drain(..).next();
        Ok(first)
    }

    /// With no document store to count, a trained collection reports the
    /// configured estimate and an untrained one reports zero.
    pub fn count(&self, _query: &Document) -> anyhow::Result<i64> {
        Ok(match self.model()? {
            Some(_) => self.config.count_estimate,
            None => 0,
        })
    }

    pub fn update(
        &self,
        query: &Document,
        update_doc: &Document,
        multi: bool,
        upsert: bool,
    ) -> anyhow::Result<UpdateResult> {
        let matched_docs = self.find(
            query,
            &FindOptions {
                limit: if multi { None } else { Some(1) },
                ..FindOptions::default()
            },
        )?;

        let mut result = UpdateResult::default();
        let mut state = self.state.lock().unwrap();

        for mut doc in matched_docs {
            result.matched += 1;
            if update::apply(&mut doc, update_doc)? {
                result.modified += 1;
            }
            cache_insert(&mut state.cache, &doc);
        }

        if result.matched == 0 && upsert {
            let mut doc = Document::new();
            update::apply(&mut doc, update_doc)?;
            if !doc.contains_key("_id") {
                doc.insert("_id", ObjectId::new());
            }
            let id = doc.get("_id").cloned();
            cache_insert(&mut state.cache, &doc);
            state.info.document_count += 1;
            result.upserted_id = id;
        }

        state.info.update_count += 1;
        state.info.updated_at = OffsetDateTime::now_utc();
        Ok(result)
    }

    pub fn delete(&self, query: &Document, limit: Option<usize>) -> anyhow::Result<u64> {
        let matched_docs = self.find(
            query,
            &FindOptions {
                limit,
                ..FindOptions::default()
            },
        )?;

        let mut state = self.state.lock().unwrap();
        let mut deleted = 0u64;
        for doc in matched_docs {
            if let Some(id) = doc.get("_id") {
                state.cache.shift_remove(&cache_key(id));
            }
            state.info.document_count = state.info.document_count.saturating_sub(1);
            deleted += 1;
        }
        state.info.delete_count += 1;
        state.info.updated_at = OffsetDateTime::now_utc();
        Ok(deleted)
    }

    pub fn create_index(&self, keys: &Document, name: Option<String>) -> String {
        let name = name.unwrap_or_else(|| index_name(keys));
        let mut state = self.state.lock().unwrap();
        if !state.indexes.iter().any(|index| index.name == name) {
            state.indexes.push(IndexSpec {
                name: name.clone(),
                keys: keys.clone(),
            });
        }
        name
    }

    pub fn drop_index(&self, name: &str) -> anyhow::Result<()> {
        if name == "_id_" {
            return Err(
                CommandError::illegal_operation("cannot drop the default _id_ index").into(),
            );
        }
        let mut state = self.state.lock().unwrap();
        let before = state.indexes.len();
        state.indexes.retain(|index| index.name != name);
        if state.indexes.len() == before {
            return Err(CommandError::index_not_found(format!("index {name} not found")).into());
        }
        Ok(())
    }

    pub fn drop_indexes(&self) {
        let mut state = self.state.lock().unwrap();
        state.indexes.retain(|index| index.name == "_id_");
    }

    pub fn index_count(&self) -> usize {
        self.state.lock().unwrap().indexes.len()
    }

    pub fn list_indexes(&self) -> Vec<Document> {
        let state = self.state.lock().unwrap();
        state
            .indexes
            .iter()
            .map(|index| {
                bson::doc! {
                    "v": 2,
                    "key": index.keys.clone(),
                    "name": index.name.as_str(),
                }
            })
            .collect()
    }

    /// Remove the model and reset all state; the default `_id_` index is
    /// recreated.
    pub fn drop(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        self.store.remove(&self.database, &self.name)?;

        state.model = None;
        state.model_loaded = true;
        state.pending.clear();
        state.cache.clear();
        state.indexes = vec![default_id_index()];
        state.info.document_count = 0;
        state.info.model_trained = false;
        state.info.model_version = 0;
        state.info.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }
}

fn default_id_index() -> IndexSpec {
    IndexSpec {
        name: "_id_".to_owned(),
        keys: bson::doc! { "_id": 1 },
    }
}

fn index_name(keys: &Document) -> String {
    let parts: Vec<String> = keys
        .iter()
        .map(|(field, direction)| {
            format!("{field}_{}", direction.as_i64().unwrap_or(1))
        })
        .collect();
    parts.join("_")
}

fn cache_key(id: &Value) -> String {
    bson::value_to_json(id).to_string()
}

fn cache_insert(cache: &mut IndexMap<String, Document>, doc: &Document) {
    let Some(id) = doc.get("_id") else { return };
    while cache.len() >= MAX_CACHED_DOCUMENTS {
        cache.shift_remove_index(0);
    }
    cache.insert(cache_key(id), doc.clone());
}

/// Stable multi-key sort: each sort key applies in order, 1 ascending and
/// -1 descending; missing values sort lowest.
pub fn sort_documents(docs: &mut [Document], sort: &Document) {
    docs.sort_by(|a, b| {
        for (field, direction) in sort.iter() {
            let ascending = direction.as_i64().unwrap_or(1) >= 0;
            let ordering = match (a.get_path(field), b.get_path(field)) {
                (Some(l), Some(r)) => compare(l, r),
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            let ordering = if ascending { ordering } else { ordering.reverse() };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    fn collection() -> (tempfile::TempDir, Collection) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ModelStore::new(dir.path(), 10));
        let collection = Collection::new("test", "things", store, Config::default());
        (dir, collection)
    }

    fn seed_docs(n: i32) -> Vec<Document> {
        (0..n)
            .map(|i| doc! { "n": i, "label": format!("item_{i}"), "flag": i % 2 == 0 })
            .collect()
    }

    #[test]
    fn insert_assigns_ids_and_trains_at_threshold() {
        let (_dir, collection) = collection();

        let result = collection.insert(seed_docs(5)).unwrap();
        assert_eq!(result.inserted, 5);
        assert_eq!(result.ids.len(), 5);
        assert!(!collection.info().model_trained);

        collection.insert(seed_docs(5)).unwrap();
        let info = collection.info();
        assert!(info.model_trained);
        assert_eq!(info.model_version, 1);
        assert_eq!(info.document_count, 10);

        // The next threshold crossing merges rather than re-infers.
        collection.insert(seed_docs(10)).unwrap();
        assert_eq!(collection.info().model_version, 2);
    }

    #[test]
    fn find_on_untrained_collection_is_empty() {
        let (_dir, collection) = collection();
        let docs = collection.find(&doc! {}, &FindOptions::default()).unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn find_generates_matching_documents() {
        let (_dir, collection) = collection();
        collection.insert(seed_docs(10)).unwrap();

        let docs = collection
            .find(
                &doc! { "$seed": 5 },
                &FindOptions {
                    limit: Some(7),
                    ..FindOptions::default()
                },
            )
            .unwrap();
        assert_eq!(docs.len(), 7);
        for doc in &docs {
            assert!(doc.contains_key("n"));
            assert!(doc.contains_key("label"));
        }
    }

    #[test]
    fn seeded_finds_are_identical() {
        let (_dir, collection) = collection();
        collection.insert(seed_docs(10)).unwrap();

        let options = FindOptions {
            limit: Some(3),
            ..FindOptions::default()
        };
        let a = collection.find(&doc! { "$seed": 7 }, &options).unwrap();
        let b = collection.find(&doc! { "$seed": 7 }, &options).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn find_respects_equality_filters() {
        let (_dir, collection) = collection();
        collection
            .insert(
                (0..10)
                    .map(|i| doc! { "sector": if i % 2 == 0 { "Tech" } else { "Health" }, "i": i })
                    .collect(),
            )
            .unwrap();

        let docs = collection
            .find(
                &doc! { "sector": "Tech", "$seed": 7 },
                &FindOptions {
                    limit: Some(3),
                    ..FindOptions::default()
                },
            )
            .unwrap();
        assert_eq!(docs.len(), 3);
        for doc in docs {
            assert_eq!(doc.get("sector"), Some(&Value::from("Tech")));
        }
    }

    #[test]
    fn sort_skip_limit_and_projection() {
        let (_dir, collection) = collection();
        collection.insert(seed_docs(10)).unwrap();

        let docs = collection
            .find(
                &doc! { "$seed": 1 },
                &FindOptions {
                    skip: 2,
                    limit: Some(5),
                    sort: Some(doc! { "n": 1 }),
                    projection: Some(doc! { "n": 1, "_id": 0 }),
                },
            )
            .unwrap();
        assert_eq!(docs.len(), 5);
        let values: Vec<i64> = docs
            .iter()
            .map(|d| d.get("n").unwrap().as_i64().unwrap())
            .collect();
        let mut sorted = values.clone();
        sorted.sort();
        assert_eq!(values, sorted);
        for doc in &docs {
            assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["n"]);
        }
    }

    #[test]
    fn count_is_the_configured_surrogate() {
        let (_dir, collection) = collection();
        assert_eq!(collection.count(&doc! {}).unwrap(), 0);

        collection.insert(seed_docs(10)).unwrap();
        assert_eq!(collection.count(&doc! {}).unwrap(), 100);
    }

    #[test]
    fn update_reports_matched_and_modified() {
        let (_dir, collection) = collection();
        collection.insert(seed_docs(10)).unwrap();

        let result = collection
            .update(
                &doc! { "$seed": 2 },
                &doc! { "$set": doc! { "touched": true } },
                true,
                false,
            )
            .unwrap();
        assert!(result.matched > 0);
        assert_eq!(result.matched, result.modified);
        assert!(result.upserted_id.is_none());
    }

    #[test]
    fn upsert_creates_a_cached_document() {
        let (_dir, collection) = collection();
        collection.insert(seed_docs(10)).unwrap();

        let result = collection
            .update(
                &doc! { "label": "no such label" },
                &doc! { "$set": doc! { "fresh": 1 } },
                false,
                true,
            )
            .unwrap();
        assert_eq!(result.matched, 0);
        assert!(result.upserted_id.is_some());
    }

    #[test]
    fn delete_decrements_document_count() {
        let (_dir, collection) = collection();
        collection.insert(seed_docs(10)).unwrap();
        let before = collection.info().document_count;

        let deleted = collection.delete(&doc! { "$seed": 3 }, Some(2)).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(collection.info().document_count, before - 2);
    }

    #[test]
    fn indexes_are_metadata_and_id_is_undroppable() {
        let (_dir, collection) = collection();
        assert_eq!(collection.index_count(), 1);

        let name = collection.create_index(&doc! { "n": 1 }, None);
        assert_eq!(name, "n_1");
        assert_eq!(collection.index_count(), 2);

        collection.drop_index("n_1").unwrap();
        assert_eq!(collection.index_count(), 1);
        assert!(collection.drop_index("_id_").is_err());
        assert!(collection.drop_index("missing").is_err());
    }

    #[test]
    fn drop_resets_everything() {
        let (_dir, collection) = collection();
        collection.insert(seed_docs(10)).unwrap();
        collection.create_index(&doc! { "n": 1 }, None);
        assert!(collection.info().model_trained);

        collection.drop().unwrap();
        let info = collection.info();
        assert!(!info.model_trained);
        assert_eq!(info.document_count, 0);
        assert_eq!(collection.index_count(), 1);
        assert!(collection
            .find(&doc! {}, &FindOptions::default())
            .unwrap()
            .is_empty());
    }
}
