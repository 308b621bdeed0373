// Model persistence: one JSON file per collection at
// `<data_dir>/<database>/<collection>.json`, plus an LRU cache of decoded
// models. Models on disk are authoritative; the cache is an optimization.
// Writes are write-then-rename so a crash never leaves a torn file.

use anyhow::Context;
use dataflood::Model;
use indexmap::IndexMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub struct ModelStore {
    base: PathBuf,
    capacity: usize,
    // Insertion order doubles as recency order: hits re-insert at the back,
    // eviction pops the front.
    cache: Mutex<IndexMap<(String, String), Arc<Model>>>,
}

impl ModelStore {
    pub fn new(base: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            base: base.into(),
            capacity: capacity.max(1),
            cache: Mutex::new(IndexMap::new()),
        }
    }

    fn path(&self, database: &str, collection: &str) -> PathBuf {
        self.base
            .join(sanitize(database))
            .join(format!("{}.json", sanitize(collection)))
    }

    /// Load a collection's model. A missing file is not an error; a corrupt
    /// file is, and leaves the cache untouched.
    pub fn load(&self, database: &str, collection: &str) -> anyhow::Result<Option<Arc<Model>>> {
        let key = (database.to_owned(), collection.to_owned());
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(model) = cache.shift_remove(&key) {
                cache.insert(key, model.clone());
                return Ok(Some(model));
            }
        }

        let path = self.path(database, collection);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).context(format!("reading model file {}", path.display()))
            }
        };
        let model = Arc::new(
            Model::from_persisted_json(&text)
                .with_context(|| format!("model file {} is corrupt", path.display()))?,
        );
        self.admit(key, model.clone());
        Ok(Some(model))
    }

    /// Persist a model atomically and refresh the cache.
    pub fn store(
        &self,
        database: &str,
        collection: &str,
        model: Arc<Model>,
    ) -> anyhow::Result<()> {
        let path = self.path(database, collection);
        let dir = path.parent().expect("model paths always have a parent");
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating model directory {}", dir.display()))?;

        let json = serde_json::to_string_pretty(&model.to_persisted_json())?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .context("creating temporary model file")?;
        temp.write_all(json.as_bytes())?;
        temp.persist(&path)
            .with_context(|| format!("replacing model file {}", path.display()))?;

        tracing::debug!(database, collection, "persisted model");
        self.admit((database.to_owned(), collection.to_owned()), model);
        Ok(())
    }

    /// Drop a model from disk and cache. Removing a model that never
    /// existed is fine.
    pub fn remove(&self, database: &str, collection: &str) -> anyhow::Result<()> {
        self.cache
            .lock()
            .unwrap()
            .shift_remove(&(database.to_owned(), collection.to_owned()));

        let path = self.path(database, collection);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(format!("removing model file {}", path.display())),
        }
    }

    pub fn list_databases(&self) -> Vec<String> {
        list_dir(&self.base, |entry| {
            entry
                .file_type()
                .ok()?
                .is_dir()
                .then(|| entry.file_name().to_string_lossy().into_owned())
        })
    }

    pub fn list_collections(&self, database: &str) -> Vec<String> {
        list_dir(&self.base.join(sanitize(database)), |entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let stem = name.strip_suffix(".json")?;
            entry
                .file_type()
                .ok()?
                .is_file()
                .then(|| stem.to_owned())
        })
    }

    fn admit(&self, key: (String, String), model: Arc<Model>) {
        let mut cache = self.cache.lock().unwrap();
        cache.shift_remove(&key);
        while cache.len() >= self.capacity {
            cache.shift_remove_index(0);
        }
        cache.insert(key, model);
    }
}

fn list_dir<F>(path: &Path, mut keep: F) -> Vec<String>
where
    F: FnMut(&std::fs::DirEntry) -> Option<String>,
{
    let Ok(entries) = std::fs::read_dir(path) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|entry| keep(&entry))
        .collect();
    names.sort();
    names
}

// Path separators in namespace parts would escape the data directory.
fn sanitize(part: &str) -> String {
    part.replace(['/', '\\'], "_")
}
