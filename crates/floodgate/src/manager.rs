// The collection manager owns every live Collection, keyed by
// (database, name). Collections materialize lazily on first reference;
// their models load lazily from storage after that.

use crate::{storage::ModelStore, Collection, Config};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

pub struct CollectionManager {
    store: Arc<ModelStore>,
    config: Config,
    collections: RwLock<HashMap<(String, String), Arc<Collection>>>,
}

impl CollectionManager {
    pub fn new(store: Arc<ModelStore>, config: Config) -> Self {
        Self {
            store,
            config,
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch or create the collection for `(database, name)`.
    pub fn collection(&self, database: &str, name: &str) -> Arc<Collection> {
        let key = (database.to_owned(), name.to_owned());
        if let Some(collection) = self.collections.read().unwrap().get(&key) {
            return collection.clone();
        }

        let mut collections = self.collections.write().unwrap();
        collections
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Collection::new(
                    database,
                    name,
                    self.store.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Drop a collection's model and forget its in-memory state.
    pub fn drop_collection(&self, database: &str, name: &str) -> anyhow::Result<bool> {
        let key = (database.to_owned(), name.to_owned());
        let existing = self.collections.write().unwrap().remove(&key);
        match existing {
            Some(collection) => {
                Collection::drop(&collection)?;
                Ok(true)
            }
            None => {
                // Never referenced this run, but may exist on disk.
                self.store.remove(database, name)?;
                Ok(false)
            }
        }
    }

    pub fn drop_database(&self, database: &str) -> anyhow::Result<usize> {
        let names = self.list_collections(database);
        for name in &names {
            self.drop_collection(database, name)?;
        }
        Ok(names.len())
    }

    /// Databases known on disk or referenced in memory.
    pub fn list_databases(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.store.list_databases().into_iter().collect();
        for (database, _) in self.collections.read().unwrap().keys() {
            names.insert(database.clone());
        }
        names.into_iter().collect()
    }

    pub fn list_collections(&self, database: &str) -> Vec<String> {
        let mut names: BTreeSet<String> =
            self.store.list_collections(database).into_iter().collect();
        for (db, name) in self.collections.read().unwrap().keys() {
            if db == database {
                names.insert(name.clone());
            }
        }
        names.into_iter().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    fn manager() -> (tempfile::TempDir, CollectionManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ModelStore::new(dir.path(), 10));
        (dir, CollectionManager::new(store, Config::default()))
    }

    #[test]
    fn collections_are_shared_by_key() {
        let (_dir, manager) = manager();
        let a = manager.collection("db", "things");
        let b = manager.collection("db", "things");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &manager.collection("db", "other")));
    }

    #[test]
    fn listing_reflects_memory_and_disk() {
        let (_dir, manager) = manager();
        let collection = manager.collection("shop", "orders");
        collection
            .insert((0..10).map(|i| doc! { "n": i }).collect())
            .unwrap();

        assert_eq!(manager.list_databases(), vec!["shop".to_owned()]);
        assert_eq!(
            manager.list_collections("shop"),
            vec!["orders".to_owned()]
        );

        assert!(manager.drop_collection("shop", "orders").unwrap());
        assert!(manager.list_collections("shop").is_empty());
    }
}
