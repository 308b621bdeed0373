use super::Value;
use indexmap::IndexMap;

/// Document is an insertion-ordered mapping of field name to [`Value`].
/// Field order is part of the wire format, so iteration and encoding
/// always follow insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document {
    entries: IndexMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert, replacing any previous value while keeping its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    /// Remove a field, preserving the relative order of the rest.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.entries.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Resolve a dotted path like `address.city` against nested documents.
    /// A path segment over an array indexes into it when the segment parses
    /// as an integer.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.entries.get(segments.next()?)?;

        for segment in segments {
            current = match current {
                Value::Document(doc) => doc.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set a dotted path, creating intermediate documents as needed.
    /// An existing non-document intermediate is replaced.
    pub fn set_path(&mut self, path: &str, value: Value) {
        match path.split_once('.') {
            None => {
                self.insert(path, value);
            }
            Some((head, rest)) => {
                if !matches!(self.get(head), Some(Value::Document(_))) {
                    self.insert(head, Value::Document(Document::new()));
                }
                let Some(Value::Document(child)) = self.get_mut(head) else {
                    unreachable!("intermediate was just inserted");
                };
                child.set_path(rest, value);
            }
        }
    }

    /// Remove a dotted path. Intermediate documents are left in place.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.remove(path),
            Some((head, rest)) => match self.get_mut(head) {
                Some(Value::Document(child)) => child.remove_path(rest),
                _ => None,
            },
        }
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::doc;

    #[test]
    fn dotted_paths() {
        let mut d = doc! {
            "name": "ada",
            "address": doc! { "city": "London", "geo": doc! { "lat": 51.5 } },
            "tags": vec![Value::from("a"), Value::from("b")],
        };

        assert_eq!(d.get_path("address.city"), Some(&Value::from("London")));
        assert_eq!(d.get_path("address.geo.lat"), Some(&Value::from(51.5)));
        assert_eq!(d.get_path("tags.1"), Some(&Value::from("b")));
        assert_eq!(d.get_path("address.zip"), None);
        assert_eq!(d.get_path("name.first"), None);

        d.set_path("address.zip", Value::from("N1"));
        assert_eq!(d.get_path("address.zip"), Some(&Value::from("N1")));

        d.set_path("brand.new.leaf", Value::from(1));
        assert_eq!(d.get_path("brand.new.leaf"), Some(&Value::from(1)));

        assert_eq!(d.remove_path("address.geo.lat"), Some(Value::from(51.5)));
        assert_eq!(d.get_path("address.geo.lat"), None);
    }

    #[test]
    fn insert_preserves_order() {
        let mut d = Document::new();
        d.insert("z", 1);
        d.insert("a", 2);
        d.insert("m", 3);
        d.insert("z", 4); // Replacement keeps position.

        let keys: Vec<&str> = d.keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }
}
