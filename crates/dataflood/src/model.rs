use super::{Format, Histogram, StringModel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Model describes the shapes a collection's documents may take. It is a
/// recursive, JSON-Schema-shaped tree: object properties and array items
/// are themselves models. A key serializes only when it constrains
/// something, so persisted models stay sparse.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Model {
    /// Set only at the root of a persisted model.
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,

    // Object keywords.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Model>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    // Array keywords.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Model>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_items: Option<bool>,

    // Numeric keywords.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiple_of: Option<f64>,

    // String keywords.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    // Composition.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<Model>,
    #[serde(rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    // DataFlood extensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub histogram: Option<Histogram>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_model: Option<StringModel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tides_config: Option<TidesConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<Relationship>,
}

/// The semantic type of a model node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Object,
    Array,
    String,
    Integer,
    Number,
    Boolean,
    Null,
}

/// Persisted generation defaults for a collection: a caller-supplied query
/// may still override both.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TidesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entropy: Option<f64>,
}

/// A foreign-key hint detected during inference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub field: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub confidence: f64,
    pub referenced_entity: String,
    pub relationship_type: RelationshipKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipKind {
    Parent,
    Child,
    Reference,
}

/// The generator's top-level choice for a node. When several shapes
/// coexist, `enum` wins, then `anyOf`, then `type`.
pub enum Branch<'m> {
    Enum(&'m [serde_json::Value]),
    AnyOf(&'m [Model]),
    Typed(Kind),
}

impl Model {
    /// A model constraining nothing but its type.
    pub fn typed(kind: Kind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn branch(&self) -> Branch<'_> {
        if !self.enum_values.is_empty() {
            Branch::Enum(&self.enum_values)
        } else if !self.any_of.is_empty() {
            Branch::AnyOf(&self.any_of)
        } else {
            Branch::Typed(self.kind.unwrap_or(Kind::Null))
        }
    }

    /// The canonical JSON form used for persistence, dedup, and equality
    /// up to re-sorted maps.
    pub fn canonical_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("models always serialize")
    }

    /// Serialize for persistence: `$schema` is stamped at the root and only
    /// there (nested models never carry it).
    pub fn to_persisted_json(&self) -> serde_json::Value {
        let mut root = self.clone();
        root.schema = Some(super::SCHEMA_URI.to_owned());
        root.canonical_json()
    }

    pub fn from_persisted_json(json: &str) -> super::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn sparse_serialization() {
        let model = Model {
            kind: Some(Kind::Integer),
            minimum: Some(1.0),
            maximum: Some(10.0),
            ..Model::default()
        };
        assert_eq!(
            model.canonical_json(),
            json!({"type": "integer", "minimum": 1.0, "maximum": 10.0}),
        );
    }

    #[test]
    fn schema_is_stamped_only_at_the_root() {
        let model = Model {
            kind: Some(Kind::Object),
            properties: [("a".to_owned(), Model::typed(Kind::String))].into(),
            required: vec!["a".to_owned()],
            ..Model::default()
        };
        let json = model.to_persisted_json();
        assert_eq!(json["$schema"], json!(super::super::SCHEMA_URI));
        assert_eq!(json["properties"]["a"], json!({"type": "string"}));
        assert!(json["properties"]["a"].get("$schema").is_none());
    }

    #[test]
    fn persisted_round_trip() {
        let model = Model {
            kind: Some(Kind::String),
            min_length: Some(2),
            max_length: Some(8),
            format: Some(Format::Email),
            ..Model::default()
        };
        let text = serde_json::to_string(&model.to_persisted_json()).unwrap();
        let back = Model::from_persisted_json(&text).unwrap();
        assert_eq!(back.kind, Some(Kind::String));
        assert_eq!(back.format, Some(Format::Email));
        assert_eq!(back.schema.as_deref(), Some(super::super::SCHEMA_URI));
    }

    #[test]
    fn branch_precedence() {
        let model = Model {
            kind: Some(Kind::String),
            any_of: vec![Model::typed(Kind::Integer)],
            enum_values: vec![json!("a")],
            ..Model::default()
        };
        assert!(matches!(model.branch(), Branch::Enum(_)));

        let model = Model {
            kind: Some(Kind::String),
            any_of: vec![Model::typed(Kind::Integer)],
            ..Model::default()
        };
        assert!(matches!(model.branch(), Branch::AnyOf(_)));

        assert!(matches!(
            Model::typed(Kind::Boolean).branch(),
            Branch::Typed(Kind::Boolean)
        ));
    }
}
