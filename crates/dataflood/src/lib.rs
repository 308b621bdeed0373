// A DataFlood model is a JSON-Schema-shaped description of a collection,
// extended with per-field histograms for numerics and character/n-gram/
// value-frequency models for strings. This crate defines the model, infers
// one from sample documents, merges models incrementally, and samples
// synthetic documents from them.

mod entropy;
mod enum_detect;
mod formats;
mod generate;
mod histogram;
mod infer;
mod merge;
mod model;
mod patterns;
mod string_model;

pub use entropy::{round2, round4, shannon};
pub use enum_detect::{detect_enum, Category, Confidence, EnumConfig, EnumDecision};
pub use formats::Format;
pub use generate::{Constraint, GenerateOptions, Generator};
pub use histogram::{Bin, Histogram};
pub use infer::{infer, InferConfig};
pub use merge::merge;
pub use model::{Branch, Kind, Model, Relationship, RelationshipKind, TidesConfig};
pub use string_model::StringModel;

/// `$schema` stamped onto the root of every persisted model.
pub const SCHEMA_URI: &str = "http://json-schema.org/draft-07/schema#";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot infer a model from an empty document batch")]
    EmptyInput,
    #[error("model JSON is invalid: {0}")]
    InvalidModel(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
