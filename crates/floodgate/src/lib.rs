// Floodgate is a MongoDB-wire-compatible front end over DataFlood models:
// clients connect with ordinary drivers and query collections whose
// documents are synthesized on demand from statistical models trained by
// their own inserts.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod aggregate;
mod collection;
mod cursor;
pub mod logging;
mod manager;
mod matcher;
mod projection;
mod query;
mod session;
mod storage;
mod update;

pub use collection::{Collection, CollectionInfo, FindOptions};
pub use cursor::CursorManager;
pub use manager::CollectionManager;
pub use session::Session;
pub use storage::ModelStore;

/// Advertised during the `hello` handshake.
pub const MAX_BSON_OBJECT_SIZE: i32 = 16 * 1024 * 1024;
pub const MAX_MESSAGE_SIZE_BYTES: i32 = 48_000_000;
pub const MIN_WIRE_VERSION: i32 = 0;
pub const MAX_WIRE_VERSION: i32 = 13;

/// Server-side tunables, fixed at startup from the CLI.
#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Pending inserts accumulate until this many trigger a training pass.
    pub train_batch_size: usize,
    /// Surrogate returned by `count` for a trained collection.
    pub count_estimate: i64,
    pub max_cursors: usize,
    pub cursor_timeout: Duration,
    pub model_cache_size: usize,
    /// First-reply batch size when the client does not name one.
    pub default_batch_size: usize,
    /// Implicit result cap for a `find` with no limit.
    pub max_result_size: usize,
    /// Documents generated as the seed population of a pipeline.
    pub aggregate_source_size: usize,
    /// A pipeline aborts when any stage's output exceeds this.
    pub aggregate_ceiling: usize,
    /// Generation chunk used while post-filtering toward a target count.
    pub generate_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            train_batch_size: 10,
            count_estimate: 100,
            max_cursors: 1000,
            cursor_timeout: Duration::from_secs(600),
            model_cache_size: 100,
            default_batch_size: 101,
            max_result_size: 1000,
            aggregate_source_size: 100,
            aggregate_ceiling: 100_000,
            generate_chunk_size: 1000,
        }
    }
}

/// Shared server state: the collection manager owns collections, the
/// cursor manager owns cursors.
pub struct App {
    pub config: Config,
    pub collections: CollectionManager,
    pub cursors: CursorManager,
    next_connection_id: AtomicU64,
}

impl App {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(ModelStore::new(
            config.data_dir.clone(),
            config.model_cache_size,
        ));
        Self {
            collections: CollectionManager::new(store, config.clone()),
            cursors: CursorManager::new(config.max_cursors, config.cursor_timeout),
            config,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A command-level failure, surfaced to the client as
/// `{ok: 0, errmsg, code}` inside a normal reply frame.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CommandError {
    pub code: i32,
    pub code_name: &'static str,
    pub message: String,
}

impl CommandError {
    pub fn bad_value(message: impl Into<String>) -> Self {
        Self {
            code: 2,
            code_name: "BadValue",
            message: message.into(),
        }
    }

    pub fn failed_to_parse(message: impl Into<String>) -> Self {
        Self {
            code: 9,
            code_name: "FailedToParse",
            message: message.into(),
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self {
            code: 14,
            code_name: "TypeMismatch",
            message: message.into(),
        }
    }

    pub fn illegal_operation(message: impl Into<String>) -> Self {
        Self {
            code: 20,
            code_name: "IllegalOperation",
            message: message.into(),
        }
    }

    pub fn index_not_found(message: impl Into<String>) -> Self {
        Self {
            code: 27,
            code_name: "IndexNotFound",
            message: message.into(),
        }
    }

    pub fn cursor_not_found(id: i64) -> Self {
        Self {
            code: 43,
            code_name: "CursorNotFound",
            message: format!("cursor id {id} not found"),
        }
    }

    pub fn command_not_found(name: &str) -> Self {
        Self {
            code: 59,
            code_name: "CommandNotFound",
            message: format!("no such command: '{name}'"),
        }
    }

    pub fn exceeded_limit(message: impl Into<String>) -> Self {
        Self {
            code: 10_334,
            code_name: "BSONObjectTooLarge",
            message: message.into(),
        }
    }
}

/// Render any handler error as an error reply document.
pub(crate) fn error_reply(err: &anyhow::Error) -> bson::Document {
    match err.downcast_ref::<CommandError>() {
        Some(command_error) => bson::doc! {
            "ok": 0.0,
            "errmsg": command_error.message.as_str(),
            "code": command_error.code,
            "codeName": command_error.code_name,
        },
        None => bson::doc! {
            "ok": 0.0,
            "errmsg": format!("{err:#}"),
            "code": 8,
            "codeName": "UnknownError",
        },
    }
}
