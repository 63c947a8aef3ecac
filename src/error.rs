use std::path::Path;
use thiserror::Error;

/// Domain error type for the engine. Every variant carries enough structured
/// context (db path, argument name, retry count) for a caller to act on
/// without parsing a message string.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("storage error for {db_path}: {source}. {rebuild_hint}")]
    Storage {
        db_path: String,
        rebuild_hint: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("invalid argument {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("background indexer is shut down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Wrap a raw `rusqlite::Error` with an actionable rebuild command
/// referencing the target database path, matching the message shape the
/// original implementation's MCP tool layer used for schema-mismatch style
/// failures.
pub fn storage_error(db_path: &Path, source: rusqlite::Error) -> EngineError {
    let rebuild_hint = format!(
        "If this is due to a schema mismatch, rebuild the database: `corpusdb-rebuild --db {}`",
        db_path.display()
    );
    EngineError::Storage {
        db_path: db_path.display().to_string(),
        rebuild_hint,
        source,
    }
}
