//! Embedded hybrid lexical/semantic retrieval engine over a Markdown corpus.
//!
//! This crate is a transport-agnostic library: it exposes an [`Engine`] with
//! five async operations (`search`, `get_chunk`, `get_file`, `index_status`,
//! `reindex`) that an external tool-calling protocol (MCP or otherwise)
//! calls into. It does not bind a socket, parse CLI arguments, or install a
//! `tracing` subscriber — those are host-process concerns.

pub mod background;
pub mod chunker;
pub mod config;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod retrieval;
pub mod store;
pub mod watcher;

pub use background::{BackgroundIndexer, Job, JobRequest, JobStatus};
pub use chunker::{chunk_markdown, make_chunk_id, normalize_path, Chunk};
pub use config::{EmbeddingBackend, EngineConfig};
pub use embedder::{resolve_embedder, Embedder};
pub use engine::{
    AutoReindexOutcome, ChunkPayload, Engine, FilePayload, IndexStatusResponse, ReindexRequest,
    ReindexResponse, ScoreBreakdownPayload, SearchRequest, SearchResponse, SearchResultPayload,
};
pub use error::{EngineError, EngineResult};
pub use indexer::{Indexer, ReindexResult};
pub use retrieval::{ScoreBreakdown, SearchMode, SearchResult};
pub use store::Store;
pub use watcher::{FileWatcher, FileWatcherConfig};

/// Install a `tracing` subscriber scoped to the test harness (writes via
/// `libtest`'s captured-output writer, honors `RUST_LOG`). Idempotent.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}
