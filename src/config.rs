use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which embedding capability to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Prefer the learned embedder; fall back to the hash embedder if
    /// unavailable (feature not compiled in, or model failed to load).
    Auto,
    /// Deterministic hash embedder, unconditionally.
    Hash,
    /// Explicitly request the learned embedder, falling back to hash.
    Onnx,
}

impl Default for EmbeddingBackend {
    fn default() -> Self {
        EmbeddingBackend::Auto
    }
}

impl std::str::FromStr for EmbeddingBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hash" => Ok(EmbeddingBackend::Hash),
            "onnx" => Ok(EmbeddingBackend::Onnx),
            _ => Ok(EmbeddingBackend::Auto),
        }
    }
}

/// Engine-wide configuration. Mirrors every field described in SPEC_FULL.md
/// §6's configuration table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub db_path: PathBuf,

    pub max_chunk_chars: usize,
    pub min_chunk_chars: usize,

    pub rrf_k: u32,

    pub embedding_backend: EmbeddingBackend,
    pub embedding_dim: usize,
    pub embedding_model: String,

    pub index_include_globs: Vec<String>,
    pub index_exclude_globs: Vec<String>,

    pub auto_reindex_on_search: bool,
    pub auto_reindex_paths: Vec<PathBuf>,
    pub auto_reindex_min_interval_seconds: f64,

    pub file_watcher_enabled: bool,
    pub file_watcher_paths: Vec<PathBuf>,
    pub file_watcher_debounce_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_chunk_chars: 2000,
            min_chunk_chars: 120,
            rrf_k: 60,
            embedding_backend: EmbeddingBackend::Auto,
            embedding_dim: 384,
            embedding_model: "BAAI/bge-small-en-v1.5".to_string(),
            index_include_globs: vec!["*.md".to_string()],
            index_exclude_globs: vec![
                ".git/*".to_string(),
                ".venv/*".to_string(),
                "**/__pycache__/*".to_string(),
                "**/.pytest_cache/*".to_string(),
                "**/.ruff_cache/*".to_string(),
                "**/node_modules/*".to_string(),
            ],
            auto_reindex_on_search: false,
            auto_reindex_paths: vec![PathBuf::from(".")],
            auto_reindex_min_interval_seconds: 2.0,
            file_watcher_enabled: false,
            file_watcher_paths: Vec::new(),
            file_watcher_debounce_ms: 500,
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("corpusdb").join("corpus.db"))
        .unwrap_or_else(|| PathBuf::from(".corpusdb/corpus.db"))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn parse_glob_list(key: &str, default: &[&str]) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
}

fn parse_path_list(key: &str, default: &[&str]) -> Vec<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| PathBuf::from(s.trim()))
                .filter(|p| !p.as_os_str().is_empty())
                .collect()
        })
        .unwrap_or_else(|| default.iter().map(PathBuf::from).collect())
}

impl EngineConfig {
    /// Load configuration from `CORPUSDB_*` environment variables, falling
    /// back to defaults on any parse failure (logged, never panics).
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let db_path = std::env::var("CORPUSDB_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let embedding_backend = std::env::var("CORPUSDB_EMBEDDING_BACKEND")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.embedding_backend);

        Self {
            db_path,
            max_chunk_chars: parse_env("CORPUSDB_MAX_CHUNK_CHARS", defaults.max_chunk_chars),
            min_chunk_chars: parse_env("CORPUSDB_MIN_CHUNK_CHARS", defaults.min_chunk_chars),
            rrf_k: parse_env("CORPUSDB_RRF_K", defaults.rrf_k),
            embedding_backend,
            embedding_dim: parse_env("CORPUSDB_EMBEDDING_DIM", defaults.embedding_dim),
            embedding_model: std::env::var("CORPUSDB_EMBEDDING_MODEL")
                .unwrap_or(defaults.embedding_model),
            index_include_globs: parse_glob_list("CORPUSDB_INDEX_INCLUDE_GLOBS", &["*.md"]),
            index_exclude_globs: parse_glob_list(
                "CORPUSDB_INDEX_EXCLUDE_GLOBS",
                &[
                    ".git/*",
                    ".venv/*",
                    "**/__pycache__/*",
                    "**/.pytest_cache/*",
                    "**/.ruff_cache/*",
                    "**/node_modules/*",
                ],
            ),
            auto_reindex_on_search: parse_bool_env(
                "CORPUSDB_AUTO_REINDEX_ON_SEARCH",
                defaults.auto_reindex_on_search,
            ),
            auto_reindex_paths: parse_path_list("CORPUSDB_AUTO_REINDEX_PATHS", &["."]),
            auto_reindex_min_interval_seconds: parse_env(
                "CORPUSDB_AUTO_REINDEX_MIN_INTERVAL_SECONDS",
                defaults.auto_reindex_min_interval_seconds,
            ),
            file_watcher_enabled: parse_bool_env(
                "CORPUSDB_FILE_WATCHER",
                defaults.file_watcher_enabled,
            ),
            file_watcher_paths: parse_path_list("CORPUSDB_FILE_WATCHER_PATHS", &[]),
            file_watcher_debounce_ms: parse_env(
                "CORPUSDB_FILE_WATCHER_DEBOUNCE_MS",
                defaults.file_watcher_debounce_ms,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = EngineConfig::default();
        assert_eq!(c.max_chunk_chars, 2000);
        assert_eq!(c.min_chunk_chars, 120);
        assert_eq!(c.rrf_k, 60);
        assert_eq!(c.embedding_dim, 384);
        assert_eq!(c.embedding_backend, EmbeddingBackend::Auto);
        assert!(!c.auto_reindex_on_search);
        assert!(!c.file_watcher_enabled);
    }

    #[test]
    fn backend_from_str_unrecognized_falls_back_to_auto() {
        let backend: EmbeddingBackend = "bogus".parse().unwrap();
        assert_eq!(backend, EmbeddingBackend::Auto);
    }
}
