//! Tool surface: request-scoped orchestration of the store, indexer,
//! retrieval, background indexer, and watcher for the five operations an
//! external tool-calling transport invokes into (`search`, `get_chunk`,
//! `get_file`, `index_status`, `reindex`).
//!
//! Per-db-path caches (schema-initialized set, resolved embedder, the
//! background indexer singleton, last-auto-reindex timestamps) live as
//! fields of this `Engine` object rather than ambient globals, so tests can
//! construct a fresh one per case.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::background::{BackgroundIndexer, JobRequest};
use crate::config::EngineConfig;
use crate::embedder::{resolve_embedder, Embedder};
use crate::error::{EngineError, EngineResult};
use crate::indexer::Indexer;
use crate::retrieval::{self, SearchMode};
use crate::store::Store;
use crate::watcher::{FileWatcher, FileWatcherConfig};

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultPayload {
    pub chunk_id: String,
    pub path: String,
    pub heading_path: String,
    pub chunk_index: i64,
    pub content: String,
    pub score_breakdown: ScoreBreakdownPayload,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoreBreakdownPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bm25: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cosine: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rrf: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_rank: Option<usize>,
}

impl From<retrieval::ScoreBreakdown> for ScoreBreakdownPayload {
    fn from(s: retrieval::ScoreBreakdown) -> Self {
        Self {
            bm25: s.bm25,
            cosine: s.cosine,
            rrf: s.rrf,
            lexical_rank: s.lexical_rank,
            semantic_rank: s.semantic_rank,
        }
    }
}

impl From<retrieval::SearchResult> for SearchResultPayload {
    fn from(r: retrieval::SearchResult) -> Self {
        Self {
            chunk_id: r.chunk_id,
            path: r.path,
            heading_path: r.heading_path,
            chunk_index: r.chunk_index,
            content: r.content,
            score_breakdown: r.score_breakdown.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "executed")]
pub enum AutoReindexOutcome {
    #[serde(rename = "background")]
    Background { job_id: String },
    #[serde(rename = "skipped")]
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub mode: String,
    pub count: usize,
    pub embedding_model: String,
    pub auto_reindex: Option<AutoReindexOutcome>,
    pub results: Vec<SearchResultPayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkPayload {
    pub chunk_id: String,
    pub heading_path: String,
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilePayload {
    pub path: String,
    pub chunks: Vec<ChunkPayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatusResponse {
    pub db_path: String,
    pub files: i64,
    pub chunks: i64,
    pub embeddings: i64,
    pub embedding_backend: String,
    pub embedding_model: String,
    pub index_include_globs: Vec<String>,
    pub index_exclude_globs: Vec<String>,
    pub git_fingerprint: Option<serde_json::Value>,
    pub background_jobs: Vec<serde_json::Value>,
    pub file_watcher_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReindexResponse {
    Inline {
        indexed_files: usize,
        skipped_files: usize,
        deleted_files: i64,
        seen_paths: Vec<String>,
    },
    Queued {
        job_id: String,
        status: &'static str,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ReindexRequest {
    pub db_path: Option<PathBuf>,
    pub paths: Vec<PathBuf>,
    pub force: bool,
    pub prune_missing: bool,
    pub background: bool,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub db_path: Option<PathBuf>,
    pub query: String,
    pub top_k: usize,
    pub mode: String,
}

struct RuntimeEntry {
    embedder: Embedder,
    embedding_model: String,
}

pub struct Engine {
    base_config: EngineConfig,
    runtimes: DashMap<PathBuf, Arc<RuntimeEntry>>,
    schema_init: DashMap<PathBuf, ()>,
    schema_init_lock: Mutex<()>,
    backgrounds: DashMap<PathBuf, Arc<BackgroundIndexer>>,
    last_auto_reindex: Mutex<HashMap<PathBuf, Instant>>,
    watcher: Mutex<Option<FileWatcher>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            base_config: config,
            runtimes: DashMap::new(),
            schema_init: DashMap::new(),
            schema_init_lock: Mutex::new(()),
            backgrounds: DashMap::new(),
            last_auto_reindex: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
        }
    }

    fn resolve_db_path(&self, override_path: Option<&Path>) -> PathBuf {
        override_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_config.db_path.clone())
    }

    /// Ensure schema DDL has run exactly once for `db_path`, via
    /// double-checked locking over a `DashMap` presence check.
    fn ensure_schema(&self, db_path: &Path) -> EngineResult<()> {
        if self.schema_init.contains_key(db_path) {
            return Ok(());
        }
        let _guard = self.schema_init_lock.lock();
        if self.schema_init.contains_key(db_path) {
            return Ok(());
        }
        let store = Store::open(db_path)?;
        store.init_schema()?;
        self.schema_init.insert(db_path.to_path_buf(), ());
        Ok(())
    }

    fn runtime_for(&self, db_path: &Path) -> Arc<RuntimeEntry> {
        if let Some(entry) = self.runtimes.get(db_path) {
            return entry.clone();
        }
        let embedder = resolve_embedder(&self.base_config);
        let embedding_model = embedder.model_label();
        let entry = Arc::new(RuntimeEntry { embedder, embedding_model });
        self.runtimes.insert(db_path.to_path_buf(), entry.clone());
        entry
    }

    fn background_for(&self, db_path: &Path) -> Arc<BackgroundIndexer> {
        if let Some(bg) = self.backgrounds.get(db_path) {
            return bg.clone();
        }
        let bg = Arc::new(BackgroundIndexer::new());
        self.backgrounds.insert(db_path.to_path_buf(), bg.clone());
        bg
    }

    // ---- search -------------------------------------------------------

    pub async fn search(&self, req: SearchRequest) -> EngineResult<SearchResponse> {
        if !(1..=100).contains(&req.top_k) {
            return Err(EngineError::InvalidArgument {
                name: "top_k",
                reason: "must be in [1, 100]".to_string(),
            });
        }
        let mode: SearchMode = req.mode.parse()?;
        let db_path = self.resolve_db_path(req.db_path.as_deref());
        self.ensure_schema(&db_path)?;
        let runtime = self.runtime_for(&db_path);

        let auto_reindex = self.maybe_auto_reindex(&db_path);

        let query = req.query.clone();
        let top_k = req.top_k;
        let rrf_k = self.base_config.rrf_k;
        let db_path_for_blocking = db_path.clone();
        let results = tokio::task::spawn_blocking(move || -> EngineResult<Vec<retrieval::SearchResult>> {
            let store = Store::open(&db_path_for_blocking)?;
            match mode {
                SearchMode::Lexical => retrieval::lexical_search(&store, &query, top_k),
                SearchMode::Semantic => retrieval::semantic_search(&store, &runtime.embedder, &query, top_k),
                SearchMode::Hybrid => retrieval::hybrid_search(&store, &runtime.embedder, &query, top_k, rrf_k),
            }
        })
        .await
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("search task panicked: {}", e)))??;

        let runtime = self.runtime_for(&db_path);
        Ok(SearchResponse {
            query: req.query,
            mode: req.mode,
            count: results.len(),
            embedding_model: runtime.embedding_model.clone(),
            auto_reindex,
            results: results.into_iter().map(SearchResultPayload::from).collect(),
        })
    }

    /// Opportunistically enqueue a background reindex of the configured
    /// auto-reindex paths, throttled to one submission per
    /// `auto_reindex_min_interval_seconds` per db_path. The interval check
    /// and claim happen under one lock so concurrent searches don't
    /// stampede the background queue.
    fn maybe_auto_reindex(&self, db_path: &Path) -> Option<AutoReindexOutcome> {
        if !self.base_config.auto_reindex_on_search {
            return None;
        }

        let min_interval = Duration::from_secs_f64(self.base_config.auto_reindex_min_interval_seconds.max(0.0));
        let claimed = {
            let mut last = self.last_auto_reindex.lock();
            let now = Instant::now();
            let should_claim = match last.get(db_path) {
                Some(prev) => now.duration_since(*prev) >= min_interval,
                None => true,
            };
            if should_claim {
                last.insert(db_path.to_path_buf(), now);
            }
            should_claim
        };

        if !claimed {
            return Some(AutoReindexOutcome::Skipped {
                reason: "throttled: min interval not elapsed".to_string(),
            });
        }

        let background = self.background_for(db_path);
        let db_path_owned = db_path.to_path_buf();
        let paths = self.base_config.auto_reindex_paths.clone();
        let config = self.base_config.clone();
        let request = JobRequest {
            label: format!("auto-reindex::{}", db_path.display()),
            // Pruning is reserved for an explicit `reindex` call or the
            // watcher; an opportunistic search-triggered reindex must never
            // delete files outside `auto_reindex_paths`.
            run: Arc::new(move || run_reindex_job(&db_path_owned, &paths, false, false, &config)),
        };
        match background.submit(request) {
            Ok(job) => Some(AutoReindexOutcome::Background { job_id: job.id }),
            Err(e) => Some(AutoReindexOutcome::Skipped { reason: e.to_string() }),
        }
    }

    // ---- get_chunk / get_file ------------------------------------------

    pub async fn get_chunk(&self, db_path: Option<PathBuf>, chunk_id: String) -> EngineResult<ChunkPayload> {
        let db_path = self.resolve_db_path(db_path.as_deref());
        self.ensure_schema(&db_path)?;
        tokio::task::spawn_blocking(move || -> EngineResult<ChunkPayload> {
            let store = Store::open(&db_path)?;
            let row = store
                .get_chunk(&chunk_id)?
                .ok_or_else(|| EngineError::ChunkNotFound(chunk_id.clone()))?;
            Ok(ChunkPayload {
                chunk_id: row.chunk_id,
                heading_path: row.heading_path,
                chunk_index: row.chunk_index,
                content: row.content,
                token_count: row.token_count,
            })
        })
        .await
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("get_chunk task panicked: {}", e)))?
    }

    pub async fn get_file(&self, db_path: Option<PathBuf>, path: String) -> EngineResult<FilePayload> {
        let db_path = self.resolve_db_path(db_path.as_deref());
        self.ensure_schema(&db_path)?;
        tokio::task::spawn_blocking(move || -> EngineResult<FilePayload> {
            let store = Store::open(&db_path)?;
            let rows = store
                .get_file(&path)?
                .ok_or_else(|| EngineError::FileNotFound(path.clone()))?;
            Ok(FilePayload {
                path,
                chunks: rows
                    .into_iter()
                    .map(|row| ChunkPayload {
                        chunk_id: row.chunk_id,
                        heading_path: row.heading_path,
                        chunk_index: row.chunk_index,
                        content: row.content,
                        token_count: row.token_count,
                    })
                    .collect(),
            })
        })
        .await
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("get_file task panicked: {}", e)))?
    }

    // ---- index_status ---------------------------------------------------

    pub async fn index_status(&self, db_path: Option<PathBuf>) -> EngineResult<IndexStatusResponse> {
        let db_path = self.resolve_db_path(db_path.as_deref());
        self.ensure_schema(&db_path)?;
        let runtime = self.runtime_for(&db_path);
        let background = self.backgrounds.get(&db_path).map(|b| b.clone());

        let db_path_for_blocking = db_path.clone();
        let (status, git_fingerprint) = tokio::task::spawn_blocking(move || -> EngineResult<_> {
            let store = Store::open(&db_path_for_blocking)?;
            let status = store.index_status()?;
            let fingerprint = store
                .get_metadata("git_fingerprint")?
                .and_then(|v| serde_json::from_str(&v).ok());
            Ok((status, fingerprint))
        })
        .await
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("index_status task panicked: {}", e)))??;

        let background_jobs = background
            .map(|b| b.get_all_jobs().iter().map(|j| j.to_dict()).collect())
            .unwrap_or_default();

        Ok(IndexStatusResponse {
            db_path: db_path.display().to_string(),
            files: status.files,
            chunks: status.chunks,
            embeddings: status.embeddings,
            embedding_backend: format!("{:?}", self.base_config.embedding_backend).to_lowercase(),
            embedding_model: runtime.embedding_model.clone(),
            index_include_globs: self.base_config.index_include_globs.clone(),
            index_exclude_globs: self.base_config.index_exclude_globs.clone(),
            git_fingerprint,
            background_jobs,
            file_watcher_enabled: self.base_config.file_watcher_enabled,
        })
    }

    // ---- reindex --------------------------------------------------------

    pub async fn reindex(&self, req: ReindexRequest) -> EngineResult<ReindexResponse> {
        let db_path = self.resolve_db_path(req.db_path.as_deref());
        let paths = if req.paths.is_empty() {
            vec![PathBuf::from(".")]
        } else {
            req.paths.clone()
        };

        if req.background {
            let background = self.background_for(&db_path);
            let db_path_owned = db_path.clone();
            let force = req.force;
            let prune = req.prune_missing;
            let config = self.base_config.clone();
            let request = JobRequest {
                label: format!("reindex::{}", db_path.display()),
                run: Arc::new(move || run_reindex_job(&db_path_owned, &paths, force, prune, &config)),
            };
            let job = background.submit(request)?;
            return Ok(ReindexResponse::Queued { job_id: job.id, status: "queued" });
        }

        let db_path_for_blocking = db_path.clone();
        let force = req.force;
        let prune = req.prune_missing;
        let config = self.base_config.clone();
        let value =
            tokio::task::spawn_blocking(move || run_reindex_job(&db_path_for_blocking, &paths, force, prune, &config))
                .await
                .map_err(|e| EngineError::Internal(anyhow::anyhow!("reindex task panicked: {}", e)))??;

        Ok(ReindexResponse::Inline {
            indexed_files: value["indexed_files"].as_u64().unwrap_or(0) as usize,
            skipped_files: value["skipped_files"].as_u64().unwrap_or(0) as usize,
            deleted_files: value["deleted_files"].as_i64().unwrap_or(0),
            seen_paths: value["seen_paths"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
        })
    }

    // ---- file watcher ------------------------------------------------

    pub fn start_file_watcher(&self) {
        if !self.base_config.file_watcher_enabled || self.base_config.file_watcher_paths.is_empty() {
            return;
        }
        let db_path = self.base_config.db_path.clone();
        let background = self.background_for(&db_path);
        let config = FileWatcherConfig {
            db_path,
            watch_roots: self.base_config.file_watcher_paths.clone(),
            include_globs: self.base_config.index_include_globs.clone(),
            exclude_globs: self.base_config.index_exclude_globs.clone(),
            debounce_ms: self.base_config.file_watcher_debounce_ms,
            max_crash_restarts: 5,
            engine_config: self.base_config.clone(),
        };
        let mut guard = self.watcher.lock();
        *guard = Some(FileWatcher::start(config, background));
    }

    /// Shut down the background indexer(s) and stop the watcher. Called
    /// from the process-exit hook; bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        if let Some(mut watcher) = self.watcher.lock().take() {
            watcher.stop(timeout).await;
        }
        for entry in self.backgrounds.iter() {
            entry.value().shutdown(timeout).await;
        }
    }
}

/// Runs a multi-root reindex pass (the `reindex_many` orchestration):
/// aggregates counts across every path, optionally prunes files missing
/// from the combined scan set, and records a combined git fingerprint (or
/// deletes it if none of the roots sit in a git worktree). Returns a JSON
/// value so it can be used uniformly as an inline result or a background
/// job's `result` payload.
pub fn run_reindex_job(
    db_path: &Path,
    paths: &[PathBuf],
    force: bool,
    prune_missing: bool,
    config: &EngineConfig,
) -> EngineResult<serde_json::Value> {
    let store = Store::open(db_path)?;
    store.init_schema()?;

    let embedder = resolve_embedder(config);

    let mut indexed_files = 0usize;
    let mut skipped_files = 0usize;
    let mut seen_paths: Vec<String> = Vec::new();

    for root in paths {
        let indexer = Indexer::new(
            &store,
            config.max_chunk_chars,
            config.min_chunk_chars,
            &embedder,
            &config.index_include_globs,
            &config.index_exclude_globs,
        );
        let result = indexer.reindex_path(root, force)?;
        indexed_files += result.indexed_files;
        skipped_files += result.skipped_files;
        seen_paths.extend(result.seen_paths);
    }

    let deleted_files = if prune_missing {
        store.delete_files_except(&seen_paths)?
    } else {
        0
    };

    match compute_git_fingerprint(paths) {
        Some(fp) => store.set_metadata("git_fingerprint", &serde_json::to_string(&fp)?)?,
        None => store.delete_metadata("git_fingerprint")?,
    }

    tracing::info!(
        db_path = %db_path.display(),
        indexed_files,
        skipped_files,
        deleted_files,
        "reindex job complete"
    );

    Ok(serde_json::json!({
        "indexed_files": indexed_files,
        "skipped_files": skipped_files,
        "deleted_files": deleted_files,
        "seen_paths": seen_paths,
    }))
}

/// Summarize the VCS state of the first root that sits inside a git
/// worktree: `{worktree, head, branch, dirty}`. Returns `None` if no root is
/// inside a git repository (or `git` is not on `PATH`).
fn compute_git_fingerprint(paths: &[PathBuf]) -> Option<serde_json::Value> {
    for root in paths {
        let dir = if root.is_dir() {
            root.clone()
        } else {
            root.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
        };

        let toplevel = run_git(&dir, &["rev-parse", "--show-toplevel"]);
        let Some(worktree) = toplevel else { continue };

        let head = run_git(&dir, &["rev-parse", "HEAD"]).unwrap_or_default();
        let branch = run_git(&dir, &["rev-parse", "--abbrev-ref", "HEAD"]).unwrap_or_default();
        let dirty = run_git(&dir, &["status", "--porcelain"])
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);

        return Some(serde_json::json!({
            "worktree": worktree,
            "head": head,
            "branch": branch,
            "dirty": dirty,
        }));
    }
    None
}

fn run_git(dir: &Path, args: &[&str]) -> Option<String> {
    let output = std::process::Command::new("git").args(args).current_dir(dir).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(db_path: PathBuf) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.db_path = db_path;
        cfg.embedding_backend = crate::config::EmbeddingBackend::Hash;
        cfg.embedding_dim = 64;
        cfg
    }

    #[tokio::test]
    async fn search_rejects_out_of_range_top_k() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path().join("e.db")));
        let err = engine
            .search(SearchRequest {
                db_path: None,
                query: "x".into(),
                top_k: 0,
                mode: "hybrid".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn search_rejects_unknown_mode() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path().join("e.db")));
        let err = engine
            .search(SearchRequest {
                db_path: None,
                query: "x".into(),
                top_k: 5,
                mode: "bogus".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn reindex_then_search_end_to_end() {
        crate::init_test_tracing();
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("e.db");
        std::fs::write(
            dir.path().join("one.md"),
            "# Cache\n\nredis cache policy and ttl configuration for the service layer here.\n",
        )
        .unwrap();

        let engine = Engine::new(test_config(db_path));
        let result = engine
            .reindex(ReindexRequest {
                db_path: None,
                paths: vec![dir.path().to_path_buf()],
                force: false,
                prune_missing: false,
                background: false,
            })
            .await
            .unwrap();
        match result {
            ReindexResponse::Inline { indexed_files, .. } => assert_eq!(indexed_files, 1),
            _ => panic!("expected inline reindex result"),
        }

        let response = engine
            .search(SearchRequest {
                db_path: None,
                query: "cache ttl".into(),
                top_k: 3,
                mode: "hybrid".into(),
            })
            .await
            .unwrap();
        assert!(response.results.iter().any(|r| r.path == "one.md"));
    }

    #[tokio::test]
    async fn reindex_background_returns_job_id_then_completes() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("e.db");
        std::fs::write(dir.path().join("a.md"), "# A\n\nsome content long enough to be kept as a real chunk.\n").unwrap();

        let engine = Engine::new(test_config(db_path));
        let result = engine
            .reindex(ReindexRequest {
                db_path: None,
                paths: vec![dir.path().to_path_buf()],
                force: false,
                prune_missing: false,
                background: true,
            })
            .await
            .unwrap();
        let job_id = match result {
            ReindexResponse::Queued { job_id, status } => {
                assert_eq!(status, "queued");
                job_id
            }
            _ => panic!("expected queued result"),
        };

        let background = engine.background_for(&engine.base_config.db_path.clone());
        assert!(background.drain(Duration::from_secs(5)).await);
        let job = background.get_job(&job_id).unwrap();
        assert_eq!(job.status, crate::background::JobStatus::Completed);
    }

    #[tokio::test]
    async fn get_chunk_not_found_is_a_domain_error() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path().join("e.db")));
        let err = engine.get_chunk(None, "missing".into()).await.unwrap_err();
        assert!(matches!(err, EngineError::ChunkNotFound(_)));
    }
}
