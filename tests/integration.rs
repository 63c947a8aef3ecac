//! End-to-end scenarios exercised through the public `Engine` surface, on a
//! real `tempfile::tempdir()`-backed `.db` file and small Markdown fixtures
//! written to disk. Each test corresponds to one end-to-end scenario from
//! the component design's testable-properties section.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use corpusdb::background::{BackgroundIndexer, JobRequest};
use corpusdb::config::{EmbeddingBackend, EngineConfig};
use corpusdb::engine::{Engine, ReindexRequest, SearchRequest};

fn hash_config(db_path: PathBuf) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.db_path = db_path;
    cfg.embedding_backend = EmbeddingBackend::Hash;
    cfg.embedding_dim = 64;
    cfg
}

#[tokio::test]
async fn hybrid_search_finds_seeded_file() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("docs")).unwrap();
    std::fs::write(
        dir.path().join("docs").join("one.md"),
        "# Cache\n\nredis cache policy and ttl configuration details for the service layer go here.\n",
    )
    .unwrap();

    let engine = Engine::new(hash_config(dir.path().join("store.db")));
    engine
        .reindex(ReindexRequest {
            db_path: None,
            paths: vec![dir.path().to_path_buf()],
            force: false,
            prune_missing: false,
            background: false,
        })
        .await
        .unwrap();

    let response = engine
        .search(SearchRequest {
            db_path: None,
            query: "cache ttl".to_string(),
            top_k: 3,
            mode: "hybrid".to_string(),
        })
        .await
        .unwrap();

    assert!(response.results.iter().any(|r| r.path == "docs/one.md"));
}

#[tokio::test]
async fn semantic_search_ranks_nearest_chunk_first() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("mixed.md"),
        "# Cache\n\nredis cache ttl policy and eviction details for the caching subsystem overall.\n\n# Protocol\n\nmcp protocol server tool description and the contract it exposes to clients.\n",
    )
    .unwrap();

    let engine = Engine::new(hash_config(dir.path().join("store.db")));
    engine
        .reindex(ReindexRequest {
            db_path: None,
            paths: vec![dir.path().to_path_buf()],
            force: false,
            prune_missing: false,
            background: false,
        })
        .await
        .unwrap();

    let response = engine
        .search(SearchRequest {
            db_path: None,
            query: "protocol tools".to_string(),
            top_k: 1,
            mode: "semantic".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].heading_path, "Protocol");
    assert!(response.results[0].score_breakdown.cosine.is_some());
}

#[tokio::test]
async fn exclude_glob_skips_vendored_directory() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("kept.md"),
        "# Kept\n\nthis file lives at the source root and should be indexed by the scan.\n",
    )
    .unwrap();
    std::fs::create_dir_all(dir.path().join(".venv").join("pkg")).unwrap();
    std::fs::write(
        dir.path().join(".venv").join("pkg").join("skip.md"),
        "# Skip\n\nthis file lives inside a vendored virtualenv directory and must be excluded.\n",
    )
    .unwrap();

    let mut cfg = hash_config(dir.path().join("store.db"));
    cfg.index_include_globs = vec!["*.md".to_string()];
    cfg.index_exclude_globs = vec![".venv/*".to_string()];
    let engine = Engine::new(cfg);

    engine
        .reindex(ReindexRequest {
            db_path: None,
            paths: vec![dir.path().to_path_buf()],
            force: false,
            prune_missing: false,
            background: false,
        })
        .await
        .unwrap();

    let status = engine.index_status(None).await.unwrap();
    assert_eq!(status.files, 1);
}

#[tokio::test]
async fn prune_missing_removes_deleted_file_on_reindex() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("a.md"),
        "# A\n\nfile a content that is long enough to be retained as a real chunk here.\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("b.md"),
        "# B\n\nfile b content that is long enough to be retained as a real chunk here too.\n",
    )
    .unwrap();

    let engine = Engine::new(hash_config(dir.path().join("store.db")));
    engine
        .reindex(ReindexRequest {
            db_path: None,
            paths: vec![dir.path().to_path_buf()],
            force: false,
            prune_missing: false,
            background: false,
        })
        .await
        .unwrap();
    assert_eq!(engine.index_status(None).await.unwrap().files, 2);

    std::fs::remove_file(dir.path().join("b.md")).unwrap();

    let result = engine
        .reindex(ReindexRequest {
            db_path: None,
            paths: vec![dir.path().to_path_buf()],
            force: false,
            prune_missing: true,
            background: false,
        })
        .await
        .unwrap();

    match result {
        corpusdb::engine::ReindexResponse::Inline { deleted_files, .. } => {
            assert_eq!(deleted_files, 1);
        }
        other => panic!("expected an inline reindex result, got {other:?}"),
    }

    let status = engine.index_status(None).await.unwrap();
    assert_eq!(status.files, 1);
}

#[tokio::test]
async fn three_background_jobs_run_fifo_and_all_complete() {
    let background = BackgroundIndexer::new();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut job_ids = Vec::new();
    for tag in ["a", "b", "c"] {
        let order = order.clone();
        let tag = tag.to_string();
        let job = background
            .submit(JobRequest {
                label: tag.clone(),
                run: Arc::new(move || {
                    order.lock().push(tag.clone());
                    Ok(serde_json::json!({"tag": tag}))
                }),
            })
            .unwrap();
        job_ids.push(job.id);
    }

    assert!(background.drain(Duration::from_secs(5)).await);

    assert_eq!(*order.lock(), vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    for id in &job_ids {
        let job = background.get_job(id).unwrap();
        assert_eq!(job.status, corpusdb::background::JobStatus::Completed);
    }
}

#[tokio::test]
async fn auto_reindex_on_search_submits_a_background_job() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("one.md"),
        "# Topic\n\nsome searchable content seeded after the first search call completes here.\n",
    )
    .unwrap();

    let mut cfg = hash_config(dir.path().join("store.db"));
    cfg.auto_reindex_on_search = true;
    cfg.auto_reindex_paths = vec![dir.path().to_path_buf()];
    cfg.auto_reindex_min_interval_seconds = 0.0;
    let engine = Engine::new(cfg);

    let first = engine
        .search(SearchRequest {
            db_path: None,
            query: "topic content".to_string(),
            top_k: 5,
            mode: "lexical".to_string(),
        })
        .await
        .unwrap();

    let job_id = match first.auto_reindex {
        Some(corpusdb::engine::AutoReindexOutcome::Background { job_id }) => job_id,
        other => panic!("expected a background auto-reindex outcome, got {other:?}"),
    };
    assert!(!job_id.is_empty());

    // No handle to the background indexer from outside the engine; poll
    // `index_status` (which snapshots every job) until the submitted job
    // leaves the queued/running states.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = engine.index_status(None).await.unwrap();
        let job = status
            .background_jobs
            .iter()
            .find(|j| j["id"] == serde_json::json!(job_id));
        if let Some(job) = job {
            if job["status"] == serde_json::json!("completed") {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "auto-reindex job never completed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let second = engine
        .search(SearchRequest {
            db_path: None,
            query: "topic content".to_string(),
            top_k: 5,
            mode: "lexical".to_string(),
        })
        .await
        .unwrap();
    assert!(second.results.iter().any(|r| r.path == "one.md"));
}

#[tokio::test]
async fn auto_reindex_on_search_never_prunes_files_outside_its_scope() {
    let dir = tempdir().unwrap();
    let scoped = dir.path().join("scoped");
    let unscoped = dir.path().join("unscoped");
    std::fs::create_dir_all(&scoped).unwrap();
    std::fs::create_dir_all(&unscoped).unwrap();
    std::fs::write(
        scoped.join("a.md"),
        "# Scoped\n\nthis file lives under the auto-reindex path and stays indexed.\n",
    )
    .unwrap();
    std::fs::write(
        unscoped.join("b.md"),
        "# Unscoped\n\nthis file lives outside the auto-reindex path and must not be pruned.\n",
    )
    .unwrap();

    let mut cfg = hash_config(dir.path().join("store.db"));
    cfg.auto_reindex_on_search = true;
    cfg.auto_reindex_paths = vec![scoped.clone()];
    cfg.auto_reindex_min_interval_seconds = 0.0;
    let engine = Engine::new(cfg);

    // Index both trees explicitly first, so `unscoped/b.md` is a real row
    // that an opportunistic, scope-limited reindex must leave alone.
    engine
        .reindex(ReindexRequest {
            db_path: None,
            paths: vec![scoped.clone(), unscoped.clone()],
            force: false,
            prune_missing: false,
            background: false,
        })
        .await
        .unwrap();
    assert_eq!(engine.index_status(None).await.unwrap().files, 2);

    let first = engine
        .search(SearchRequest {
            db_path: None,
            query: "scoped".to_string(),
            top_k: 5,
            mode: "lexical".to_string(),
        })
        .await
        .unwrap();
    let job_id = match first.auto_reindex {
        Some(corpusdb::engine::AutoReindexOutcome::Background { job_id }) => job_id,
        other => panic!("expected a background auto-reindex outcome, got {other:?}"),
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = engine.index_status(None).await.unwrap();
        let job = status
            .background_jobs
            .iter()
            .find(|j| j["id"] == serde_json::json!(job_id));
        if let Some(job) = job {
            if job["status"] == serde_json::json!("completed") {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "auto-reindex job never completed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // `unscoped/b.md` is outside `auto_reindex_paths`; the opportunistic
    // reindex must not have pruned it.
    assert_eq!(engine.index_status(None).await.unwrap().files, 2);
}
