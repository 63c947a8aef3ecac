//! Incremental indexing: walks a root, applies include/exclude globs,
//! decides skip/update/reindex per file via a (mtime, size) → hash gate,
//! and writes chunks + embeddings within one commit per `reindex_path` call.

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::chunker::{chunk_markdown, normalize_path};
use crate::embedder::Embedder;
use crate::error::EngineResult;
use crate::store::Store;

#[derive(Debug, Clone, Default)]
pub struct ReindexResult {
    pub indexed_files: usize,
    pub skipped_files: usize,
    pub seen_paths: Vec<String>,
}

pub struct Indexer<'a> {
    store: &'a Store,
    max_chunk_chars: usize,
    min_chunk_chars: usize,
    embedder: &'a Embedder,
    embedding_model: String,
    include: GlobSet,
    exclude: GlobSet,
}

fn build_globset(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        if let Ok(g) = Glob::new(p) {
            builder.add(g);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSetBuilder::new().build().unwrap())
}

struct CandidateState {
    rel: String,
    abs_path: PathBuf,
}

impl<'a> Indexer<'a> {
    pub fn new(
        store: &'a Store,
        max_chunk_chars: usize,
        min_chunk_chars: usize,
        embedder: &'a Embedder,
        include_globs: &[String],
        exclude_globs: &[String],
    ) -> Self {
        Self {
            store,
            max_chunk_chars,
            min_chunk_chars,
            embedder,
            embedding_model: embedder.model_label(),
            include: build_globset(include_globs),
            exclude: build_globset(exclude_globs),
        }
    }

    fn is_included(&self, rel: &str) -> bool {
        self.include.is_match(rel) || self.include.is_match(Path::new(rel).file_name().unwrap_or_default())
    }

    fn is_excluded(&self, rel: &str) -> bool {
        self.exclude.is_match(rel)
    }

    /// Reindex a single root (file or directory). Files failing the
    /// (mtime,size)→hash fast-path gate are re-chunked and re-embedded;
    /// everything else is skipped without touching chunks/embeddings, or
    /// (on a hash match with stale stat) refreshed in place.
    pub fn reindex_path(&self, root: &Path, force: bool) -> EngineResult<ReindexResult> {
        let root = dunce::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());

        let (source_root, candidates) = if root.is_file() {
            let parent = root.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from("."));
            (parent, vec![root.clone()])
        } else {
            let mut files = Vec::new();
            for entry in WalkBuilder::new(&root)
                .git_ignore(false)
                .git_exclude(false)
                .git_global(false)
                .ignore(false)
                .hidden(false)
                .build()
            {
                if let Ok(entry) = entry {
                    if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                        files.push(entry.path().to_path_buf());
                    }
                }
            }
            (root.clone(), files)
        };

        let existing_meta = self.store.get_all_file_meta()?;

        let mut candidate_states = Vec::new();
        for path in &candidates {
            let rel = path
                .strip_prefix(&source_root)
                .unwrap_or(path)
                .to_string_lossy()
                .to_string();
            let rel = normalize_path(&rel);
            if !self.is_included(&rel) || self.is_excluded(&rel) {
                continue;
            }
            candidate_states.push(CandidateState { rel, abs_path: path.clone() });
        }

        // Parallel stat+hash classification pass; no store writes here.
        #[derive(Clone)]
        enum Action {
            SkipUnchanged,
            RefreshStatOnly { mtime_ns: i64, size: i64, sha256: String },
            Reindex { mtime_ns: i64, size: i64, sha256: String, text: String },
        }

        let classified: Vec<(String, Option<Action>)> = candidate_states
            .par_iter()
            .map(|c| {
                let meta = match std::fs::metadata(&c.abs_path) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(path = %c.rel, error = %e, "skipping file: stat failed");
                        return (c.rel.clone(), None);
                    }
                };
                let mtime_ns = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos() as i64)
                    .unwrap_or(0);
                let size = meta.len() as i64;

                if !force {
                    if let Some(existing) = existing_meta.get(&c.rel) {
                        if existing.mtime_ns == mtime_ns && existing.size_bytes == size {
                            return (c.rel.clone(), Some(Action::SkipUnchanged));
                        }
                    }
                }

                let bytes = match std::fs::read(&c.abs_path) {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(path = %c.rel, error = %e, "skipping file: read failed");
                        return (c.rel.clone(), None);
                    }
                };
                let sha256 = format!("{:x}", Sha256::digest(&bytes));

                if !force {
                    if let Some(existing) = existing_meta.get(&c.rel) {
                        if existing.sha256 == sha256 {
                            return (
                                c.rel.clone(),
                                Some(Action::RefreshStatOnly { mtime_ns, size, sha256 }),
                            );
                        }
                    }
                }

                let text = String::from_utf8_lossy(&bytes).to_string();
                (c.rel.clone(), Some(Action::Reindex { mtime_ns, size, sha256, text }))
            })
            .collect();

        let mut indexed = 0usize;
        let mut skipped = 0usize;
        let mut seen_paths = Vec::new();

        for (rel, action) in classified {
            seen_paths.push(rel.clone());
            match action {
                None => {}
                Some(Action::SkipUnchanged) => skipped += 1,
                Some(Action::RefreshStatOnly { mtime_ns, size, sha256 }) => {
                    self.store.upsert_file(&rel, mtime_ns, size, &sha256)?;
                    skipped += 1;
                }
                Some(Action::Reindex { mtime_ns, size, sha256, text }) => {
                    let chunks = chunk_markdown(&text, &rel, self.max_chunk_chars, self.min_chunk_chars);
                    let vectors = chunks
                        .iter()
                        .map(|c| self.embedder.embed(&c.content).map_err(crate::error::EngineError::Internal))
                        .collect::<EngineResult<Vec<_>>>()?;
                    self.store.reindex_file_in_transaction(
                        &rel,
                        mtime_ns,
                        size,
                        &sha256,
                        &chunks,
                        &self.embedding_model,
                        &vectors,
                    )?;
                    indexed += 1;
                }
            }
        }

        tracing::info!(indexed, skipped, root = %root.display(), "reindex pass complete");
        Ok(ReindexResult { indexed_files: indexed, skipped_files: skipped, seen_paths })
    }
}
