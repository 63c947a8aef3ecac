//! Lexical, semantic, and hybrid (RRF-fused) search over a `Store`.
//!
//! Lexical delegates straight to the store's BM25 query compilation.
//! Semantic is brute-force cosine similarity over every stored embedding —
//! no ANN index; the corpus is assumed to fit comfortably in memory at
//! query time. Hybrid runs both at `2 * top_k` depth and fuses their
//! chunk_id orderings with Reciprocal Rank Fusion.

use std::collections::HashMap;

use crate::embedder::Embedder;
use crate::error::{EngineError, EngineResult};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Lexical,
    Semantic,
    Hybrid,
}

impl std::str::FromStr for SearchMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lexical" => Ok(SearchMode::Lexical),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(EngineError::InvalidArgument {
                name: "mode",
                reason: format!("unknown search mode {:?}, expected lexical|semantic|hybrid", other),
            }),
        }
    }
}

/// Breakdown of the score(s) that produced a result's rank. Fields are
/// populated according to the mode that produced the result: lexical-only
/// searches set `bm25`, semantic-only set `cosine`, hybrid sets `rrf` plus
/// whichever of `lexical_rank`/`semantic_rank` the chunk appeared at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreBreakdown {
    /// Raw `bm25()` value from the FTS virtual table. SQLite's FTS5
    /// convention is that *smaller is better* (more negative = more
    /// relevant); this is reported verbatim, not inverted — callers must
    /// sort ascending on this field, matching `Store::lexical_search`'s own
    /// `ORDER BY bm25(...) ASC`.
    pub bm25: Option<f64>,
    /// Cosine similarity in `[-1, 1]`, larger is better.
    pub cosine: Option<f32>,
    /// Reciprocal Rank Fusion score, larger is better.
    pub rrf: Option<f64>,
    pub lexical_rank: Option<usize>,
    pub semantic_rank: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk_id: String,
    pub path: String,
    pub heading_path: String,
    pub chunk_index: i64,
    pub content: String,
    pub score_breakdown: ScoreBreakdown,
}

pub fn lexical_search(store: &Store, query: &str, top_k: usize) -> EngineResult<Vec<SearchResult>> {
    let rows = store.lexical_search(query, top_k)?;
    Ok(rows
        .into_iter()
        .map(|r| SearchResult {
            chunk_id: r.chunk_id,
            path: r.path,
            heading_path: r.heading_path,
            chunk_index: r.chunk_index,
            content: r.content,
            score_breakdown: ScoreBreakdown {
                bm25: Some(r.bm25_score),
                ..Default::default()
            },
        })
        .collect())
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

pub fn semantic_search(
    store: &Store,
    embedder: &Embedder,
    query: &str,
    top_k: usize,
) -> EngineResult<Vec<SearchResult>> {
    let query_vec = embedder.embed(query).map_err(EngineError::Internal)?;
    let rows = store.all_embeddings()?;

    let mut scored: Vec<(f32, usize)> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| (cosine(&query_vec, &row.vector), i))
        .collect();
    // Descending similarity; ties keep the store's original row order
    // (stable sort on a derived key preserves insertion order).
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);

    Ok(scored
        .into_iter()
        .map(|(score, i)| {
            let row = &rows[i];
            SearchResult {
                chunk_id: row.chunk_id.clone(),
                path: row.path.clone(),
                heading_path: row.heading_path.clone(),
                chunk_index: row.chunk_index,
                content: row.content.clone(),
                score_breakdown: ScoreBreakdown {
                    cosine: Some(score),
                    ..Default::default()
                },
            }
        })
        .collect())
}

/// Reciprocal Rank Fusion over two 1-based-rank chunk_id orderings:
/// `score(chunk) = sum over lists containing it of 1 / (k + rank)`.
pub fn hybrid_search(
    store: &Store,
    embedder: &Embedder,
    query: &str,
    top_k: usize,
    rrf_k: u32,
) -> EngineResult<Vec<SearchResult>> {
    let depth = top_k.saturating_mul(2).max(top_k);
    let lexical = lexical_search(store, query, depth)?;
    let semantic = semantic_search(store, embedder, query, depth)?;

    let lexical_rank: HashMap<&str, usize> = lexical
        .iter()
        .enumerate()
        .map(|(i, r)| (r.chunk_id.as_str(), i + 1))
        .collect();
    let semantic_rank: HashMap<&str, usize> = semantic
        .iter()
        .enumerate()
        .map(|(i, r)| (r.chunk_id.as_str(), i + 1))
        .collect();

    let semantic_by_id: HashMap<&str, &SearchResult> =
        semantic.iter().map(|r| (r.chunk_id.as_str(), r)).collect();
    let lexical_by_id: HashMap<&str, &SearchResult> =
        lexical.iter().map(|r| (r.chunk_id.as_str(), r)).collect();

    // Preserve first-seen insertion order across both lists for stable
    // tie-breaking, as neither HashMap iteration order is meaningful.
    let mut order: Vec<&str> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for r in lexical.iter().chain(semantic.iter()) {
        if seen.insert(r.chunk_id.as_str()) {
            order.push(r.chunk_id.as_str());
        }
    }

    let k = rrf_k as f64;
    let mut fused: Vec<(f64, &str)> = order
        .into_iter()
        .map(|id| {
            let mut score = 0.0;
            if let Some(&r) = lexical_rank.get(id) {
                score += 1.0 / (k + r as f64);
            }
            if let Some(&r) = semantic_rank.get(id) {
                score += 1.0 / (k + r as f64);
            }
            (score, id)
        })
        .collect();
    fused.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    fused.truncate(top_k);

    Ok(fused
        .into_iter()
        .map(|(score, id)| {
            // Prefer the semantic row for base fields, falling back to lexical.
            let base = semantic_by_id.get(id).or_else(|| lexical_by_id.get(id)).unwrap();
            SearchResult {
                chunk_id: base.chunk_id.clone(),
                path: base.path.clone(),
                heading_path: base.heading_path.clone(),
                chunk_index: base.chunk_index,
                content: base.content.clone(),
                score_breakdown: ScoreBreakdown {
                    rrf: Some(score),
                    lexical_rank: lexical_rank.get(id).copied(),
                    semantic_rank: semantic_rank.get(id).copied(),
                    ..Default::default()
                },
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::Embedder;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.db")).unwrap();
        store.init_schema().unwrap();
        (dir, store)
    }

    #[test]
    fn lexical_search_returns_matching_chunk() {
        let (_dir, store) = open_store();
        let file_id = store.upsert_file("one.md", 1, 1, "h").unwrap();
        store
            .insert_chunk("c1", file_id, 0, "Top", "redis cache policy and ttl", 5)
            .unwrap();

        let results = lexical_search(&store, "cache ttl", 3).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "one.md");
        assert!(results[0].score_breakdown.bm25.is_some());
    }

    #[test]
    fn semantic_search_ranks_nearest_neighbor_first() {
        let (_dir, store) = open_store();
        let embedder = Embedder::Hash { dim: 64 };
        let file_id = store.upsert_file("two.md", 1, 1, "h").unwrap();

        store
            .insert_chunk("c1", file_id, 0, "Top", "redis cache ttl policy and eviction", 6)
            .unwrap();
        store
            .insert_embedding(
                "c1",
                &embedder.model_label(),
                &embedder.embed("redis cache ttl policy and eviction").unwrap(),
            )
            .unwrap();

        store
            .insert_chunk("c2", file_id, 1, "Top", "mcp protocol server tool description", 5)
            .unwrap();
        store
            .insert_embedding(
                "c2",
                &embedder.model_label(),
                &embedder.embed("mcp protocol server tool description").unwrap(),
            )
            .unwrap();

        let results = semantic_search(&store, &embedder, "protocol tools", 1).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "c2");
        assert!(results[0].score_breakdown.cosine.is_some());
    }

    #[test]
    fn rrf_fusion_matches_worked_example() {
        // lexical = [a,b,c], semantic = [b,d,a], k=60
        let lexical: Vec<&str> = vec!["a", "b", "c"];
        let semantic: Vec<&str> = vec!["b", "d", "a"];
        let lexical_rank: HashMap<&str, usize> =
            lexical.iter().enumerate().map(|(i, &id)| (id, i + 1)).collect();
        let semantic_rank: HashMap<&str, usize> =
            semantic.iter().enumerate().map(|(i, &id)| (id, i + 1)).collect();
        let k = 60.0;

        let mut ids: Vec<&str> = vec!["a", "b", "c", "d"];
        ids.sort();
        let mut scored: Vec<(f64, &str)> = ids
            .into_iter()
            .map(|id| {
                let mut s = 0.0;
                if let Some(&r) = lexical_rank.get(id) {
                    s += 1.0 / (k + r as f64);
                }
                if let Some(&r) = semantic_rank.get(id) {
                    s += 1.0 / (k + r as f64);
                }
                (s, id)
            })
            .collect();
        scored.sort_by(|x, y| y.0.partial_cmp(&x.0).unwrap());

        assert_eq!(scored[0].1, "b");
        let b_score = 1.0 / (60.0 + 2.0) + 1.0 / (60.0 + 1.0);
        assert!((scored[0].0 - b_score).abs() < 1e-12);
        assert!(scored.iter().any(|(_, id)| *id == "a"));
    }

    #[test]
    fn hybrid_search_end_to_end_finds_seeded_file() {
        let (_dir, store) = open_store();
        let embedder = Embedder::Hash { dim: 64 };
        let file_id = store.upsert_file("docs/one.md", 1, 1, "h").unwrap();
        let text = "redis cache policy and ttl";
        store.insert_chunk("c1", file_id, 0, "Top", text, 5).unwrap();
        store
            .insert_embedding("c1", &embedder.model_label(), &embedder.embed(text).unwrap())
            .unwrap();

        let results = hybrid_search(&store, &embedder, "cache ttl", 3, 60).unwrap();
        assert!(results.iter().any(|r| r.path == "docs/one.md"));
    }
}
