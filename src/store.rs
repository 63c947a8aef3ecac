//! Single-file relational store: schema, CRUD, and FTS query compilation
//! with a sanitization fallback. Connections are wrapped in
//! `Arc<Mutex<Connection>>`; every public operation is a short-lived
//! `spawn_blocking` closure, matching the single-writer/many-reader
//! discipline described in SPEC_FULL.md §5.

use parking_lot::Mutex;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;

use crate::error::{storage_error, EngineError, EngineResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id          INTEGER PRIMARY KEY,
    path        TEXT NOT NULL UNIQUE,
    mtime_ns    INTEGER NOT NULL,
    size_bytes  INTEGER NOT NULL,
    sha256      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    id            INTEGER PRIMARY KEY,
    chunk_id      TEXT NOT NULL UNIQUE,
    file_id       INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    chunk_index   INTEGER NOT NULL,
    heading_path  TEXT NOT NULL,
    content       TEXT NOT NULL,
    token_count   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_file_id ON chunks(file_id);

CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id    INTEGER PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
    model       TEXT NOT NULL,
    dim         INTEGER NOT NULL,
    vec         BLOB NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS index_metadata (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    content,
    content='chunks',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
    INSERT INTO chunks_fts(rowid, content) VALUES (new.id, new.content);
END;
CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, content) VALUES ('delete', old.id, old.content);
END;
CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, content) VALUES ('delete', old.id, old.content);
    INSERT INTO chunks_fts(rowid, content) VALUES (new.id, new.content);
END;
"#;

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").unwrap());

#[derive(Debug, Clone)]
pub struct FileMeta {
    pub mtime_ns: i64,
    pub size_bytes: i64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct LexicalRow {
    pub chunk_id: String,
    pub path: String,
    pub heading_path: String,
    pub chunk_index: i64,
    pub content: String,
    pub bm25_score: f64,
}

#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub chunk_id: String,
    pub path: String,
    pub heading_path: String,
    pub chunk_index: i64,
    pub content: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk_id: String,
    pub heading_path: String,
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct IndexStatus {
    pub files: i64,
    pub chunks: i64,
    pub embeddings: i64,
}

fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

fn blob_to_vec(blob: &[u8], dim: usize) -> Vec<f32> {
    blob.chunks_exact(4)
        .take(dim)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Store {
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| storage_error(path, e))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=30000;",
        )
        .map_err(|e| storage_error(path, e))?;
        tracing::debug!(db_path = %path.display(), "opened store connection");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn init_schema(&self) -> EngineResult<()> {
        self.conn
            .lock()
            .execute_batch(SCHEMA)
            .map_err(|e| storage_error(&self.path, e))
    }

    fn err(&self, e: rusqlite::Error) -> EngineError {
        storage_error(&self.path, e)
    }

    pub fn upsert_file(
        &self,
        path: &str,
        mtime_ns: i64,
        size_bytes: i64,
        sha256: &str,
    ) -> EngineResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO files(path, mtime_ns, size_bytes, sha256) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET mtime_ns=excluded.mtime_ns, size_bytes=excluded.size_bytes, sha256=excluded.sha256",
            params![path, mtime_ns, size_bytes, sha256],
        )
        .map_err(|e| self.err(e))?;
        conn.query_row("SELECT id FROM files WHERE path = ?1", params![path], |r| r.get(0))
            .map_err(|e| self.err(e))
    }

    /// Replace a file's chunks and embeddings atomically: upsert the file
    /// row, delete its existing chunks (cascading embeddings), then insert
    /// every `(chunk, vector)` pair, all within one transaction. Readers
    /// either see the pre- or post-reindex state for this file, never a
    /// partial chunk list (SPEC_FULL.md §5).
    pub fn reindex_file_in_transaction(
        &self,
        path: &str,
        mtime_ns: i64,
        size_bytes: i64,
        sha256: &str,
        chunks: &[crate::chunker::Chunk],
        embedding_model: &str,
        vectors: &[Vec<f32>],
    ) -> EngineResult<i64> {
        debug_assert_eq!(chunks.len(), vectors.len());
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| self.err(e))?;

        tx.execute(
            "INSERT INTO files(path, mtime_ns, size_bytes, sha256) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET mtime_ns=excluded.mtime_ns, size_bytes=excluded.size_bytes, sha256=excluded.sha256",
            params![path, mtime_ns, size_bytes, sha256],
        )
        .map_err(|e| storage_error(&self.path, e))?;
        let file_id: i64 = tx
            .query_row("SELECT id FROM files WHERE path = ?1", params![path], |r| r.get(0))
            .map_err(|e| storage_error(&self.path, e))?;

        tx.execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])
            .map_err(|e| storage_error(&self.path, e))?;

        let now = chrono::Utc::now().to_rfc3339();
        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            tx.execute(
                "INSERT INTO chunks(chunk_id, file_id, chunk_index, heading_path, content, token_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    chunk.chunk_id,
                    file_id,
                    chunk.chunk_index as i64,
                    chunk.heading_path,
                    chunk.content,
                    chunk.token_count as i64
                ],
            )
            .map_err(|e| storage_error(&self.path, e))?;
            let chunk_row_id: i64 = tx
                .query_row(
                    "SELECT id FROM chunks WHERE chunk_id = ?1",
                    params![chunk.chunk_id],
                    |r| r.get(0),
                )
                .map_err(|e| storage_error(&self.path, e))?;
            let blob = vec_to_blob(vector);
            tx.execute(
                "INSERT INTO embeddings(chunk_id, model, dim, vec, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(chunk_id) DO UPDATE SET model=excluded.model, dim=excluded.dim, vec=excluded.vec, updated_at=excluded.updated_at",
                params![chunk_row_id, embedding_model, vector.len() as i64, blob, now],
            )
            .map_err(|e| storage_error(&self.path, e))?;
        }

        tx.commit().map_err(|e| storage_error(&self.path, e))?;
        Ok(file_id)
    }

    pub fn get_all_file_meta(&self) -> EngineResult<std::collections::HashMap<String, FileMeta>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT path, mtime_ns, size_bytes, sha256 FROM files")
            .map_err(|e| self.err(e))?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    FileMeta {
                        mtime_ns: r.get(1)?,
                        size_bytes: r.get(2)?,
                        sha256: r.get(3)?,
                    },
                ))
            })
            .map_err(|e| self.err(e))?;
        let mut out = std::collections::HashMap::new();
        for row in rows {
            let (path, meta) = row.map_err(|e| self.err(e))?;
            out.insert(path, meta);
        }
        Ok(out)
    }

    pub fn delete_chunks_for_file(&self, file_id: i64) -> EngineResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    pub fn insert_chunk(
        &self,
        chunk_id: &str,
        file_id: i64,
        chunk_index: i64,
        heading_path: &str,
        content: &str,
        token_count: i64,
    ) -> EngineResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO chunks(chunk_id, file_id, chunk_index, heading_path, content, token_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![chunk_id, file_id, chunk_index, heading_path, content, token_count],
            )
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    pub fn insert_embedding(&self, chunk_id: &str, model: &str, vector: &[f32]) -> EngineResult<()> {
        let conn = self.conn.lock();
        let row_id: i64 = conn
            .query_row(
                "SELECT id FROM chunks WHERE chunk_id = ?1",
                params![chunk_id],
                |r| r.get(0),
            )
            .map_err(|e| self.err(e))?;
        let blob = vec_to_blob(vector);
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO embeddings(chunk_id, model, dim, vec, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(chunk_id) DO UPDATE SET model=excluded.model, dim=excluded.dim, vec=excluded.vec, updated_at=excluded.updated_at",
            params![row_id, model, vector.len() as i64, blob, now],
        )
        .map_err(|e| self.err(e))?;
        Ok(())
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> EngineResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .lock()
            .execute(
                "INSERT INTO index_metadata(key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
                params![key, value, now],
            )
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> EngineResult<Option<String>> {
        self.conn
            .lock()
            .query_row(
                "SELECT value FROM index_metadata WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| self.err(e))
    }

    pub fn delete_metadata(&self, key: &str) -> EngineResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM index_metadata WHERE key = ?1", params![key])
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    /// Delete every file row whose path is not in `keep_paths`. An empty
    /// `keep_paths` deletes all files. Returns the number of files deleted.
    pub fn delete_files_except(&self, keep_paths: &[String]) -> EngineResult<i64> {
        let conn = self.conn.lock();
        if keep_paths.is_empty() {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))
                .map_err(|e| self.err(e))?;
            conn.execute("DELETE FROM files", [])
                .map_err(|e| self.err(e))?;
            return Ok(count);
        }
        let placeholders = keep_paths.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM files WHERE path NOT IN ({})", placeholders);
        let params: Vec<&dyn rusqlite::ToSql> =
            keep_paths.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
        let deleted = conn.execute(&sql, params.as_slice()).map_err(|e| self.err(e))?;
        if deleted > 0 {
            tracing::info!(deleted, db_path = %self.path.display(), "pruned files missing from reindex scan");
        }
        Ok(deleted as i64)
    }

    pub fn index_status(&self) -> EngineResult<IndexStatus> {
        let conn = self.conn.lock();
        let files = conn
            .query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))
            .map_err(|e| self.err(e))?;
        let chunks = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))
            .map_err(|e| self.err(e))?;
        let embeddings = conn
            .query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))
            .map_err(|e| self.err(e))?;
        Ok(IndexStatus { files, chunks, embeddings })
    }

    pub fn get_chunk(&self, chunk_id: &str) -> EngineResult<Option<ChunkRow>> {
        self.conn
            .lock()
            .query_row(
                "SELECT chunk_id, heading_path, chunk_index, content, token_count FROM chunks WHERE chunk_id = ?1",
                params![chunk_id],
                |r| {
                    Ok(ChunkRow {
                        chunk_id: r.get(0)?,
                        heading_path: r.get(1)?,
                        chunk_index: r.get(2)?,
                        content: r.get(3)?,
                        token_count: r.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(|e| self.err(e))
    }

    pub fn get_file(&self, path: &str) -> EngineResult<Option<Vec<ChunkRow>>> {
        let conn = self.conn.lock();
        let file_id: Option<i64> = conn
            .query_row("SELECT id FROM files WHERE path = ?1", params![path], |r| r.get(0))
            .optional()
            .map_err(|e| self.err(e))?;
        let Some(file_id) = file_id else { return Ok(None) };
        let mut stmt = conn
            .prepare(
                "SELECT chunk_id, heading_path, chunk_index, content, token_count FROM chunks
                 WHERE file_id = ?1 ORDER BY chunk_index",
            )
            .map_err(|e| self.err(e))?;
        let rows = stmt
            .query_map(params![file_id], |r| {
                Ok(ChunkRow {
                    chunk_id: r.get(0)?,
                    heading_path: r.get(1)?,
                    chunk_index: r.get(2)?,
                    content: r.get(3)?,
                    token_count: r.get(4)?,
                })
            })
            .map_err(|e| self.err(e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| self.err(e))?);
        }
        Ok(Some(out))
    }

    pub fn all_embeddings(&self) -> EngineResult<Vec<EmbeddingRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT c.chunk_id, f.path, c.heading_path, c.chunk_index, c.content, e.vec, e.dim
                 FROM embeddings e
                 JOIN chunks c ON c.id = e.chunk_id
                 JOIN files f ON f.id = c.file_id",
            )
            .map_err(|e| self.err(e))?;
        let rows = stmt
            .query_map([], |r| {
                let blob: Vec<u8> = r.get(5)?;
                let dim: i64 = r.get(6)?;
                Ok(EmbeddingRow {
                    chunk_id: r.get(0)?,
                    path: r.get(1)?,
                    heading_path: r.get(2)?,
                    chunk_index: r.get(3)?,
                    content: r.get(4)?,
                    vector: blob_to_vec(&blob, dim as usize),
                })
            })
            .map_err(|e| self.err(e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| self.err(e))?);
        }
        Ok(out)
    }

    /// Compile and run a full-text search, falling back to a sanitized bare
    /// query form if the primary quoted-OR form hits an FTS syntax error.
    /// Returns an empty list (never an error) when the query has no terms
    /// or both compiled forms fail.
    pub fn lexical_search(&self, query: &str, top_k: usize) -> EngineResult<Vec<LexicalRow>> {
        let terms: Vec<&str> = WORD_RE.find_iter(query).map(|m| m.as_str()).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let primary = terms.iter().map(|t| format!("\"{}\"", t)).collect::<Vec<_>>().join(" OR ");
        match self.run_lexical_query(&primary, top_k) {
            Ok(rows) => Ok(rows),
            Err(e) if is_fts_query_error(&e) => {
                let fallback = terms.join(" ");
                match self.run_lexical_query(&fallback, top_k) {
                    Ok(rows) => Ok(rows),
                    Err(_) => Ok(Vec::new()),
                }
            }
            Err(_) => Ok(Vec::new()),
        }
    }

    fn run_lexical_query(&self, fts_query: &str, top_k: usize) -> Result<Vec<LexicalRow>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT c.chunk_id, f.path, c.heading_path, c.chunk_index, c.content, bm25(chunks_fts) AS bm25_score
             FROM chunks_fts
             JOIN chunks c ON c.id = chunks_fts.rowid
             JOIN files f ON f.id = c.file_id
             WHERE chunks_fts MATCH ?1
             ORDER BY bm25(chunks_fts)
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![fts_query, top_k as i64], |r| {
            Ok(LexicalRow {
                chunk_id: r.get(0)?,
                path: r.get(1)?,
                heading_path: r.get(2)?,
                chunk_index: r.get(3)?,
                content: r.get(4)?,
                bm25_score: r.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn is_fts_query_error(err: &rusqlite::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    ["fts5:", "no such column", "unterminated string", "malformed match", "syntax error"]
        .iter()
        .any(|pat| msg.contains(pat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(&path).unwrap();
        store.init_schema().unwrap();
        (dir, store)
    }

    #[test]
    fn upsert_and_fetch_file_meta() {
        let (_dir, store) = open_store();
        let id = store.upsert_file("a.md", 100, 10, "hash1").unwrap();
        assert!(id > 0);
        let meta = store.get_all_file_meta().unwrap();
        assert_eq!(meta["a.md"].sha256, "hash1");
    }

    #[test]
    fn chunk_and_embedding_roundtrip() {
        let (_dir, store) = open_store();
        let file_id = store.upsert_file("a.md", 1, 1, "h").unwrap();
        store.insert_chunk("c1", file_id, 0, "Top", "hello world", 2).unwrap();
        store.insert_embedding("c1", "hash-4", &[1.0, 0.0, 0.0, 0.0]).unwrap();

        let chunk = store.get_chunk("c1").unwrap().unwrap();
        assert_eq!(chunk.content, "hello world");

        let embeddings = store.all_embeddings().unwrap();
        assert_eq!(embeddings.len(), 1);
        assert_eq!(embeddings[0].vector, vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn lexical_search_finds_matching_chunk() {
        let (_dir, store) = open_store();
        let file_id = store.upsert_file("a.md", 1, 1, "h").unwrap();
        store.insert_chunk("c1", file_id, 0, "Top", "redis cache ttl policy", 4).unwrap();

        let rows = store.lexical_search("cache ttl", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].chunk_id, "c1");
    }

    #[test]
    fn lexical_search_malformed_query_falls_back_without_error() {
        let (_dir, store) = open_store();
        let file_id = store.upsert_file("a.md", 1, 1, "h").unwrap();
        store.insert_chunk("c1", file_id, 0, "Top", "server setup tools", 3).unwrap();

        let rows = store.lexical_search("\"server setup, tools", 10).unwrap();
        // must not error regardless of whether it matches
        let _ = rows;
    }

    #[test]
    fn lexical_search_empty_query_returns_empty() {
        let (_dir, store) = open_store();
        let rows = store.lexical_search(".,:()", 10).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn delete_files_except_prunes_missing() {
        let (_dir, store) = open_store();
        store.upsert_file("a.md", 1, 1, "h").unwrap();
        store.upsert_file("b.md", 1, 1, "h").unwrap();
        let deleted = store.delete_files_except(&["a.md".to_string()]).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.index_status().unwrap().files, 1);
    }

    #[test]
    fn deleting_file_cascades_to_chunks_and_embeddings() {
        let (_dir, store) = open_store();
        let file_id = store.upsert_file("a.md", 1, 1, "h").unwrap();
        store.insert_chunk("c1", file_id, 0, "Top", "content", 1).unwrap();
        store.insert_embedding("c1", "hash-4", &[1.0, 0.0, 0.0, 0.0]).unwrap();

        store.delete_files_except(&[]).unwrap();
        assert_eq!(store.index_status().unwrap().chunks, 0);
        assert_eq!(store.index_status().unwrap().embeddings, 0);
    }
}
