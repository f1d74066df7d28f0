//! Catalog store owned by the driver executor.
//!
//! One `files` row per watched path plus chunked embedding vectors keyed by
//! (file, chunk, model). Deletes are soft: the row keeps its last known
//! metadata and an optional pointer into the version archive so the repair
//! worker can bring content back. The connection is opened by exactly one
//! process (the driver proxy); nothing else may touch the database file.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;

type Result<T> = std::result::Result<T, StorageError>;

/// Upsert payload for one observed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpsert {
    pub project: String,
    pub path: String,
    pub size_bytes: u64,
    pub mtime_ms: i64,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_path: Option<String>,
}

/// One catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub project: String,
    pub path: String,
    pub size_bytes: u64,
    pub mtime_ms: i64,
    pub content_hash: String,
    pub deleted: bool,
    pub deleted_at_ms: Option<i64>,
    pub version_path: Option<String>,
    pub embedded: bool,
    pub updated_at_ms: i64,
}

/// A file still waiting for embeddings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFile {
    pub file_id: i64,
    pub project: String,
    pub path: String,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_path: Option<String>,
}

/// One stored embedding chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingChunk {
    pub chunk_index: u32,
    pub vector: Vec<f32>,
}

/// Catalog-wide row counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogCounts {
    pub total_files: u64,
    pub active_files: u64,
    pub deleted_files: u64,
    pub pending_embeddings: u64,
    pub embedded_files: u64,
    pub embedding_rows: u64,
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS files (
    id              INTEGER PRIMARY KEY,
    project         TEXT NOT NULL,
    path            TEXT NOT NULL UNIQUE,
    size_bytes      INTEGER NOT NULL,
    mtime_ms        INTEGER NOT NULL,
    content_hash    TEXT NOT NULL,
    deleted         INTEGER NOT NULL DEFAULT 0,
    deleted_at_ms   INTEGER,
    version_path    TEXT,
    embedded        INTEGER NOT NULL DEFAULT 0,
    updated_at_ms   INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_pending ON files(embedded, deleted);
CREATE INDEX IF NOT EXISTS idx_files_project ON files(project, deleted);

CREATE TABLE IF NOT EXISTS embeddings (
    file_id         INTEGER NOT NULL,
    chunk_index     INTEGER NOT NULL,
    model           TEXT NOT NULL,
    dim             INTEGER NOT NULL,
    vector          BLOB NOT NULL,
    created_at_ms   INTEGER NOT NULL,
    PRIMARY KEY(file_id, chunk_index, model),
    FOREIGN KEY(file_id) REFERENCES files(id) ON DELETE CASCADE
);
";

/// SQLite-backed file catalog.
pub struct CatalogStore {
    conn: Connection,
}

impl std::fmt::Debug for CatalogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogStore").finish_non_exhaustive()
    }
}

impl CatalogStore {
    /// Open or create the catalog at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| StorageError::Database(err.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        debug!(path = %path.display(), "catalog opened");
        Ok(Self { conn })
    }

    /// Open an in-memory catalog (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Insert or refresh one file row, returning its id.
    ///
    /// A changed content hash clears the embedded flag so the file is
    /// re-queued for vectorization; an unchanged hash leaves existing
    /// embeddings valid. Upserting a soft-deleted path revives it.
    pub fn upsert_file(&self, upsert: &FileUpsert) -> Result<i64> {
        let size_bytes = u64_to_i64(upsert.size_bytes, "size_bytes")?;
        self.conn.execute(
            "INSERT INTO files (
                project, path, size_bytes, mtime_ms, content_hash,
                deleted, deleted_at_ms, version_path, embedded, updated_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?6, 0, ?7)
             ON CONFLICT(path) DO UPDATE SET
                project = excluded.project,
                size_bytes = excluded.size_bytes,
                mtime_ms = excluded.mtime_ms,
                version_path = excluded.version_path,
                deleted = 0,
                deleted_at_ms = NULL,
                embedded = CASE
                    WHEN files.content_hash = excluded.content_hash THEN files.embedded
                    ELSE 0
                END,
                content_hash = excluded.content_hash,
                updated_at_ms = excluded.updated_at_ms",
            params![
                upsert.project,
                upsert.path,
                size_bytes,
                upsert.mtime_ms,
                upsert.content_hash,
                upsert.version_path,
                now_ms(),
            ],
        )?;
        self.conn
            .query_row(
                "SELECT id FROM files WHERE path = ?1",
                params![upsert.path],
                |row| row.get(0),
            )
            .map_err(StorageError::from)
    }

    /// Soft-delete a path. Returns whether a live row was changed.
    pub fn mark_deleted(&self, path: &str, version_path: Option<&str>) -> Result<bool> {
        let now = now_ms();
        let changed = self.conn.execute(
            "UPDATE files
             SET deleted = 1,
                 deleted_at_ms = ?2,
                 version_path = COALESCE(?3, version_path),
                 updated_at_ms = ?2
             WHERE path = ?1 AND deleted = 0",
            params![path, now, version_path],
        )?;
        Ok(changed > 0)
    }

    /// Undo a soft delete. Returns whether a deleted row was changed.
    pub fn restore_file(&self, path: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE files
             SET deleted = 0,
                 deleted_at_ms = NULL,
                 updated_at_ms = ?2
             WHERE path = ?1 AND deleted = 1",
            params![path, now_ms()],
        )?;
        Ok(changed > 0)
    }

    /// Fetch one row by path.
    pub fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        self.conn
            .query_row(
                &format!("{FILE_SELECT} WHERE path = ?1"),
                params![path],
                decode_file_row,
            )
            .optional()
            .map_err(StorageError::from)
    }

    /// Live files still waiting for embeddings, oldest change first.
    pub fn pending_embeddings(&self, limit: usize) -> Result<Vec<PendingFile>> {
        let limit = usize_to_i64(limit, "limit")?;
        let mut stmt = self.conn.prepare(
            "SELECT id, project, path, content_hash, version_path
             FROM files
             WHERE embedded = 0 AND deleted = 0
             ORDER BY updated_at_ms ASC, id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(PendingFile {
                file_id: row.get(0)?,
                project: row.get(1)?,
                path: row.get(2)?,
                content_hash: row.get(3)?,
                version_path: row.get(4)?,
            })
        })?;

        let mut pending = Vec::new();
        for row in rows {
            pending.push(row?);
        }
        Ok(pending)
    }

    /// Replace a file's chunk vectors for one model and mark it embedded.
    ///
    /// Runs in a single transaction; a dimension mismatch or unknown file id
    /// leaves the catalog untouched. Zero chunks is legal (an empty file has
    /// nothing to embed) and still marks the file done.
    pub fn store_embedding(
        &mut self,
        file_id: i64,
        model: &str,
        dim: usize,
        vectors: &[Vec<f32>],
    ) -> Result<usize> {
        for (index, vector) in vectors.iter().enumerate() {
            if vector.len() != dim {
                return Err(StorageError::Database(format!(
                    "chunk {index} has dimension {}, expected {dim}",
                    vector.len()
                )));
            }
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(StorageError::Database(format!(
                    "chunk {index} contains non-finite values"
                )));
            }
        }

        let dim_i64 = usize_to_i64(dim, "dim")?;
        let now = now_ms();
        let tx = self.conn.transaction()?;

        tx.execute(
            "DELETE FROM embeddings WHERE file_id = ?1 AND model = ?2",
            params![file_id, model],
        )?;
        for (index, vector) in vectors.iter().enumerate() {
            let chunk_index = usize_to_i64(index, "chunk_index")?;
            tx.execute(
                "INSERT INTO embeddings (file_id, chunk_index, model, dim, vector, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    file_id,
                    chunk_index,
                    model,
                    dim_i64,
                    encode_f32_blob(vector),
                    now
                ],
            )?;
        }
        let marked = tx.execute(
            "UPDATE files SET embedded = 1, updated_at_ms = ?2 WHERE id = ?1",
            params![file_id, now],
        )?;
        if marked == 0 {
            return Err(StorageError::NotFound(format!("file id {file_id}")));
        }

        tx.commit()?;
        Ok(vectors.len())
    }

    /// Stored chunk vectors for one file and model, in chunk order.
    pub fn embedding_chunks(&self, file_id: i64, model: &str) -> Result<Vec<EmbeddingChunk>> {
        let mut stmt = self.conn.prepare(
            "SELECT chunk_index, dim, vector
             FROM embeddings
             WHERE file_id = ?1 AND model = ?2
             ORDER BY chunk_index ASC",
        )?;
        let rows = stmt.query_map(params![file_id, model], |row| {
            let chunk_index: i64 = row.get(0)?;
            let dim: i64 = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            Ok((chunk_index, dim, blob))
        })?;

        let mut chunks = Vec::new();
        for row in rows {
            let (chunk_index, dim, blob) = row?;
            let dim = i64_to_usize(dim, "dim")?;
            chunks.push(EmbeddingChunk {
                chunk_index: u32::try_from(chunk_index)
                    .map_err(|_| StorageError::Database("negative chunk index".to_string()))?,
                vector: decode_f32_blob(&blob, dim)?,
            });
        }
        Ok(chunks)
    }

    /// Page through catalog rows, ordered by path.
    pub fn list_files(
        &self,
        project: Option<&str>,
        offset: usize,
        limit: usize,
        include_deleted: bool,
    ) -> Result<Vec<FileRecord>> {
        let offset = usize_to_i64(offset, "offset")?;
        let limit = usize_to_i64(limit, "limit")?;
        let sql = format!(
            "{FILE_SELECT}
             WHERE (?1 IS NULL OR project = ?1)
               AND (?2 OR deleted = 0)
             ORDER BY path ASC
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project, include_deleted, limit, offset], decode_file_row)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// Row counters across both tables.
    pub fn counts(&self) -> Result<CatalogCounts> {
        let (total, active, deleted, pending, embedded, rows): (i64, i64, i64, i64, i64, i64) =
            self.conn.query_row(
                "SELECT
                    (SELECT COUNT(*) FROM files),
                    (SELECT COUNT(*) FROM files WHERE deleted = 0),
                    (SELECT COUNT(*) FROM files WHERE deleted = 1),
                    (SELECT COUNT(*) FROM files WHERE embedded = 0 AND deleted = 0),
                    (SELECT COUNT(*) FROM files WHERE embedded = 1 AND deleted = 0),
                    (SELECT COUNT(*) FROM embeddings)",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )?;
        Ok(CatalogCounts {
            total_files: i64_to_u64(total, "total_files")?,
            active_files: i64_to_u64(active, "active_files")?,
            deleted_files: i64_to_u64(deleted, "deleted_files")?,
            pending_embeddings: i64_to_u64(pending, "pending_embeddings")?,
            embedded_files: i64_to_u64(embedded, "embedded_files")?,
            embedding_rows: i64_to_u64(rows, "embedding_rows")?,
        })
    }
}

const FILE_SELECT: &str = "SELECT id, project, path, size_bytes, mtime_ms, content_hash,
        deleted, deleted_at_ms, version_path, embedded, updated_at_ms
 FROM files";

fn decode_file_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let size_bytes: i64 = row.get(3)?;
    Ok(FileRecord {
        id: row.get(0)?,
        project: row.get(1)?,
        path: row.get(2)?,
        size_bytes: u64::try_from(size_bytes)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(3, size_bytes))?,
        mtime_ms: row.get(4)?,
        content_hash: row.get(5)?,
        deleted: row.get::<_, i64>(6)? != 0,
        deleted_at_ms: row.get(7)?,
        version_path: row.get(8)?,
        embedded: row.get::<_, i64>(9)? != 0,
        updated_at_ms: row.get(10)?,
    })
}

fn encode_f32_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_f32_blob(blob: &[u8], dimension: usize) -> Result<Vec<f32>> {
    let expected_len = dimension
        .checked_mul(std::mem::size_of::<f32>())
        .ok_or_else(|| StorageError::Database("embedding blob length overflow".to_string()))?;
    if blob.len() != expected_len {
        return Err(StorageError::Database(format!(
            "invalid embedding byte length: expected {expected_len}, got {}",
            blob.len()
        )));
    }

    let mut out = Vec::with_capacity(dimension);
    for chunk in blob.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(out)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn u64_to_i64(value: u64, field: &'static str) -> Result<i64> {
    i64::try_from(value).map_err(|_| StorageError::Database(format!("{field} overflows i64")))
}

fn usize_to_i64(value: usize, field: &'static str) -> Result<i64> {
    i64::try_from(value).map_err(|_| StorageError::Database(format!("{field} overflows i64")))
}

fn i64_to_u64(value: i64, field: &'static str) -> Result<u64> {
    u64::try_from(value).map_err(|_| StorageError::Database(format!("{field} is negative")))
}

fn i64_to_usize(value: i64, field: &'static str) -> Result<usize> {
    usize::try_from(value).map_err(|_| StorageError::Database(format!("{field} is negative")))
}
