//! Durable metadata catalog over embedded SQLite.
//!
//! Two tables: `files` maps a unique logical path to a digest and size;
//! `blobs` tracks one row per unique content with its on-disk location,
//! original/compressed sizes, and reference count. Every mutating operation
//! commits before returning; multi-step refcount updates run inside a single
//! transaction. The connection is guarded by a mutex, giving one writer at a
//! time.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Errors emitted by the catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Underlying store failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A refcount or row invariant would be violated.
    #[error("invariant: {0}")]
    Invariant(String),
}

/// One logical file: a unique path referencing a blob by digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Surrogate row id.
    pub id: i64,
    /// Unique logical path.
    pub path: String,
    /// Digest of the file's contents, hex form.
    pub digest: String,
    /// Uncompressed size in bytes; equals the blob's `size_original`.
    pub size: u64,
}

/// One unique content blob with its reference count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    /// Content digest, hex form (primary key).
    pub digest: String,
    /// Location of the compressed blob file.
    pub blob_path: String,
    /// Uncompressed size in bytes.
    pub size_original: u64,
    /// Compressed size in bytes.
    pub size_compressed: u64,
    /// Number of file rows referencing this digest.
    pub ref_count: u64,
}

/// Location and sizes of a blob being inserted for the first time.
#[derive(Debug, Clone)]
pub struct NewBlob {
    /// Location of the compressed blob file.
    pub blob_path: String,
    /// Uncompressed size in bytes.
    pub size_original: u64,
    /// Compressed size in bytes.
    pub size_compressed: u64,
}

/// Aggregate view over the catalog, read by Stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogSummary {
    /// Total file rows.
    pub file_count: u64,
    /// Total blob rows.
    pub blob_count: u64,
    /// Sum of `size_original * ref_count` over all blobs.
    pub logical_bytes: u64,
    /// Sum of `size_compressed` over all blobs.
    pub stored_bytes: u64,
    /// Blobs referenced by more than one file.
    pub shared_blob_count: u64,
}

/// Catalog handle over one SQLite database file.
#[derive(Debug)]
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Open (creating tables if needed) the catalog at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, CatalogError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 path TEXT UNIQUE NOT NULL,
                 digest TEXT NOT NULL,
                 size INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS blobs (
                 digest TEXT PRIMARY KEY,
                 blob_path TEXT NOT NULL,
                 size_original INTEGER NOT NULL,
                 size_compressed INTEGER NOT NULL,
                 ref_count INTEGER NOT NULL DEFAULT 1
             );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory catalog for tests.
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 path TEXT UNIQUE NOT NULL,
                 digest TEXT NOT NULL,
                 size INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS blobs (
                 digest TEXT PRIMARY KEY,
                 blob_path TEXT NOT NULL,
                 size_original INTEGER NOT NULL,
                 size_compressed INTEGER NOT NULL,
                 ref_count INTEGER NOT NULL DEFAULT 1
             );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Insert or replace the file row for `path`.
    pub fn upsert_file(&self, path: &str, digest: &str, size: u64) -> Result<(), CatalogError> {
        self.lock().execute(
            "INSERT OR REPLACE INTO files (path, digest, size) VALUES (?1, ?2, ?3)",
            params![path, digest, size as i64],
        )?;
        Ok(())
    }

    /// Delete the file row for `path`; returns false if no row existed.
    pub fn delete_file(&self, path: &str) -> Result<bool, CatalogError> {
        let n = self
            .lock()
            .execute("DELETE FROM files WHERE path = ?1", params![path])?;
        Ok(n > 0)
    }

    /// Look up the file row for `path`.
    pub fn file_by_path(&self, path: &str) -> Result<Option<FileRecord>, CatalogError> {
        let conn = self.lock();
        let rec = conn
            .query_row(
                "SELECT id, path, digest, size FROM files WHERE path = ?1",
                params![path],
                |row| {
                    Ok(FileRecord {
                        id: row.get(0)?,
                        path: row.get(1)?,
                        digest: row.get(2)?,
                        size: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(rec)
    }

    /// All file rows, ordered by path.
    pub fn list_files(&self) -> Result<Vec<FileRecord>, CatalogError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, path, digest, size FROM files ORDER BY path")?;
        let rows = stmt.query_map([], |row| {
            Ok(FileRecord {
                id: row.get(0)?,
                path: row.get(1)?,
                digest: row.get(2)?,
                size: row.get::<_, i64>(3)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Insert a blob row with `ref_count = 1`; no-op if the digest exists.
    /// Returns true if a row was inserted.
    pub fn insert_blob_if_absent(
        &self,
        digest: &str,
        blob: &NewBlob,
    ) -> Result<bool, CatalogError> {
        let n = self.lock().execute(
            "INSERT OR IGNORE INTO blobs
                 (digest, blob_path, size_original, size_compressed, ref_count)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![
                digest,
                blob.blob_path,
                blob.size_original as i64,
                blob.size_compressed as i64
            ],
        )?;
        Ok(n > 0)
    }

    /// Increment a blob's reference count; the digest must exist.
    pub fn incr_ref(&self, digest: &str) -> Result<u64, CatalogError> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE blobs SET ref_count = ref_count + 1 WHERE digest = ?1",
            params![digest],
        )?;
        if n == 0 {
            return Err(CatalogError::Invariant(format!(
                "incr_ref on unknown digest {digest}"
            )));
        }
        let count: i64 = conn.query_row(
            "SELECT ref_count FROM blobs WHERE digest = ?1",
            params![digest],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Decrement a blob's reference count; refuses to go below zero.
    pub fn decr_ref(&self, digest: &str) -> Result<u64, CatalogError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let count = decr_ref_tx(&tx, digest)?;
        tx.commit()?;
        Ok(count)
    }

    /// Look up the blob row for `digest`.
    pub fn blob(&self, digest: &str) -> Result<Option<BlobRecord>, CatalogError> {
        let conn = self.lock();
        let rec = conn
            .query_row(
                "SELECT digest, blob_path, size_original, size_compressed, ref_count
                 FROM blobs WHERE digest = ?1",
                params![digest],
                map_blob_row,
            )
            .optional()?;
        Ok(rec)
    }

    /// Blob rows whose reference count has reached zero, awaiting reclaim.
    pub fn zero_ref_blobs(&self) -> Result<Vec<BlobRecord>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT digest, blob_path, size_original, size_compressed, ref_count
             FROM blobs WHERE ref_count = 0 ORDER BY digest",
        )?;
        let rows = stmt.query_map([], map_blob_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Delete the blob row for `digest`.
    pub fn delete_blob(&self, digest: &str) -> Result<(), CatalogError> {
        self.lock()
            .execute("DELETE FROM blobs WHERE digest = ?1", params![digest])?;
        Ok(())
    }

    /// Record one ingest of `path` with `digest` in a single transaction:
    /// bump (or create) the blob row, offset any prior row for the path,
    /// and upsert the file row.
    ///
    /// `new_blob` carries the blob location and sizes for the case where the
    /// caller just wrote a novel blob; when the digest turns out to already
    /// have a row (a concurrent ingest won the race) it is ignored and the
    /// count is bumped instead.
    pub fn apply_ingest(
        &self,
        path: &str,
        digest: &str,
        size: u64,
        new_blob: Option<&NewBlob>,
    ) -> Result<(), CatalogError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = match new_blob {
            Some(blob) => {
                tx.execute(
                    "INSERT OR IGNORE INTO blobs
                         (digest, blob_path, size_original, size_compressed, ref_count)
                     VALUES (?1, ?2, ?3, ?4, 1)",
                    params![
                        digest,
                        blob.blob_path,
                        blob.size_original as i64,
                        blob.size_compressed as i64
                    ],
                )? > 0
            }
            None => false,
        };
        if !inserted {
            let n = tx.execute(
                "UPDATE blobs SET ref_count = ref_count + 1 WHERE digest = ?1",
                params![digest],
            )?;
            if n == 0 {
                return Err(CatalogError::Invariant(format!(
                    "ingest references unknown digest {digest}"
                )));
            }
        }

        // Re-ingest of an existing path releases its previous reference;
        // when the digest is unchanged this offsets the bump above.
        let prior: Option<String> = tx
            .query_row(
                "SELECT digest FROM files WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(old_digest) = prior {
            decr_ref_tx(&tx, &old_digest)?;
        }

        tx.execute(
            "INSERT OR REPLACE INTO files (path, digest, size) VALUES (?1, ?2, ?3)",
            params![path, digest, size as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Aggregates for Stats.
    pub fn summary(&self) -> Result<CatalogSummary, CatalogError> {
        let conn = self.lock();
        let file_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        let (blob_count, logical, stored, shared): (i64, i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(size_original * ref_count), 0),
                    COALESCE(SUM(size_compressed), 0),
                    COALESCE(SUM(ref_count > 1), 0)
             FROM blobs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        Ok(CatalogSummary {
            file_count: file_count as u64,
            blob_count: blob_count as u64,
            logical_bytes: logical as u64,
            stored_bytes: stored as u64,
            shared_blob_count: shared as u64,
        })
    }
}

fn map_blob_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlobRecord> {
    Ok(BlobRecord {
        digest: row.get(0)?,
        blob_path: row.get(1)?,
        size_original: row.get::<_, i64>(2)? as u64,
        size_compressed: row.get::<_, i64>(3)? as u64,
        ref_count: row.get::<_, i64>(4)? as u64,
    })
}

fn decr_ref_tx(tx: &rusqlite::Transaction<'_>, digest: &str) -> Result<u64, CatalogError> {
    let count: Option<i64> = tx
        .query_row(
            "SELECT ref_count FROM blobs WHERE digest = ?1",
            params![digest],
            |row| row.get(0),
        )
        .optional()?;
    match count {
        None => Err(CatalogError::Invariant(format!(
            "decr_ref on unknown digest {digest}"
        ))),
        Some(0) => Err(CatalogError::Invariant(format!(
            "decr_ref below zero for digest {digest}"
        ))),
        Some(c) => {
            tx.execute(
                "UPDATE blobs SET ref_count = ref_count - 1 WHERE digest = ?1",
                params![digest],
            )?;
            Ok((c - 1) as u64)
        }
    }
}
