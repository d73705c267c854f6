//! Storage engine orchestration.
//!
//! Owns the catalog, blob store, codec, and hybrid cache, and implements the
//! ingest and egress flows over them:
//!
//! - ingest: digest -> duplicate short-circuit -> compress -> blob put ->
//!   catalog refcount transaction -> cache insert
//! - egress: catalog lookup -> cache -> blob get -> decompress -> verify ->
//!   cache insert
//!
//! Blobs whose refcount reaches zero are retained until an explicit
//! [`StorageEngine::reclaim`] pass. Digests that fail decompression are
//! quarantined for the life of the process and never deleted automatically.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod stats;

pub use stats::{EngineStats, StatsHistory};

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use blob_store::{BlobError, BlobStore};
use cask_core::digest::{digest_bytes, digest_file, Digest};
use cask_core::EngineConfig;
use catalog::{Catalog, CatalogError, FileRecord, NewBlob};
use codec::{Codec, CodecError};
use hybrid_cache::{ram_budget_from_ratio, CacheConfig, HybridCache};
use thiserror::Error;
use tracing::{debug, error, info};

/// Errors surfaced by engine operations. Leaf errors propagate unchanged;
/// the engine adds context but never swallows.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Path, digest, or blob record absent.
    #[error("not found: {0}")]
    NotFound(String),
    /// Underlying filesystem failure; never retried.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// Compression or decompression failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Catalog failure, including refcount invariant violations.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// The digest is quarantined after a failed decompression.
    #[error("blob {digest} is quarantined after a failed decompression")]
    Corrupt {
        /// Hex digest of the quarantined blob.
        digest: String,
    },
    /// Cross-component inconsistency, non-recoverable for this operation.
    #[error("invariant: {0}")]
    Invariant(String),
}

/// Outcome of a reclaim pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReclaimReport {
    /// Blob rows with `ref_count = 0` that were scanned.
    pub scanned: u64,
    /// Blobs whose file and row were removed.
    pub reclaimed: u64,
    /// Compressed bytes released from the blob directory.
    pub reclaimed_bytes: u64,
}

enum IngestSource<'a> {
    InMemory(&'a [u8]),
    FromFile(&'a Path),
}

/// Top-level storage engine handle.
///
/// Dropping the engine (or calling [`StorageEngine::shutdown`]) stops the
/// cache's write-back worker after a final drain, so queued entries reach
/// the disk tier before teardown returns.
pub struct StorageEngine {
    catalog: Catalog,
    blobs: BlobStore,
    codec: Codec,
    cache: HybridCache,
    quarantine: Mutex<HashSet<String>>,
    history: stats::HistoryRecorder,
}

impl StorageEngine {
    /// Open the engine, creating the on-disk layout as needed.
    pub fn open(cfg: &EngineConfig) -> Result<Self, EngineError> {
        fs::create_dir_all(&cfg.data_root)?;
        let blobs = BlobStore::open(cfg.blob_dir()).map_err(map_blob_err)?;
        let stale = blobs.cleanup_incomplete().map_err(map_blob_err)?;
        if stale > 0 {
            info!(count = stale, "removed stale blob artifacts");
        }
        let catalog = Catalog::open(&cfg.catalog_path())?;
        let ram_budget = cfg
            .ram_budget
            .unwrap_or_else(|| ram_budget_from_ratio(cfg.ram_ratio));
        let cache = HybridCache::new(CacheConfig {
            ram_budget,
            disk_dir: cfg.cache_root.clone(),
            write_back_delay: cfg.write_back_delay_duration(),
        })?;
        Ok(Self {
            catalog,
            blobs,
            codec: Codec::new(cfg.compression_level),
            cache,
            quarantine: Mutex::new(HashSet::new()),
            history: stats::HistoryRecorder::default(),
        })
    }

    /// The metadata catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The blob store.
    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    /// The hybrid cache.
    pub fn cache(&self) -> &HybridCache {
        &self.cache
    }

    /// Ingest a file from the local filesystem under its own path.
    ///
    /// Duplicate content (by digest) only bumps the blob's refcount;
    /// re-ingesting an unchanged path is refcount-neutral.
    pub fn store_file(&self, source: &Path) -> Result<Digest, EngineError> {
        let digest = digest_file(source)?;
        let size = fs::metadata(source)?.len();
        let logical = source.to_string_lossy().into_owned();
        self.ingest(&logical, &digest, size, IngestSource::FromFile(source))?;
        Ok(digest)
    }

    /// Ingest an in-memory byte sequence under a logical path. Used by the
    /// VFS write path; same refcount semantics as [`Self::store_file`].
    pub fn store_bytes(&self, logical: &str, bytes: &[u8]) -> Result<Digest, EngineError> {
        let digest = digest_bytes(bytes);
        self.ingest(logical, &digest, bytes.len() as u64, IngestSource::InMemory(bytes))?;
        Ok(digest)
    }

    fn ingest(
        &self,
        logical: &str,
        digest: &Digest,
        size: u64,
        source: IngestSource<'_>,
    ) -> Result<(), EngineError> {
        let hex = digest.to_hex();
        if self.catalog.blob(&hex)?.is_some() {
            debug!(path = logical, digest = %hex, "duplicate content, bumping refcount");
            self.catalog.apply_ingest(logical, &hex, size, None)?;
            if let IngestSource::InMemory(bytes) = source {
                self.cache.put(&hex, Arc::new(bytes.to_vec()));
            }
            return Ok(());
        }

        let plain = match source {
            IngestSource::InMemory(bytes) => bytes.to_vec(),
            IngestSource::FromFile(path) => fs::read(path)?,
        };
        let compressed = self.codec.compress(&plain)?;
        self.blobs.put(digest, &compressed).map_err(map_blob_err)?;
        let new_blob = NewBlob {
            blob_path: self.blobs.path_of(digest).to_string_lossy().into_owned(),
            size_original: size,
            size_compressed: compressed.len() as u64,
        };
        self.catalog.apply_ingest(logical, &hex, size, Some(&new_blob))?;
        self.cache.put(&hex, Arc::new(plain));
        info!(
            path = logical,
            digest = %hex,
            size,
            compressed = new_blob.size_compressed,
            "stored new blob"
        );
        Ok(())
    }

    /// Materialise the current contents of `path` at `out_path`.
    pub fn retrieve_file(&self, path: &str, out_path: &Path) -> Result<(), EngineError> {
        let bytes = self.load_file_bytes(path)?;
        fs::write(out_path, bytes.as_slice())?;
        Ok(())
    }

    /// Current contents of the logical path, via the cache.
    pub fn load_file_bytes(&self, path: &str) -> Result<Arc<Vec<u8>>, EngineError> {
        let rec = self
            .catalog
            .file_by_path(path)?
            .ok_or_else(|| EngineError::NotFound(path.to_string()))?;
        self.load_digest_bytes(&rec.digest)
    }

    /// Decompressed contents for a digest: cache lookup, then blob fetch
    /// with decompression, verification, and cache insert.
    pub fn load_digest_bytes(&self, digest_hex: &str) -> Result<Arc<Vec<u8>>, EngineError> {
        if self.is_quarantined(digest_hex) {
            return Err(EngineError::Corrupt { digest: digest_hex.to_string() });
        }
        if let Some((bytes, tier)) = self.cache.get(digest_hex) {
            debug!(digest = %digest_hex, ?tier, "cache hit");
            return Ok(bytes);
        }

        let digest = Digest::from_hex(digest_hex)
            .map_err(|e| EngineError::Invariant(format!("bad digest key {digest_hex}: {e}")))?;
        let compressed = match self.blobs.get(&digest) {
            Ok(bytes) => bytes,
            Err(BlobError::NotFound) => {
                return Err(EngineError::Invariant(format!(
                    "catalog references digest {digest_hex} but the blob file is missing"
                )))
            }
            Err(BlobError::Io(e)) => return Err(EngineError::Io(e)),
        };
        let plain = match self.codec.decompress(&compressed) {
            Ok(plain) => plain,
            Err(e) => {
                error!(digest = %digest_hex, error = %e, "blob failed decompression, quarantining");
                self.quarantine
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .insert(digest_hex.to_string());
                return Err(e.into());
            }
        };
        if digest_bytes(&plain) != digest {
            return Err(EngineError::Invariant(format!(
                "digest mismatch after decompressing blob {digest_hex}"
            )));
        }
        let bytes = Arc::new(plain);
        self.cache.put(digest_hex, Arc::clone(&bytes));
        Ok(bytes)
    }

    /// Drop the file row for `path` and release its blob reference. The
    /// blob itself is retained until the next [`Self::reclaim`] pass.
    pub fn remove_file(&self, path: &str) -> Result<(), EngineError> {
        let rec = self
            .catalog
            .file_by_path(path)?
            .ok_or_else(|| EngineError::NotFound(path.to_string()))?;
        self.catalog.delete_file(path)?;
        let remaining = self.catalog.decr_ref(&rec.digest)?;
        debug!(path, digest = %rec.digest, remaining, "unlinked");
        Ok(())
    }

    /// All file rows, for namespace synchronisation.
    pub fn list_files(&self) -> Result<Vec<FileRecord>, EngineError> {
        Ok(self.catalog.list_files()?)
    }

    /// Delete every blob whose refcount has reached zero: blob file first,
    /// then cache tiers, then the catalog row, so a crash never leaves a
    /// row pointing at a missing file.
    pub fn reclaim(&self) -> Result<ReclaimReport, EngineError> {
        let zero = self.catalog.zero_ref_blobs()?;
        let mut report = ReclaimReport { scanned: zero.len() as u64, ..Default::default() };
        for blob in zero {
            let digest = Digest::from_hex(&blob.digest).map_err(|e| {
                EngineError::Invariant(format!("bad digest in catalog {}: {e}", blob.digest))
            })?;
            self.blobs.remove(&digest).map_err(map_blob_err)?;
            self.cache.remove(&blob.digest);
            self.catalog.delete_blob(&blob.digest)?;
            self.quarantine
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&blob.digest);
            report.reclaimed += 1;
            report.reclaimed_bytes += blob.size_compressed;
        }
        if report.reclaimed > 0 {
            info!(
                blobs = report.reclaimed,
                bytes = report.reclaimed_bytes,
                "reclaimed orphan blobs"
            );
        }
        Ok(report)
    }

    /// True if `digest_hex` has been quarantined in this process.
    pub fn is_quarantined(&self, digest_hex: &str) -> bool {
        self.quarantine
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(digest_hex)
    }

    /// Aggregate statistics snapshot; also records a history sample.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let summary = self.catalog.summary()?;
        let cache = self.cache.stats();
        let snapshot = EngineStats::from_parts(summary, cache, codec::counters());
        self.history.record(snapshot.compression_ratio, snapshot.cache.hit_rate);
        Ok(snapshot)
    }

    /// Rolling history of compression ratio and cache hit rate samples.
    pub fn history(&self) -> StatsHistory {
        self.history.snapshot()
    }

    /// Tear the engine down, draining the write-back set before returning.
    pub fn shutdown(self) {
        // Dropping the cache sends the stop signal, runs the final flush
        // round, and joins the worker.
        drop(self);
    }
}

fn map_blob_err(e: BlobError) -> EngineError {
    match e {
        BlobError::Io(e) => EngineError::Io(e),
        BlobError::NotFound => EngineError::NotFound("blob".to_string()),
    }
}
