//! Blob Store (directory-backed CAS)
//!
//! Overview
//! - Content-addressable identity: blobs are keyed by the SHA-256 digest of
//!   their original (uncompressed) bytes; the stored payload is whatever the
//!   caller hands over, one file per digest at `{blob_dir}/{hex}.zst`.
//! - Atomicity & durability: write to a `.incomplete` temporary name,
//!   `fsync`, atomic rename, then directory `fsync`. Concurrent puts of the
//!   same digest are safe: content is idempotent, the rename race is
//!   tolerated.
//! - Immutability: a blob is never rewritten once present.
//! - No internal caching; the hybrid cache sits above this store.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cask_core::Digest;

/// Extension of finished blob files.
pub const BLOB_EXT: &str = "zst";

const INCOMPLETE_EXT: &str = "incomplete";

/// Error type for blob store operations.
#[derive(thiserror::Error, Debug)]
pub enum BlobError {
    /// Underlying IO failure.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// Blob not found.
    #[error("blob not found")]
    NotFound,
}

/// Directory-backed content-addressed store.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (and create if needed) a store rooted at `blob_dir`.
    pub fn open<P: Into<PathBuf>>(blob_dir: P) -> Result<Self, BlobError> {
        let root = blob_dir.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob file for `digest`, whether or not it exists.
    pub fn path_of(&self, digest: &Digest) -> PathBuf {
        self.root.join(format!("{}.{BLOB_EXT}", digest.to_hex()))
    }

    /// Return true if a blob with this digest is present.
    pub fn exists(&self, digest: &Digest) -> bool {
        self.path_of(digest).exists()
    }

    /// Persist `bytes` under `digest`. No-op if the blob already exists.
    ///
    /// The write lands under a temporary name first and is renamed into
    /// place so readers never observe a partial blob.
    pub fn put(&self, digest: &Digest, bytes: &[u8]) -> Result<(), BlobError> {
        let final_path = self.path_of(digest);
        if final_path.exists() {
            return Ok(());
        }

        let tmp_path = final_path.with_extension(INCOMPLETE_EXT);
        {
            let mut out = fs::File::create(&tmp_path)?;
            out.write_all(bytes)?;
            out.sync_all()?;
        }
        match fs::rename(&tmp_path, &final_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Lost the race to a concurrent put of identical content.
                if final_path.exists() {
                    let _ = fs::remove_file(&tmp_path);
                } else {
                    return Err(BlobError::Io(e));
                }
            }
            Err(e) => return Err(BlobError::Io(e)),
        }
        if let Ok(dir) = fs::File::open(&self.root) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    /// Retrieve the stored payload for `digest`.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>, BlobError> {
        match fs::read(self.path_of(digest)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound),
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    /// Delete the blob file. Idempotent: a missing blob is not an error.
    pub fn remove(&self, digest: &Digest) -> Result<(), BlobError> {
        match fs::remove_file(self.path_of(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    /// Remove any `.incomplete` artifacts left by an interrupted put;
    /// returns the count removed.
    pub fn cleanup_incomplete(&self) -> Result<usize, BlobError> {
        let mut removed = 0usize;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path
                .extension()
                .map(|e| e == INCOMPLETE_EXT)
                .unwrap_or(false)
            {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
