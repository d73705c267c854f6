//! Flat-namespace filesystem adapter.
//!
//! Presents the storage engine as a single directory of files to an external
//! mount driver. The adapter keeps a name -> (digest, size) map in memory,
//! synchronised with the catalog at startup, and translates the fixed
//! callback set (getattr, readdir, read, write, create, unlink, truncate)
//! into engine operations.
//!
//! Writes are copy-on-write per file: existing blobs are never mutated. A
//! write loads the current contents, zero-extends past EOF, overlays the new
//! bytes, and commits a new digest through the engine when the bytes
//! actually changed.
//!
//! Host-facing dispatch goes through [`FsOperations`], which wraps every
//! callback with a timeout guard and maps the error taxonomy to host errno
//! values. Mutating operations serialise on the name map's writer lock.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use cask_core::digest_bytes;
use crossbeam_channel::bounded;
use engine::{EngineError, StorageEngine};
use thiserror::Error;
use tracing::{debug, warn};

/// Mode reported for the mount root.
pub const DIR_MODE: u32 = 0o40755;
/// Mode reported for every file; the namespace has a single fixed mode.
pub const FILE_MODE: u32 = 0o100644;

/// Default budget for one host callback.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced to the mount host.
#[derive(Debug, Error)]
pub enum VfsError {
    /// No such file in the namespace.
    #[error("no such file")]
    NotFound,
    /// The operation requires a directory and got a file path.
    #[error("not a directory")]
    NotDir,
    /// The operation requires a file and got the root directory.
    #[error("is a directory")]
    IsDir,
    /// A callback exceeded its time budget.
    #[error("callback timed out")]
    Timeout,
    /// No mount driver capability is available in this build.
    #[error("mount driver not available")]
    MountUnavailable,
    /// Dispatch-level I/O failure.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// Engine failure other than not-found.
    #[error(transparent)]
    Engine(EngineError),
}

impl From<EngineError> for VfsError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(_) => Self::NotFound,
            other => Self::Engine(other),
        }
    }
}

impl VfsError {
    /// Host errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => 2,          // ENOENT
            Self::NotDir => 20,           // ENOTDIR
            Self::IsDir => 21,            // EISDIR
            Self::Timeout => 110,         // ETIMEDOUT
            Self::MountUnavailable | Self::Io(_) | Self::Engine(_) => 5, // EIO
        }
    }
}

/// Attributes reported to the host. `size` is the decompressed length of
/// the current contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    /// File type and permission bits.
    pub mode: u32,
    /// Link count: 2 for the root, 1 for files.
    pub nlink: u32,
    /// Decompressed size in bytes.
    pub size: u64,
    /// Access time.
    pub atime: SystemTime,
    /// Modification time.
    pub mtime: SystemTime,
    /// Change time.
    pub ctime: SystemTime,
}

impl FileAttr {
    fn directory() -> Self {
        let now = SystemTime::now();
        Self { mode: DIR_MODE, nlink: 2, size: 0, atime: now, mtime: now, ctime: now }
    }

    fn file(size: u64) -> Self {
        let now = SystemTime::now();
        Self { mode: FILE_MODE, nlink: 1, size, atime: now, mtime: now, ctime: now }
    }
}

/// Adapter construction options.
#[derive(Debug, Clone)]
pub struct VfsOptions {
    /// Whether a write to an unknown name creates it implicitly.
    pub create_on_write: bool,
    /// Budget for one host callback dispatched via [`FsOperations`].
    pub callback_timeout: Duration,
}

impl Default for VfsOptions {
    fn default() -> Self {
        Self { create_on_write: true, callback_timeout: CALLBACK_TIMEOUT }
    }
}

#[derive(Debug, Clone)]
struct NameEntry {
    digest: String,
    size: u64,
}

/// The filesystem adapter. Reads take the name map's reader lock; mutating
/// operations hold the writer lock for their full duration, which serialises
/// concurrent writes to the namespace.
pub struct VfsAdapter {
    engine: Arc<StorageEngine>,
    names: RwLock<HashMap<String, NameEntry>>,
    opts: VfsOptions,
}

impl VfsAdapter {
    /// Build an adapter with default options, loading the namespace from
    /// the catalog.
    pub fn new(engine: Arc<StorageEngine>) -> Result<Self, VfsError> {
        Self::with_options(engine, VfsOptions::default())
    }

    /// Build an adapter with explicit options.
    pub fn with_options(
        engine: Arc<StorageEngine>,
        opts: VfsOptions,
    ) -> Result<Self, VfsError> {
        let mut names = HashMap::new();
        for rec in engine.list_files()? {
            names.insert(rec.path, NameEntry { digest: rec.digest, size: rec.size });
        }
        debug!(files = names.len(), "namespace synchronised from catalog");
        Ok(Self { engine, names: RwLock::new(names), opts })
    }

    /// Adapter options.
    pub fn options(&self) -> &VfsOptions {
        &self.opts
    }

    // Strip the leading slash of a host path. The namespace is flat, so a
    // remaining separator means the path points below a non-directory.
    fn file_name(path: &str) -> Result<&str, VfsError> {
        let name = path.strip_prefix('/').unwrap_or(path);
        if name.is_empty() {
            return Err(VfsError::IsDir);
        }
        if name.contains('/') {
            return Err(VfsError::NotDir);
        }
        Ok(name)
    }

    /// Attributes for `/` or a file.
    pub fn getattr(&self, path: &str) -> Result<FileAttr, VfsError> {
        if path == "/" {
            return Ok(FileAttr::directory());
        }
        let name = Self::file_name(path)?;
        let names = self.names.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        names
            .get(name)
            .map(|entry| FileAttr::file(entry.size))
            .ok_or(VfsError::NotFound)
    }

    /// Directory listing; only `/` is a directory.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>, VfsError> {
        if path != "/" {
            return Err(VfsError::NotDir);
        }
        let names = self.names.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut out: Vec<String> = names.keys().cloned().collect();
        out.sort();
        Ok(out)
    }

    /// Read `[offset, offset + size)` of the current contents.
    pub fn read(&self, path: &str, size: usize, offset: u64) -> Result<Vec<u8>, VfsError> {
        let name = Self::file_name(path)?;
        let digest = {
            let names = self.names.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            names.get(name).ok_or(VfsError::NotFound)?.digest.clone()
        };
        let bytes = self.engine.load_digest_bytes(&digest)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        let end = start.saturating_add(size).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    /// Overlay `data` at `offset`, zero-extending past EOF; returns the
    /// number of bytes written.
    pub fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize, VfsError> {
        let name = Self::file_name(path)?;
        let mut names = self.names.write().unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut buf = match names.get(name) {
            Some(entry) => self.engine.load_digest_bytes(&entry.digest)?.as_ref().clone(),
            None if self.opts.create_on_write => Vec::new(),
            None => return Err(VfsError::NotFound),
        };

        let offset = usize::try_from(offset)
            .map_err(|_| VfsError::Engine(EngineError::Invariant("write offset overflow".into())))?;
        if buf.len() < offset {
            buf.resize(offset, 0);
        }
        if buf.len() < offset + data.len() {
            buf.resize(offset + data.len(), 0);
        }
        buf[offset..offset + data.len()].copy_from_slice(data);

        self.commit(&mut names, name, buf)?;
        Ok(data.len())
    }

    /// Create (or overwrite with) an empty file. The mode argument is
    /// accepted for the host's sake; the namespace has one fixed mode.
    pub fn create(&self, path: &str, _mode: u32) -> Result<(), VfsError> {
        let name = Self::file_name(path)?;
        let mut names = self.names.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.commit(&mut names, name, Vec::new())?;
        Ok(())
    }

    /// Remove a file from the namespace and release its blob reference.
    pub fn unlink(&self, path: &str) -> Result<(), VfsError> {
        let name = Self::file_name(path)?;
        let mut names = self.names.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !names.contains_key(name) {
            return Err(VfsError::NotFound);
        }
        self.engine.remove_file(name)?;
        names.remove(name);
        Ok(())
    }

    /// Cut or zero-extend the file to `length` bytes.
    pub fn truncate(&self, path: &str, length: u64) -> Result<(), VfsError> {
        let name = Self::file_name(path)?;
        let mut names = self.names.write().unwrap_or_else(std::sync::PoisonError::into_inner);

        let entry = names.get(name).ok_or(VfsError::NotFound)?;
        let length = usize::try_from(length)
            .map_err(|_| VfsError::Engine(EngineError::Invariant("truncate overflow".into())))?;
        if entry.size as usize == length {
            return Ok(());
        }
        let mut buf = self.engine.load_digest_bytes(&entry.digest)?.as_ref().clone();
        buf.resize(length, 0);
        self.commit(&mut names, name, buf)?;
        Ok(())
    }

    // Commit new contents for a name: skip the engine round-trip when the
    // digest is unchanged (a write may self-loop), otherwise store the bytes
    // and update the map entry.
    fn commit(
        &self,
        names: &mut HashMap<String, NameEntry>,
        name: &str,
        buf: Vec<u8>,
    ) -> Result<(), VfsError> {
        let new_digest = digest_bytes(&buf).to_hex();
        if let Some(entry) = names.get(name) {
            if entry.digest == new_digest {
                return Ok(());
            }
        }
        self.engine.store_bytes(name, &buf)?;
        names.insert(
            name.to_string(),
            NameEntry { digest: new_digest, size: buf.len() as u64 },
        );
        Ok(())
    }
}

/// Host-facing callback record. This is the complete surface the external
/// mount driver consumes: the seven typed operations, each wrapped with a
/// timeout guard that returns the neutral error when the budget is spent.
#[derive(Clone)]
pub struct FsOperations {
    adapter: Arc<VfsAdapter>,
    timeout: Duration,
}

impl FsOperations {
    /// Wrap an adapter for host dispatch.
    pub fn new(adapter: Arc<VfsAdapter>) -> Self {
        let timeout = adapter.opts.callback_timeout;
        Self { adapter, timeout }
    }

    fn dispatch<T, F>(&self, op: &'static str, f: F) -> Result<T, VfsError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, VfsError> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        std::thread::Builder::new()
            .name(format!("vfs-{op}"))
            .spawn(move || {
                let _ = tx.send(f());
            })?;
        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(_) => {
                warn!(op, "callback exceeded its budget");
                Err(VfsError::Timeout)
            }
        }
    }

    /// Dispatch getattr.
    pub fn getattr(&self, path: &str) -> Result<FileAttr, VfsError> {
        let adapter = Arc::clone(&self.adapter);
        let path = path.to_string();
        self.dispatch("getattr", move || adapter.getattr(&path))
    }

    /// Dispatch readdir.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>, VfsError> {
        let adapter = Arc::clone(&self.adapter);
        let path = path.to_string();
        self.dispatch("readdir", move || adapter.readdir(&path))
    }

    /// Dispatch read.
    pub fn read(&self, path: &str, size: usize, offset: u64) -> Result<Vec<u8>, VfsError> {
        let adapter = Arc::clone(&self.adapter);
        let path = path.to_string();
        self.dispatch("read", move || adapter.read(&path, size, offset))
    }

    /// Dispatch write.
    pub fn write(&self, path: &str, data: Vec<u8>, offset: u64) -> Result<usize, VfsError> {
        let adapter = Arc::clone(&self.adapter);
        let path = path.to_string();
        self.dispatch("write", move || adapter.write(&path, &data, offset))
    }

    /// Dispatch create.
    pub fn create(&self, path: &str, mode: u32) -> Result<(), VfsError> {
        let adapter = Arc::clone(&self.adapter);
        let path = path.to_string();
        self.dispatch("create", move || adapter.create(&path, mode))
    }

    /// Dispatch unlink.
    pub fn unlink(&self, path: &str) -> Result<(), VfsError> {
        let adapter = Arc::clone(&self.adapter);
        let path = path.to_string();
        self.dispatch("unlink", move || adapter.unlink(&path))
    }

    /// Dispatch truncate.
    pub fn truncate(&self, path: &str, length: u64) -> Result<(), VfsError> {
        let adapter = Arc::clone(&self.adapter);
        let path = path.to_string();
        self.dispatch("truncate", move || adapter.truncate(&path, length))
    }
}

/// A driver able to perform the kernel mount. Implemented outside this
/// crate by whatever native integration the embedding application ships.
pub trait MountDriver: Send + Sync {
    /// Mount the namespace at `mount_point`, consuming callbacks from `ops`.
    fn mount(
        &self,
        ops: FsOperations,
        mount_point: &Path,
    ) -> Result<Box<dyn MountHandle>, VfsError>;
}

/// A live mount, unmounted on consumption.
pub trait MountHandle: Send {
    /// Unmount and release the mount point.
    fn unmount(self: Box<Self>) -> Result<(), VfsError>;
}

/// Explicit capability handle for mounting, constructed once at startup.
/// Absence of a capability means mounting is not available and is surfaced
/// as a configuration error up front, not discovered on first use.
pub struct MountCapability {
    driver: Box<dyn MountDriver>,
}

impl MountCapability {
    /// Wrap a concrete driver.
    pub fn new(driver: Box<dyn MountDriver>) -> Self {
        Self { driver }
    }

    /// Detect a native driver in this build. None is compiled in by
    /// default; embedders register their own via [`MountCapability::new`].
    pub fn detect() -> Option<Self> {
        None
    }

    /// Mount the adapter at `mount_point`.
    pub fn mount(
        &self,
        adapter: Arc<VfsAdapter>,
        mount_point: &Path,
    ) -> Result<Box<dyn MountHandle>, VfsError> {
        self.driver.mount(FsOperations::new(adapter), mount_point)
    }
}

/// Resolve the capability or fail with the configuration error.
pub fn require_mount_capability() -> Result<MountCapability, VfsError> {
    MountCapability::detect().ok_or(VfsError::MountUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(VfsError::NotFound.errno(), 2);
        assert_eq!(VfsError::NotDir.errno(), 20);
        assert_eq!(VfsError::IsDir.errno(), 21);
        assert_eq!(VfsError::Timeout.errno(), 110);
        assert_eq!(VfsError::MountUnavailable.errno(), 5);
    }

    #[test]
    fn file_name_rejects_nested_paths() {
        assert!(matches!(VfsAdapter::file_name("/a/b"), Err(VfsError::NotDir)));
        assert!(matches!(VfsAdapter::file_name("/"), Err(VfsError::IsDir)));
        assert_eq!(VfsAdapter::file_name("/a").unwrap(), "a");
        assert_eq!(VfsAdapter::file_name("a").unwrap(), "a");
    }

    #[test]
    fn no_mount_capability_by_default() {
        assert!(matches!(
            require_mount_capability(),
            Err(VfsError::MountUnavailable)
        ));
    }
}
