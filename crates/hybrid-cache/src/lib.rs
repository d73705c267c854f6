//! Hybrid read cache: a byte-budgeted LRU RAM tier over a persistent disk
//! tier, with deferred disk persistence performed by an owned worker thread.
//!
//! Lock discipline: one mutex guards the RAM map, the byte counter, the
//! hit/miss counters, and the write-back set. Disk I/O never happens while
//! the mutex is held. The write-back worker drains the set under the lock,
//! releases it, then persists whatever was still resident; entries evicted
//! between queueing and flushing are silently skipped for that round.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use lru::LruCache;
use serde::Serialize;
use tracing::{debug, warn};

/// Extension of disk-tier entry files.
pub const CACHE_EXT: &str = "cache";

/// Which tier served a cache hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Served from the in-memory LRU tier.
    Ram,
    /// Served from the disk tier (and promoted into RAM).
    Disk,
}

/// Cache construction parameters.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Byte budget for the RAM tier.
    pub ram_budget: u64,
    /// Directory holding `{digest}.cache` disk-tier entries.
    pub disk_dir: PathBuf,
    /// Write-back worker flush period.
    pub write_back_delay: Duration,
}

/// Resolve a RAM budget as a fraction of total system memory.
pub fn ram_budget_from_ratio(ratio: f64) -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    (sys.total_memory() as f64 * ratio) as u64
}

/// Counter snapshot exposed to Stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Current RAM-tier byte total.
    pub ram_size: u64,
    /// Configured RAM-tier byte budget.
    pub ram_budget: u64,
    /// `ram_size / ram_budget` as a percentage.
    pub ram_usage_percent: f64,
    /// Sum of disk-tier entry file sizes.
    pub disk_size: u64,
    /// Total hits across both tiers.
    pub hits: u64,
    /// Lookups that missed both tiers.
    pub misses: u64,
    /// Hits served from RAM.
    pub ram_hits: u64,
    /// Hits served from disk.
    pub disk_hits: u64,
    /// `hits / (hits + misses)`, 0 when idle.
    pub hit_rate: f64,
}

struct State {
    lru: LruCache<String, Arc<Vec<u8>>>,
    ram_size: u64,
    ram_hits: u64,
    disk_hits: u64,
    misses: u64,
    write_back: HashSet<String>,
}

struct Shared {
    state: Mutex<State>,
    disk_dir: PathBuf,
    ram_budget: u64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn disk_path(&self, digest: &str) -> PathBuf {
        self.disk_dir.join(format!("{digest}.{CACHE_EXT}"))
    }

    // Insert under the lock, evicting from the LRU end until the byte
    // total fits the budget again. Eviction only touches the RAM map.
    fn insert_locked(&self, state: &mut State, digest: &str, bytes: Arc<Vec<u8>>) {
        if let Some(old) = state.lru.put(digest.to_string(), Arc::clone(&bytes)) {
            state.ram_size -= old.len() as u64;
        }
        state.ram_size += bytes.len() as u64;
        while state.ram_size > self.ram_budget {
            match state.lru.pop_lru() {
                Some((evicted, old)) => {
                    state.ram_size -= old.len() as u64;
                    debug!(digest = %evicted, "evicted from ram tier");
                }
                None => break,
            }
        }
    }

    // One write-back round: drain the set under the lock, resolve bytes
    // for digests still resident, then persist without the lock.
    fn flush_round(&self) {
        let pending: Vec<(String, Arc<Vec<u8>>)> = {
            let mut state = self.lock();
            let drained: Vec<String> = state.write_back.drain().collect();
            drained
                .into_iter()
                .filter_map(|digest| {
                    state
                        .lru
                        .peek(digest.as_str())
                        .map(|bytes| (digest, Arc::clone(bytes)))
                })
                .collect()
        };
        for (digest, bytes) in pending {
            let path = self.disk_path(&digest);
            if let Err(e) = fs::write(&path, bytes.as_slice()) {
                warn!(digest = %digest, error = %e, "write-back flush failed, dropping entry");
            }
        }
    }
}

/// Two-tier cache handle. Owns the write-back worker; dropping the handle
/// stops and joins the worker after a final drain.
pub struct HybridCache {
    shared: Arc<Shared>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl HybridCache {
    /// Create the cache, its disk directory, and the write-back worker.
    pub fn new(cfg: CacheConfig) -> io::Result<Self> {
        fs::create_dir_all(&cfg.disk_dir)?;
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                lru: LruCache::unbounded(),
                ram_size: 0,
                ram_hits: 0,
                disk_hits: 0,
                misses: 0,
                write_back: HashSet::new(),
            }),
            disk_dir: cfg.disk_dir,
            ram_budget: cfg.ram_budget,
        });

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let worker_shared = Arc::clone(&shared);
        let delay = cfg.write_back_delay;
        let worker = std::thread::Builder::new()
            .name("cache-writeback".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(delay) {
                    Err(RecvTimeoutError::Timeout) => worker_shared.flush_round(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        worker_shared.flush_round();
                        break;
                    }
                }
            })?;

        Ok(Self { shared, stop_tx: Some(stop_tx), worker: Some(worker) })
    }

    /// Configured RAM budget in bytes.
    pub fn ram_budget(&self) -> u64 {
        self.shared.ram_budget
    }

    /// Lookup pipeline: RAM tier, then disk tier with promotion into RAM,
    /// then miss.
    pub fn get(&self, digest: &str) -> Option<(Arc<Vec<u8>>, Tier)> {
        {
            let mut state = self.shared.lock();
            if let Some(bytes) = state.lru.get(digest) {
                let bytes = Arc::clone(bytes);
                state.ram_hits += 1;
                return Some((bytes, Tier::Ram));
            }
        }

        match fs::read(self.shared.disk_path(digest)) {
            Ok(raw) => {
                let bytes = Arc::new(raw);
                let mut state = self.shared.lock();
                self.shared.insert_locked(&mut state, digest, Arc::clone(&bytes));
                state.disk_hits += 1;
                Some((bytes, Tier::Disk))
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(digest = %digest, error = %e, "disk tier read failed, treating as miss");
                }
                let mut state = self.shared.lock();
                state.misses += 1;
                None
            }
        }
    }

    /// Insert into the RAM tier (evicting as needed) and queue the digest
    /// for deferred disk persistence. Never blocks on disk I/O.
    pub fn put(&self, digest: &str, bytes: Arc<Vec<u8>>) {
        let mut state = self.shared.lock();
        self.shared.insert_locked(&mut state, digest, bytes);
        state.write_back.insert(digest.to_string());
    }

    /// Remove a digest from both tiers: the disk entry first, then the RAM
    /// entry and its write-back membership.
    pub fn remove(&self, digest: &str) {
        let path = self.shared.disk_path(digest);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(digest = %digest, error = %e, "disk tier remove failed");
            }
        }
        let mut state = self.shared.lock();
        if let Some(old) = state.lru.pop(digest) {
            state.ram_size -= old.len() as u64;
        }
        state.write_back.remove(digest);
    }

    /// True if the digest is currently resident in RAM. Does not count as a
    /// lookup or touch recency.
    pub fn ram_contains(&self, digest: &str) -> bool {
        self.shared.lock().lru.peek(digest).is_some()
    }

    /// Drop every RAM entry and the pending write-back set.
    pub fn clear_ram(&self) {
        let mut state = self.shared.lock();
        state.lru.clear();
        state.ram_size = 0;
        state.write_back.clear();
    }

    /// Delete every disk-tier entry.
    pub fn clear_disk(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.shared.disk_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == CACHE_EXT).unwrap_or(false) {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Run one synchronous write-back round.
    pub fn flush(&self) {
        self.shared.flush_round();
    }

    /// Counter snapshot plus current tier sizes.
    pub fn stats(&self) -> CacheStats {
        let (ram_size, ram_hits, disk_hits, misses) = {
            let state = self.shared.lock();
            (state.ram_size, state.ram_hits, state.disk_hits, state.misses)
        };
        let disk_size = disk_dir_size(&self.shared.disk_dir).unwrap_or(0);
        let hits = ram_hits + disk_hits;
        let lookups = hits + misses;
        CacheStats {
            ram_size,
            ram_budget: self.shared.ram_budget,
            ram_usage_percent: if self.shared.ram_budget == 0 {
                0.0
            } else {
                ram_size as f64 / self.shared.ram_budget as f64 * 100.0
            },
            disk_size,
            hits,
            misses,
            ram_hits,
            disk_hits,
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }

    /// Stop the worker after a final drain of the write-back set.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for HybridCache {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn disk_dir_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0u64;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path().extension().map(|e| e == CACHE_EXT).unwrap_or(false) {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_budget(dir: &Path, budget: u64) -> HybridCache {
        HybridCache::new(CacheConfig {
            ram_budget: budget,
            disk_dir: dir.to_path_buf(),
            // Long enough that tests control flushing explicitly.
            write_back_delay: Duration::from_secs(3600),
        })
        .unwrap()
    }

    #[test]
    fn put_get_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with_budget(dir.path(), 1024);
        cache.put("d1", Arc::new(vec![1, 2, 3]));
        let (bytes, tier) = cache.get("d1").unwrap();
        assert_eq!(*bytes, vec![1, 2, 3]);
        assert_eq!(tier, Tier::Ram);
    }

    #[test]
    fn ram_total_never_exceeds_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with_budget(dir.path(), 1024);
        for i in 0..16 {
            cache.put(&format!("d{i}"), Arc::new(vec![0u8; 300]));
            assert!(cache.stats().ram_size <= 1024);
        }
    }

    #[test]
    fn oversized_entry_does_not_stay_resident() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with_budget(dir.path(), 1024);
        cache.put("big", Arc::new(vec![0u8; 2048]));
        assert!(!cache.ram_contains("big"));
        assert_eq!(cache.stats().ram_size, 0);
    }
}
