//! Process-wide statistics aggregation with snapshot reads.

use catalog::CatalogSummary;
use codec::CodecCounters;
use hybrid_cache::CacheStats;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Rolling history sample cap.
const HISTORY_CAP: usize = 100;

/// One aggregated snapshot across catalog, cache, and codec.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineStats {
    /// Logical file count.
    pub files: u64,
    /// Unique blob count.
    pub blobs: u64,
    /// Blobs referenced by more than one file.
    pub shared_blobs: u64,
    /// Sum of `size_original * ref_count` over all blobs.
    pub logical_bytes: u64,
    /// Sum of compressed blob sizes.
    pub stored_bytes: u64,
    /// `logical_bytes - stored_bytes`.
    pub space_saved_bytes: u64,
    /// Fraction of logical bytes saved by compression, 0..1.
    pub compression_ratio: f64,
    /// Fraction of files served from an already-present blob, 0..1.
    pub dedup_ratio: f64,
    /// Cache counters and tier sizes.
    pub cache: CacheStats,
    /// Codec byte counters.
    pub codec: CodecCounters,
}

impl EngineStats {
    pub(crate) fn from_parts(
        summary: CatalogSummary,
        cache: CacheStats,
        codec: CodecCounters,
    ) -> Self {
        let compression_ratio = if summary.logical_bytes == 0 {
            0.0
        } else {
            1.0 - summary.stored_bytes as f64 / summary.logical_bytes as f64
        };
        let dedup_ratio = if summary.file_count == 0 {
            0.0
        } else {
            (summary.file_count - summary.blob_count) as f64 / summary.file_count as f64
        };
        Self {
            files: summary.file_count,
            blobs: summary.blob_count,
            shared_blobs: summary.shared_blob_count,
            logical_bytes: summary.logical_bytes,
            stored_bytes: summary.stored_bytes,
            space_saved_bytes: summary.logical_bytes.saturating_sub(summary.stored_bytes),
            compression_ratio,
            dedup_ratio,
            cache,
            codec,
        }
    }
}

/// Bounded history of per-snapshot samples, oldest first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsHistory {
    /// Compression ratio samples.
    pub compression_ratio: Vec<f64>,
    /// Cache hit rate samples.
    pub hit_rate: Vec<f64>,
}

#[derive(Default)]
struct HistoryInner {
    compression_ratio: VecDeque<f64>,
    hit_rate: VecDeque<f64>,
}

/// Recorder behind the engine's `stats()`/`history()` calls.
#[derive(Default)]
pub(crate) struct HistoryRecorder {
    inner: Mutex<HistoryInner>,
}

impl HistoryRecorder {
    pub(crate) fn record(&self, compression_ratio: f64, hit_rate: f64) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        push_capped(&mut inner.compression_ratio, compression_ratio);
        push_capped(&mut inner.hit_rate, hit_rate);
    }

    pub(crate) fn snapshot(&self) -> StatsHistory {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        StatsHistory {
            compression_ratio: inner.compression_ratio.iter().copied().collect(),
            hit_rate: inner.hit_rate.iter().copied().collect(),
        }
    }
}

fn push_capped(buf: &mut VecDeque<f64>, value: f64) {
    if buf.len() == HISTORY_CAP {
        buf.pop_front();
    }
    buf.push_back(value);
}
