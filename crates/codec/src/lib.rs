//! Stateless zstd compress/decompress with aggregate byte counters.
//!
//! The counters are process-global, module-private, and guarded by a single
//! mutex so the original/compressed pair always agrees. Streaming paths
//! record *observed* compressed output, never an estimate.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::Serialize;
use std::io::{self, Cursor, Read, Write};
use std::sync::Mutex;
use thiserror::Error;

/// Default zstd compression level.
pub const DEFAULT_LEVEL: i32 = 5;

/// Chunk size for the streaming paths.
pub const STREAM_CHUNK_SIZE: usize = 16 * 1024; // 16 KiB

/// Errors from the compression pipeline.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying I/O failure while compressing or copying.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// Decompression rejected the input stream.
    #[error("malformed zstd stream: {0}")]
    Malformed(String),
}

/// Aggregate byte counters, read by Stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CodecCounters {
    /// Total uncompressed bytes fed into `compress`/`compress_stream`.
    pub original_bytes: u64,
    /// Total compressed bytes observed on the output side.
    pub compressed_bytes: u64,
}

impl CodecCounters {
    /// Fraction of bytes saved by compression; 0 when nothing was processed.
    pub fn ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        1.0 - self.compressed_bytes as f64 / self.original_bytes as f64
    }
}

static COUNTERS: Mutex<CodecCounters> = Mutex::new(CodecCounters {
    original_bytes: 0,
    compressed_bytes: 0,
});

fn record(original: u64, compressed: u64) {
    let mut c = COUNTERS.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    c.original_bytes += original;
    c.compressed_bytes += compressed;
}

/// Snapshot of the process-global counters.
pub fn counters() -> CodecCounters {
    *COUNTERS.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Reset the process-global counters. Intended for tests.
pub fn reset_counters() {
    *COUNTERS.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
        CodecCounters::default();
}

/// Writer wrapper that counts the bytes actually emitted by the encoder.
struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Stateless codec with a fixed compression level.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    level: i32,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}

impl Codec {
    /// Create a codec with the given zstd level.
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    /// Configured compression level.
    pub fn level(&self) -> i32 {
        self.level
    }

    /// Compress a byte sequence, recording observed sizes.
    pub fn compress(&self, buf: &[u8]) -> Result<Vec<u8>, CodecError> {
        let out = zstd::stream::encode_all(Cursor::new(buf), self.level)?;
        record(buf.len() as u64, out.len() as u64);
        Ok(out)
    }

    /// Decompress a byte sequence produced by `compress`.
    pub fn decompress(&self, buf: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::stream::decode_all(Cursor::new(buf))
            .map_err(|e| CodecError::Malformed(e.to_string()))
    }

    /// Compress from a reader to a writer in 16 KiB chunks with bounded
    /// memory. Returns `(bytes_read, bytes_written)`; the counters are
    /// updated with the observed written count.
    pub fn compress_stream<R: Read, W: Write>(
        &self,
        mut reader: R,
        writer: W,
    ) -> Result<(u64, u64), CodecError> {
        let counting = CountingWriter::new(writer);
        let mut encoder = zstd::stream::write::Encoder::new(counting, self.level)?;
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        let mut total_in: u64 = 0;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            encoder.write_all(&buf[..n])?;
            total_in += n as u64;
        }
        let counting = encoder.finish()?;
        let total_out = counting.written;
        record(total_in, total_out);
        Ok((total_in, total_out))
    }

    /// Decompress from a reader to a writer in 16 KiB chunks with bounded
    /// memory. Returns the number of decompressed bytes written.
    pub fn decompress_stream<R: Read, W: Write>(
        &self,
        reader: R,
        mut writer: W,
    ) -> Result<u64, CodecError> {
        let mut decoder = zstd::stream::read::Decoder::new(reader)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = decoder
                .read(&mut buf)
                .map_err(|e| CodecError::Malformed(e.to_string()))?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
            total += n as u64;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let codec = Codec::default();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let compressed = codec.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        let back = codec.decompress(&compressed).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn malformed_input_is_rejected() {
        let codec = Codec::default();
        let err = codec.decompress(b"definitely not zstd").unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn empty_input_round_trips() {
        let codec = Codec::default();
        let compressed = codec.compress(b"").unwrap();
        assert_eq!(codec.decompress(&compressed).unwrap(), Vec::<u8>::new());
    }
}
