//! CASK core primitives and shared types.

#![deny(unsafe_code)]

/// Version of the CASK core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod digest {
    //! Content digests: SHA-256 over full byte sequences, keyed by lowercase hex.

    use sha2::{Digest as _, Sha256};
    use std::fmt;
    use std::fs::File;
    use std::io::Read;
    use std::path::Path;
    use thiserror::Error;

    /// Chunk size for streaming digests over files.
    pub const STREAM_CHUNK_SIZE: usize = 4 * 1024 * 1024; // 4 MiB

    /// 32-byte SHA-256 digest. Two byte sequences are considered identical
    /// iff their digests match.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
    pub struct Digest(pub [u8; 32]);

    /// Errors from parsing a hex-encoded digest.
    #[derive(Debug, Error)]
    pub enum DigestParseError {
        /// Input was not 64 characters long.
        #[error("digest hex must be 64 chars, got {0}")]
        Length(usize),
        /// Input contained a non-hex character.
        #[error("invalid hex: {0}")]
        Hex(#[from] hex::FromHexError),
    }

    impl Digest {
        /// Canonical lowercase hex form, used as a key everywhere a string
        /// is required (blob filenames, cache keys, catalog rows).
        pub fn to_hex(&self) -> String {
            hex::encode(self.0)
        }

        /// Parse the canonical 64-char hex form.
        pub fn from_hex(s: &str) -> Result<Self, DigestParseError> {
            if s.len() != 64 {
                return Err(DigestParseError::Length(s.len()));
            }
            let raw = hex::decode(s)?;
            let mut d = [0u8; 32];
            d.copy_from_slice(&raw);
            Ok(Self(d))
        }
    }

    impl fmt::Display for Digest {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.to_hex())
        }
    }

    /// One-shot hash of an in-memory byte sequence.
    pub fn digest_bytes(buf: &[u8]) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(buf);
        let out = hasher.finalize();
        let mut d = [0u8; 32];
        d.copy_from_slice(&out);
        Digest(d)
    }

    /// Streaming hash of a file, reading in 4 MiB chunks.
    pub fn digest_file(path: &Path) -> std::io::Result<Digest> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let out = hasher.finalize();
        let mut d = [0u8; 32];
        d.copy_from_slice(&out);
        Ok(Digest(d))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::io::Write;

        const EMPTY_SHA256: &str =
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

        #[test]
        fn empty_digest_is_sha256_of_empty_string() {
            assert_eq!(digest_bytes(b"").to_hex(), EMPTY_SHA256);
        }

        #[test]
        fn hex_round_trip() {
            let d = digest_bytes(b"hello");
            let parsed = Digest::from_hex(&d.to_hex()).unwrap();
            assert_eq!(d, parsed);
        }

        #[test]
        fn from_hex_rejects_bad_input() {
            assert!(Digest::from_hex("abc").is_err());
            assert!(Digest::from_hex(&"zz".repeat(32)).is_err());
        }

        #[test]
        fn file_digest_matches_one_shot() {
            let mut f = tempfile::NamedTempFile::new().unwrap();
            let data: Vec<u8> = (0..=255u8).collect();
            f.write_all(&data).unwrap();
            f.flush().unwrap();
            assert_eq!(digest_file(f.path()).unwrap(), digest_bytes(&data));
        }

        #[test]
        fn known_256_byte_vector() {
            let data: Vec<u8> = (0..=255u8).collect();
            assert_eq!(
                digest_bytes(&data).to_hex(),
                "40aff2e9d2d8922e47afd4648e6967497158785fbd1da870e7110266bf944880"
            );
        }
    }
}

pub mod config {
    //! Engine configuration with serde defaults.

    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;
    use std::time::Duration;

    fn default_data_root() -> PathBuf {
        PathBuf::from("./data")
    }
    fn default_cache_root() -> PathBuf {
        PathBuf::from("./cache_ssd")
    }
    fn default_ram_ratio() -> f64 {
        0.10
    }
    fn default_write_back_delay() -> f64 {
        2.0
    }
    fn default_compression_level() -> i32 {
        5
    }

    /// Recognised engine options; all fields have defaults so a partial (or
    /// absent) config file is valid.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EngineConfig {
        /// Root for blobs and metadata.
        #[serde(default = "default_data_root")]
        pub data_root: PathBuf,
        /// Root for the disk-tier cache.
        #[serde(default = "default_cache_root")]
        pub cache_root: PathBuf,
        /// Fraction of total system RAM for the RAM tier.
        #[serde(default = "default_ram_ratio")]
        pub ram_ratio: f64,
        /// Explicit RAM-tier byte budget; overrides `ram_ratio` when set.
        #[serde(default)]
        pub ram_budget: Option<u64>,
        /// Write-back worker flush period, in seconds.
        #[serde(default = "default_write_back_delay")]
        pub write_back_delay: f64,
        /// zstd compression level.
        #[serde(default = "default_compression_level")]
        pub compression_level: i32,
        /// Mount location; required to mount, unused otherwise.
        #[serde(default)]
        pub mount_point: Option<PathBuf>,
    }

    impl Default for EngineConfig {
        fn default() -> Self {
            Self {
                data_root: default_data_root(),
                cache_root: default_cache_root(),
                ram_ratio: default_ram_ratio(),
                ram_budget: None,
                write_back_delay: default_write_back_delay(),
                compression_level: default_compression_level(),
                mount_point: None,
            }
        }
    }

    impl EngineConfig {
        /// Blob directory under the data root.
        pub fn blob_dir(&self) -> PathBuf {
            self.data_root.join("blobs")
        }

        /// Catalog database file under the data root.
        pub fn catalog_path(&self) -> PathBuf {
            self.data_root.join("metadata.db")
        }

        /// Flush period as a `Duration`.
        pub fn write_back_delay_duration(&self) -> Duration {
            Duration::from_secs_f64(self.write_back_delay)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn defaults_match_documented_values() {
            let cfg = EngineConfig::default();
            assert_eq!(cfg.data_root, PathBuf::from("./data"));
            assert_eq!(cfg.cache_root, PathBuf::from("./cache_ssd"));
            assert!((cfg.ram_ratio - 0.10).abs() < f64::EPSILON);
            assert_eq!(cfg.compression_level, 5);
            assert_eq!(cfg.write_back_delay_duration(), Duration::from_secs(2));
            assert!(cfg.mount_point.is_none());
        }

        #[test]
        fn partial_json_fills_defaults() {
            let cfg: EngineConfig =
                serde_json::from_str(r#"{"compression_level": 9}"#).unwrap();
            assert_eq!(cfg.compression_level, 9);
            assert_eq!(cfg.data_root, PathBuf::from("./data"));
        }
    }
}

pub use config::EngineConfig;
pub use digest::{digest_bytes, digest_file, Digest};
