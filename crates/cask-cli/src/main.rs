//! `cask` - command-line front end for the storage engine.

#![deny(unsafe_code)]

use cask_core::EngineConfig;
use clap::{Parser, Subcommand};
use engine::StorageEngine;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
use vfs::VfsAdapter;

#[derive(Parser, Debug)]
#[command(name = "cask", about = "Deduplicating, compressing, cached local storage")]
struct Cli {
    /// JSON config file; defaults apply for any missing option.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a file into the store
    Store {
        file: PathBuf,
    },
    /// Materialise a stored path at a new location
    Retrieve {
        path: String,
        out: PathBuf,
    },
    /// Remove a stored path (its blob is reclaimed lazily)
    Rm {
        path: String,
    },
    /// List stored paths
    Ls,
    /// Print an aggregate statistics snapshot
    Stats,
    /// Delete blobs whose refcount has reached zero
    Reclaim,
    /// Mount the store as a virtual volume
    Mount {
        /// Mount location; falls back to the config's mount_point.
        mount_point: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt::layer());
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(p) => {
            let raw = fs::read_to_string(p)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Command::Store { file } => {
            let eng = StorageEngine::open(&cfg)?;
            let digest = eng.store_file(&file)?;
            println!("{digest}  {}", file.display());
            eng.shutdown();
        }
        Command::Retrieve { path, out } => {
            let eng = StorageEngine::open(&cfg)?;
            eng.retrieve_file(&path, &out)?;
            println!("restored {} -> {}", path, out.display());
            eng.shutdown();
        }
        Command::Rm { path } => {
            let eng = StorageEngine::open(&cfg)?;
            eng.remove_file(&path)?;
            println!("removed {path}");
            eng.shutdown();
        }
        Command::Ls => {
            let eng = StorageEngine::open(&cfg)?;
            for rec in eng.list_files()? {
                println!("{:>12}  {}  {}", rec.size, rec.digest, rec.path);
            }
            eng.shutdown();
        }
        Command::Stats => {
            let eng = StorageEngine::open(&cfg)?;
            let stats = eng.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            eng.shutdown();
        }
        Command::Reclaim => {
            let eng = StorageEngine::open(&cfg)?;
            let report = eng.reclaim()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            eng.shutdown();
        }
        Command::Mount { mount_point } => {
            let mount_point = mount_point
                .or_else(|| cfg.mount_point.clone())
                .ok_or("mount_point is required to mount")?;
            let eng = Arc::new(StorageEngine::open(&cfg)?);
            let adapter = Arc::new(VfsAdapter::new(Arc::clone(&eng))?);
            let capability = vfs::require_mount_capability()?;
            let handle = capability.mount(adapter, &mount_point)?;
            println!("mounted at {} - press Enter to unmount", mount_point.display());
            let mut buf = String::new();
            std::io::stdin().read_line(&mut buf)?;
            handle.unmount()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_config_uses_defaults() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.data_root, PathBuf::from("./data"));
        assert_eq!(cfg.compression_level, 5);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"data_root": "/tmp/cask", "ram_ratio": 0.25}}"#).unwrap();
        f.flush().unwrap();

        let cfg = load_config(Some(f.path())).unwrap();
        assert_eq!(cfg.data_root, PathBuf::from("/tmp/cask"));
        assert!((cfg.ram_ratio - 0.25).abs() < f64::EPSILON);
        // Untouched options keep their defaults.
        assert_eq!(cfg.cache_root, PathBuf::from("./cache_ssd"));
    }

    #[test]
    fn malformed_config_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "not json").unwrap();
        f.flush().unwrap();
        assert!(load_config(Some(f.path())).is_err());
    }
}
