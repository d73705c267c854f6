use cask_core::EngineConfig;
use engine::{EngineError, StorageEngine};
use std::fs;
use std::path::Path;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn engine_at(root: &Path, ram_budget: u64) -> StorageEngine {
    let cfg = EngineConfig {
        data_root: root.join("data"),
        cache_root: root.join("cache_ssd"),
        ram_budget: Some(ram_budget),
        // Tests drive flushing explicitly.
        write_back_delay: 3600.0,
        ..EngineConfig::default()
    };
    StorageEngine::open(&cfg).unwrap()
}

fn blob_files(root: &Path) -> Vec<std::path::PathBuf> {
    let mut out: Vec<_> = fs::read_dir(root.join("data").join("blobs"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map(|e| e == "zst").unwrap_or(false))
        .collect();
    out.sort();
    out
}

#[test]
fn single_ingest_and_retrieve() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let eng = engine_at(dir.path(), 1 << 20);

    let src = dir.path().join("A.bin");
    let payload: Vec<u8> = (0..=255u8).collect();
    fs::write(&src, &payload)?;

    let digest = eng.store_file(&src)?;
    assert_eq!(
        digest.to_hex(),
        "40aff2e9d2d8922e47afd4648e6967497158785fbd1da870e7110266bf944880"
    );

    let rec = eng.catalog().file_by_path(&src.to_string_lossy())?.unwrap();
    assert_eq!(rec.size, 256);
    let blob = eng.catalog().blob(&digest.to_hex())?.unwrap();
    assert_eq!(blob.ref_count, 1);
    assert_eq!(blob.size_original, 256);
    assert_eq!(blob_files(dir.path()).len(), 1);

    let out = dir.path().join("A.out");
    eng.retrieve_file(&src.to_string_lossy(), &out)?;
    assert_eq!(fs::read(&out)?, payload);
    Ok(())
}

#[test]
fn duplicate_content_shares_one_blob() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let eng = engine_at(dir.path(), 1 << 20);

    let payload: Vec<u8> = (0..=255u8).collect();
    let a = dir.path().join("A.bin");
    let b = dir.path().join("B.bin");
    fs::write(&a, &payload)?;
    fs::write(&b, &payload)?;

    let da = eng.store_file(&a)?;
    let db = eng.store_file(&b)?;
    assert_eq!(da, db);

    let summary = eng.catalog().summary()?;
    assert_eq!(summary.file_count, 2);
    assert_eq!(summary.blob_count, 1);
    assert_eq!(eng.catalog().blob(&da.to_hex())?.unwrap().ref_count, 2);
    assert_eq!(blob_files(dir.path()).len(), 1);
    Ok(())
}

#[test]
fn unlink_releases_references_and_reclaim_deletes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let eng = engine_at(dir.path(), 1 << 20);

    let payload: Vec<u8> = (0..=255u8).collect();
    let a = dir.path().join("A.bin");
    let b = dir.path().join("B.bin");
    fs::write(&a, &payload)?;
    fs::write(&b, &payload)?;
    let digest = eng.store_file(&a)?;
    eng.store_file(&b)?;

    eng.remove_file(&a.to_string_lossy())?;
    assert_eq!(eng.catalog().summary()?.file_count, 1);
    assert_eq!(eng.catalog().blob(&digest.to_hex())?.unwrap().ref_count, 1);
    assert_eq!(blob_files(dir.path()).len(), 1);

    eng.remove_file(&b.to_string_lossy())?;
    assert_eq!(eng.catalog().summary()?.file_count, 0);
    assert_eq!(eng.catalog().blob(&digest.to_hex())?.unwrap().ref_count, 0);
    // Orphaned, but retained until the explicit reclaim pass.
    assert_eq!(blob_files(dir.path()).len(), 1);

    let report = eng.reclaim()?;
    assert_eq!(report.reclaimed, 1);
    assert!(eng.catalog().blob(&digest.to_hex())?.is_none());
    assert!(blob_files(dir.path()).is_empty());
    Ok(())
}

#[test]
fn unlink_of_missing_path_is_not_found() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let eng = engine_at(dir.path(), 1 << 20);
    assert!(matches!(eng.remove_file("nope"), Err(EngineError::NotFound(_))));
    Ok(())
}

#[test]
fn retrieve_promotes_from_disk_tier() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let eng = engine_at(dir.path(), 1024);

    let c = dir.path().join("C.bin");
    fs::write(&c, vec![0xabu8; 512])?;
    let digest = eng.store_file(&c)?;

    // Persist the RAM entry to the disk tier, then drop it from RAM.
    eng.cache().flush();
    eng.cache().clear_ram();
    assert!(!eng.cache().ram_contains(&digest.to_hex()));

    let out = dir.path().join("C.out");
    eng.retrieve_file(&c.to_string_lossy(), &out)?;
    assert!(eng.cache().ram_contains(&digest.to_hex()));
    assert_eq!(eng.cache().stats().disk_hits, 1);
    assert_eq!(fs::read(&out)?, vec![0xabu8; 512]);
    Ok(())
}

#[test]
fn reingest_of_unchanged_path_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let eng = engine_at(dir.path(), 1 << 20);

    let a = dir.path().join("A.bin");
    fs::write(&a, b"stable contents")?;
    let d1 = eng.store_file(&a)?;
    let before = eng.catalog().summary()?;

    let d2 = eng.store_file(&a)?;
    assert_eq!(d1, d2);
    let after = eng.catalog().summary()?;
    assert_eq!(before, after);
    assert_eq!(eng.catalog().blob(&d1.to_hex())?.unwrap().ref_count, 1);
    Ok(())
}

#[test]
fn empty_file_round_trips() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let eng = engine_at(dir.path(), 1 << 20);

    let src = dir.path().join("empty");
    fs::write(&src, b"")?;
    let digest = eng.store_file(&src)?;
    assert_eq!(
        digest.to_hex(),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );

    let out = dir.path().join("empty.out");
    eng.retrieve_file(&src.to_string_lossy(), &out)?;
    assert_eq!(fs::read(&out)?.len(), 0);
    Ok(())
}

#[test]
fn file_larger_than_ram_budget_is_stored_but_not_resident() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let eng = engine_at(dir.path(), 1024);

    let src = dir.path().join("big.bin");
    fs::write(&src, vec![0x5au8; 4096])?;
    let digest = eng.store_file(&src)?;

    assert!(!eng.cache().ram_contains(&digest.to_hex()));
    let out = dir.path().join("big.out");
    eng.retrieve_file(&src.to_string_lossy(), &out)?;
    assert_eq!(fs::read(&out)?, vec![0x5au8; 4096]);
    Ok(())
}

#[test]
fn corrupt_blob_is_quarantined() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let eng = engine_at(dir.path(), 1 << 20);

    let src = dir.path().join("doc");
    fs::write(&src, b"important data")?;
    let digest = eng.store_file(&src)?;
    let logical = src.to_string_lossy().into_owned();

    // Force the next read through the blob store.
    eng.cache().clear_ram();
    eng.cache().clear_disk()?;
    let blob_path = eng.blob_store().path_of(&digest);
    fs::write(&blob_path, b"not a zstd stream")?;

    let out = dir.path().join("doc.out");
    let err = eng.retrieve_file(&logical, &out).unwrap_err();
    assert!(matches!(err, EngineError::Codec(_)));
    assert!(eng.is_quarantined(&digest.to_hex()));

    // Subsequent reads short-circuit, even if the file is repaired.
    let err = eng.retrieve_file(&logical, &out).unwrap_err();
    assert!(matches!(err, EngineError::Corrupt { .. }));
    // The blob is never deleted automatically.
    assert!(blob_path.exists());
    Ok(())
}

#[test]
fn digest_mismatch_is_an_invariant_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let eng = engine_at(dir.path(), 1 << 20);

    let src = dir.path().join("orig");
    fs::write(&src, b"original contents")?;
    let digest = eng.store_file(&src)?;
    let logical = src.to_string_lossy().into_owned();

    eng.cache().clear_ram();
    eng.cache().clear_disk()?;
    // Swap in a valid stream that decompresses to different bytes.
    let other = codec::Codec::default().compress(b"something else")?;
    fs::write(eng.blob_store().path_of(&digest), other)?;

    let err = eng.load_file_bytes(&logical).unwrap_err();
    assert!(matches!(err, EngineError::Invariant(_)));
    assert!(!eng.is_quarantined(&digest.to_hex()));
    Ok(())
}

#[test]
fn stats_reflect_dedup_and_compression() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let eng = engine_at(dir.path(), 1 << 20);

    let payload = b"compressible ".repeat(512);
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    fs::write(&a, &payload)?;
    fs::write(&b, &payload)?;
    eng.store_file(&a)?;
    eng.store_file(&b)?;

    let stats = eng.stats()?;
    assert_eq!(stats.files, 2);
    assert_eq!(stats.blobs, 1);
    assert_eq!(stats.shared_blobs, 1);
    assert_eq!(stats.logical_bytes, payload.len() as u64 * 2);
    assert!(stats.stored_bytes < stats.logical_bytes);
    assert!(stats.compression_ratio > 0.0);
    assert!((stats.dedup_ratio - 0.5).abs() < f64::EPSILON);

    let history = eng.history();
    assert_eq!(history.compression_ratio.len(), 1);
    Ok(())
}

#[test]
fn shutdown_persists_queued_cache_entries() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let eng = engine_at(dir.path(), 1 << 20);

    let src = dir.path().join("f");
    fs::write(&src, b"queued bytes")?;
    let digest = eng.store_file(&src)?;

    eng.shutdown();
    let entry = dir.path().join("cache_ssd").join(format!("{}.cache", digest.to_hex()));
    assert_eq!(fs::read(entry)?, b"queued bytes");
    Ok(())
}
