//! Process-level tests for the `rdd-reclaim` binary.
//!
//! These run the built executable against temp-dir stores and check the exit
//! status contract: 2 on a usage error, success after a pass, abort on failure.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use revdedup_storage::{
    BucketId, BucketRecord, MetadataLog, SegmentId, SegmentRecord, StoreConfig, CONFIG_ENV,
};
use tempfile::TempDir;

fn small_config(data_dir: &Path) -> StoreConfig {
    StoreConfig {
        data_dir: data_dir.to_path_buf(),
        max_segment_size: 1024,
        max_bucket_size: 4096,
        block_size: 512,
        max_segments: 64,
        max_buckets: 8,
    }
}

fn write_config(dir: &TempDir, config: &StoreConfig) -> PathBuf {
    let path = dir.path().join("reclaim.toml");
    std::fs::write(&path, toml::to_string(config).unwrap()).unwrap();
    path
}

fn run_reclaim(config_path: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rdd-reclaim"))
        .args(args)
        .env(CONFIG_ENV, config_path)
        .output()
        .unwrap()
}

#[test]
fn test_any_argument_is_a_usage_error() {
    let dir = TempDir::new().unwrap();
    let config = small_config(&dir.path().join("store"));
    let config_path = write_config(&dir, &config);

    let output = run_reclaim(&config_path, &["--now"]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage: rdd-reclaim"), "stderr: {}", stderr);
    assert!(!config.data_dir.exists());
}

#[test]
fn test_pass_moves_live_segment_and_retires_candidate() {
    let dir = TempDir::new().unwrap();
    let config = small_config(&dir.path().join("store"));
    let config_path = write_config(&dir, &config);

    let (bucket, live) = {
        let mut log = MetadataLog::create(&config).unwrap();
        let bucket = log.allocate_bucket().unwrap();
        let dead = log
            .allocate_segment(SegmentRecord::new(100, bucket, 0, 0))
            .unwrap();
        let live = log
            .allocate_segment(SegmentRecord::new(200, bucket, 100, 1))
            .unwrap();
        let mut payload = vec![0x11; 100];
        payload.extend(vec![0x22; 200]);
        payload.resize(512, 0);
        std::fs::write(config.bucket_path(bucket), &payload).unwrap();

        let mut record = BucketRecord::sealed(dead, 2, 512);
        record.reclaimable_size = 100;
        log.put_bucket(bucket, record).unwrap();
        log.flush().unwrap();
        (bucket, live)
    };

    let output = run_reclaim(&config_path, &[]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let log = MetadataLog::open(&config).unwrap();
    assert!(log.bucket(bucket).unwrap().record.is_zeroed());
    assert!(!config.bucket_path(bucket).exists());

    let moved = log.segment(live).unwrap().record;
    let new_bucket = BucketId::new(2);
    assert!(moved.belongs_to(new_bucket));
    assert_eq!(moved.offset, 0);
    let file = std::fs::read(config.bucket_path(new_bucket)).unwrap();
    assert_eq!(file.len(), 512);
    assert_eq!(&file[..200], &[0x22; 200][..]);
    assert_eq!(log.segment_high_water(), SegmentId::new(2));
}

#[test]
fn test_missing_store_aborts() {
    let dir = TempDir::new().unwrap();
    let config = small_config(&dir.path().join("absent"));
    let config_path = write_config(&dir, &config);

    let output = run_reclaim(&config_path, &[]);

    assert_eq!(output.status.signal(), Some(libc::SIGABRT));
    assert!(!config.data_dir.exists());
}
