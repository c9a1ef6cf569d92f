//! Store configuration: data directory, size limits and metadata capacities.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::record::BucketId;

/// Default maximum segment payload: 4MB.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 4 * 1024 * 1024;
/// Default maximum bucket payload before rollover: 16MB.
pub const DEFAULT_MAX_BUCKET_SIZE: u64 = 16 * 1024 * 1024;
/// Default block alignment unit for bucket files.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;
/// Default segment map capacity.
pub const DEFAULT_MAX_SEGMENTS: u64 = 1 << 24;
/// Default bucket map capacity.
pub const DEFAULT_MAX_BUCKETS: u64 = 1 << 20;

/// Name of the segment map file under the data directory.
pub const SEGMENT_LOG_NAME: &str = "clog";
/// Name of the bucket map file under the data directory.
pub const BUCKET_LOG_NAME: &str = "blog";
/// Name of the directory holding bucket files.
pub const BUCKET_DIR_NAME: &str = "bucket";

/// Environment variable naming a config file for the reclaim binary.
pub const CONFIG_ENV: &str = "REVDEDUP_CONFIG";

/// Deployment constants of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory holding the metadata logs and bucket files.
    pub data_dir: PathBuf,
    /// Largest allowed segment payload in bytes.
    pub max_segment_size: u64,
    /// Largest payload a bucket may hold before padding.
    pub max_bucket_size: u64,
    /// Bucket files are padded to a multiple of this many bytes.
    pub block_size: u64,
    /// Capacity of the segment map.
    pub max_segments: u64,
    /// Capacity of the bucket map.
    pub max_buckets: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/revdedup"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_bucket_size: DEFAULT_MAX_BUCKET_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            max_segments: DEFAULT_MAX_SEGMENTS,
            max_buckets: DEFAULT_MAX_BUCKETS,
        }
    }
}

impl StoreConfig {
    /// Creates a default config rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: StoreConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| StoreError::InvalidConfig(format!("{}: {}", path.display(), e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| StoreError::InvalidConfig(format!("{}: {}", path.display(), e)))?,
            _ => {
                return Err(StoreError::InvalidConfig(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the size constants against each other.
    pub fn validate(&self) -> StoreResult<()> {
        if self.max_segment_size == 0
            || self.max_bucket_size == 0
            || self.max_segments == 0
            || self.max_buckets == 0
        {
            return Err(StoreError::InvalidConfig(
                "sizes and capacities must be nonzero".to_string(),
            ));
        }
        if !self.block_size.is_power_of_two() {
            return Err(StoreError::InvalidConfig(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        if self.max_segment_size > self.max_bucket_size {
            return Err(StoreError::InvalidConfig(format!(
                "max_segment_size {} exceeds max_bucket_size {}",
                self.max_segment_size, self.max_bucket_size
            )));
        }
        Ok(())
    }

    /// Path of the segment map file.
    pub fn segment_log_path(&self) -> PathBuf {
        self.data_dir.join(SEGMENT_LOG_NAME)
    }

    /// Path of the bucket map file.
    pub fn bucket_log_path(&self) -> PathBuf {
        self.data_dir.join(BUCKET_LOG_NAME)
    }

    /// Directory holding the bucket files.
    pub fn bucket_dir(&self) -> PathBuf {
        self.data_dir.join(BUCKET_DIR_NAME)
    }

    /// Path of the file backing `bucket`.
    pub fn bucket_path(&self, bucket: BucketId) -> PathBuf {
        self.bucket_dir().join(bucket.file_name())
    }

    /// Zero bytes needed to pad `size` up to the next block boundary.
    pub fn padding_for(&self, size: u64) -> u64 {
        (self.block_size - size % self.block_size) % self.block_size
    }
}
