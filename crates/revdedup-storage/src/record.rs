//! Fixed-size segment and bucket records stored in the metadata log.
//!
//! Every record is a run of native-endian `u64` words. Records are read and
//! written through `AtomicU64` views of the mapped file, so a record is always
//! copied out as a snapshot (`SegmentEntry` / `BucketEntry`) that carries its
//! own id.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Version tag of a freshly sealed bucket: active, never expires.
pub const VERSION_ACTIVE: u64 = u64::MAX;

/// Version tag of a candidate whose retirement has started. Some of its live
/// segments may already point at new buckets.
pub const VERSION_RETIRING: u64 = u64::MAX - 1;

/// Newtype wrapper around u64 representing a segment identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SegmentId(u64);

impl SegmentId {
    /// Creates a new SegmentId from a u64 value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the inner u64 value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seg:{}", self.0)
    }
}

impl From<u64> for SegmentId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Newtype wrapper around u64 representing a bucket identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BucketId(u64);

impl BucketId {
    /// Creates a new BucketId from a u64 value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the inner u64 value.
    pub fn into_inner(self) -> u64 {
        self.0
    }

    /// File name of this bucket under the bucket directory (fixed-width hex).
    pub fn file_name(self) -> String {
        format!("{:08x}", self.0)
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bucket:{:08x}", self.0)
    }
}

impl From<u64> for BucketId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Metadata for one deduplicated segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentRecord {
    /// Payload length in bytes.
    pub length: u64,
    /// Bucket currently holding the payload (0 = none).
    pub bucket_id: u64,
    /// Byte offset of the payload inside the bucket file.
    pub offset: u64,
    /// Number of live backups referencing this segment (0 = dead).
    pub reference_count: u64,
}

impl SegmentRecord {
    /// Width of a segment record in words.
    pub const WORDS: usize = 4;

    /// Creates a record for a segment stored at `offset` in `bucket`.
    pub fn new(length: u64, bucket: BucketId, offset: u64, reference_count: u64) -> Self {
        Self {
            length,
            bucket_id: bucket.into_inner(),
            offset,
            reference_count,
        }
    }

    /// Returns true if some backup still references the segment.
    pub fn is_live(&self) -> bool {
        self.reference_count > 0
    }

    /// Returns true if the segment's bytes live in `bucket`.
    pub fn belongs_to(&self, bucket: BucketId) -> bool {
        self.bucket_id == bucket.into_inner()
    }

    pub(crate) fn load(words: &[AtomicU64]) -> Self {
        Self {
            length: words[0].load(Ordering::Acquire),
            bucket_id: words[1].load(Ordering::Acquire),
            offset: words[2].load(Ordering::Acquire),
            reference_count: words[3].load(Ordering::Acquire),
        }
    }

    pub(crate) fn store(&self, words: &[AtomicU64]) {
        words[0].store(self.length, Ordering::Release);
        words[1].store(self.bucket_id, Ordering::Release);
        words[2].store(self.offset, Ordering::Release);
        words[3].store(self.reference_count, Ordering::Release);
    }

    /// Rewrites only the location words, leaving length and reference count alone.
    pub(crate) fn store_location(words: &[AtomicU64], bucket: BucketId, offset: u64) {
        words[2].store(offset, Ordering::Release);
        words[1].store(bucket.into_inner(), Ordering::Release);
    }
}

/// Metadata for one bucket file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketRecord {
    /// Lower bound on the ids of segments stored in the bucket.
    pub start_segment_id: u64,
    /// Number of segments packed into the bucket.
    pub segment_count: u64,
    /// Bytes in the bucket file, including block padding.
    pub size: u64,
    /// Bytes considered dead; nonzero marks a compaction candidate.
    pub reclaimable_size: u64,
    /// Version tag; `VERSION_ACTIVE` for freshly sealed buckets.
    pub version: u64,
}

impl BucketRecord {
    /// Width of a bucket record in words.
    pub const WORDS: usize = 5;

    /// Record of a freshly sealed bucket: nothing reclaimable, active version.
    pub fn sealed(start: SegmentId, segment_count: u64, size: u64) -> Self {
        Self {
            start_segment_id: start.into_inner(),
            segment_count,
            size,
            reclaimable_size: 0,
            version: VERSION_ACTIVE,
        }
    }

    /// Returns true if this bucket is marked for the current compaction pass.
    pub fn is_candidate(&self) -> bool {
        self.reclaimable_size != 0
    }

    /// Returns true if a previous pass began retiring this bucket.
    pub fn is_retiring(&self) -> bool {
        self.version == VERSION_RETIRING
    }

    /// Returns true if every field is zero (retired or never used).
    pub fn is_zeroed(&self) -> bool {
        *self == Self::default()
    }

    /// The scan hint as a segment id; a zero hint scans from the first id.
    pub fn start_segment(&self) -> SegmentId {
        SegmentId::new(self.start_segment_id.max(1))
    }

    pub(crate) fn load(words: &[AtomicU64]) -> Self {
        Self {
            start_segment_id: words[0].load(Ordering::Acquire),
            segment_count: words[1].load(Ordering::Acquire),
            size: words[2].load(Ordering::Acquire),
            reclaimable_size: words[3].load(Ordering::Acquire),
            version: words[4].load(Ordering::Acquire),
        }
    }

    pub(crate) fn store(&self, words: &[AtomicU64]) {
        words[0].store(self.start_segment_id, Ordering::Release);
        words[1].store(self.segment_count, Ordering::Release);
        words[2].store(self.size, Ordering::Release);
        words[3].store(self.reclaimable_size, Ordering::Release);
        words[4].store(self.version, Ordering::Release);
    }
}

/// A segment record together with its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentEntry {
    /// Id of the segment.
    pub id: SegmentId,
    /// Snapshot of the record.
    pub record: SegmentRecord,
}

/// A bucket record together with its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketEntry {
    /// Id of the bucket.
    pub id: BucketId,
    /// Snapshot of the record.
    pub record: BucketRecord,
}
