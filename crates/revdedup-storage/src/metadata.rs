//! Memory-mapped metadata log: the segment map and the bucket map.
//!
//! Each map is one file laid out as a fixed header followed by a fixed-capacity
//! array of records:
//!
//! ```text
//! +--------------------------+---------------------+---------------------+----
//! | header (8 words)         | record id 1         | record id 2         | ...
//! | magic, version, width,   | WORDS x u64         | WORDS x u64         |
//! | capacity, high water     |                     |                     |
//! +--------------------------+---------------------+---------------------+----
//! ```
//!
//! All access goes through `AtomicU64` views of the mapping. Compaction obtains
//! its write capabilities from [`MetadataLog::split`], which hands the driver a
//! [`RetireHandle`] (read + zero old bucket records) and the writer a
//! [`PublishHandle`] (allocate/publish new bucket records, rewrite segment
//! locations). Neither handle can write what the other owns.
//!
//! Retirement writes are flushed one slot at a time as they happen, so an
//! interrupted pass leaves either a candidate marked retiring or a zeroed
//! record whose file may linger.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::record::{
    BucketEntry, BucketId, BucketRecord, SegmentEntry, SegmentId, SegmentRecord, VERSION_RETIRING,
};

/// Metadata log magic: "RVDDMETA".
pub const LOG_MAGIC: u64 = 0x5256_4444_4d45_5441;
/// Current metadata log format version.
pub const LOG_VERSION: u64 = 1;
/// Words reserved for the header at the start of each map file.
pub const HEADER_WORDS: usize = 8;

const WORD: usize = std::mem::size_of::<u64>();

const H_MAGIC: usize = 0;
const H_VERSION: usize = 1;
const H_RECORD_WORDS: usize = 2;
const H_CAPACITY: usize = 3;
const H_HIGH_WATER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogKind {
    Segment,
    Bucket,
}

impl LogKind {
    fn name(self) -> &'static str {
        match self {
            LogKind::Segment => "segment",
            LogKind::Bucket => "bucket",
        }
    }

    fn record_words(self) -> usize {
        match self {
            LogKind::Segment => SegmentRecord::WORDS,
            LogKind::Bucket => BucketRecord::WORDS,
        }
    }
}

/// One mapped file: header plus record array.
struct MappedArray {
    kind: LogKind,
    path: PathBuf,
    map: MmapMut,
    capacity: u64,
}

impl std::fmt::Debug for MappedArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedArray")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("high_water", &self.high_water())
            .finish()
    }
}

impl MappedArray {
    fn file_len(kind: LogKind, capacity: u64, path: &Path) -> StoreResult<usize> {
        let record_bytes = (kind.record_words() * WORD) as u64;
        capacity
            .checked_mul(record_bytes)
            .and_then(|n| n.checked_add((HEADER_WORDS * WORD) as u64))
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| StoreError::LogOpen {
                path: path.to_path_buf(),
                reason: format!("{} capacity {} too large to map", kind.name(), capacity),
            })
    }

    fn create(path: &Path, kind: LogKind, capacity: u64) -> StoreResult<Self> {
        let len = Self::file_len(kind, capacity, path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| StoreError::LogOpen {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        file.set_len(len as u64)?;

        let array = Self::map(&file, path, kind, capacity, len)?;
        let words = array.words();
        words[H_MAGIC].store(LOG_MAGIC, Ordering::Release);
        words[H_VERSION].store(LOG_VERSION, Ordering::Release);
        words[H_RECORD_WORDS].store(kind.record_words() as u64, Ordering::Release);
        words[H_CAPACITY].store(capacity, Ordering::Release);
        words[H_HIGH_WATER].store(0, Ordering::Release);
        array.flush()?;
        file.sync_all()?;

        debug!(path = %path.display(), kind = kind.name(), capacity, "created metadata map");
        Ok(array)
    }

    fn open(path: &Path, kind: LogKind, capacity: u64) -> StoreResult<Self> {
        let len = Self::file_len(kind, capacity, path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::LogOpen {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let actual = file.metadata()?.len();
        if actual != len as u64 {
            return Err(StoreError::CorruptedLog {
                path: path.to_path_buf(),
                reason: format!("file is {} bytes, expected {}", actual, len),
            });
        }

        let array = Self::map(&file, path, kind, capacity, len)?;
        array.verify_header()?;

        debug!(
            path = %path.display(),
            kind = kind.name(),
            capacity,
            high_water = array.high_water(),
            "opened metadata map"
        );
        Ok(array)
    }

    fn map(
        file: &std::fs::File,
        path: &Path,
        kind: LogKind,
        capacity: u64,
        len: usize,
    ) -> StoreResult<Self> {
        // SAFETY: the metadata files are owned by this process for the lifetime of
        // the mapping; nothing truncates them while mapped.
        let map = unsafe { MmapOptions::new().len(len).map_mut(file) }.map_err(|e| {
            StoreError::LogOpen {
                path: path.to_path_buf(),
                reason: format!("mmap failed: {}", e),
            }
        })?;

        Ok(Self {
            kind,
            path: path.to_path_buf(),
            map,
            capacity,
        })
    }

    fn verify_header(&self) -> StoreResult<()> {
        let words = self.words();
        let check = |idx: usize, expected: u64, what: &str| -> StoreResult<()> {
            let actual = words[idx].load(Ordering::Acquire);
            if actual != expected {
                return Err(StoreError::CorruptedLog {
                    path: self.path.clone(),
                    reason: format!("{}: expected {:#x}, got {:#x}", what, expected, actual),
                });
            }
            Ok(())
        };

        check(H_MAGIC, LOG_MAGIC, "invalid magic")?;
        check(H_VERSION, LOG_VERSION, "unsupported version")?;
        check(
            H_RECORD_WORDS,
            self.kind.record_words() as u64,
            "record width mismatch",
        )?;
        check(H_CAPACITY, self.capacity, "capacity mismatch")?;

        if self.high_water() > self.capacity {
            return Err(StoreError::CorruptedLog {
                path: self.path.clone(),
                reason: format!(
                    "high water {} beyond capacity {}",
                    self.high_water(),
                    self.capacity
                ),
            });
        }
        Ok(())
    }

    fn words(&self) -> &[AtomicU64] {
        // SAFETY: the mapping is page aligned and a whole number of words long,
        // and `AtomicU64` has the same size and alignment as `u64`. Every access
        // to the mapped bytes goes through this atomic view.
        unsafe {
            std::slice::from_raw_parts(
                self.map.as_ptr() as *const AtomicU64,
                self.map.len() / WORD,
            )
        }
    }

    fn check_id(&self, id: u64) -> StoreResult<()> {
        if id == 0 || id > self.capacity {
            return Err(StoreError::IdOutOfRange {
                kind: self.kind.name(),
                id,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn slot_start(&self, id: u64) -> usize {
        HEADER_WORDS + (id as usize - 1) * self.kind.record_words()
    }

    fn slot(&self, id: u64) -> StoreResult<&[AtomicU64]> {
        self.check_id(id)?;
        let start = self.slot_start(id);
        Ok(&self.words()[start..start + self.kind.record_words()])
    }

    fn high_water(&self) -> u64 {
        self.words()[H_HIGH_WATER].load(Ordering::Acquire)
    }

    fn allocate(&self) -> StoreResult<u64> {
        let capacity = self.capacity;
        self.words()[H_HIGH_WATER]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur < capacity).then(|| cur + 1)
            })
            .map(|prev| prev + 1)
            .map_err(|_| StoreError::LogFull {
                kind: self.kind.name(),
                capacity,
            })
    }

    fn flush(&self) -> StoreResult<()> {
        self.map.flush()?;
        Ok(())
    }

    fn flush_header(&self) -> StoreResult<()> {
        self.map.flush_range(0, HEADER_WORDS * WORD)?;
        Ok(())
    }

    fn flush_records(&self, first: u64, last: u64) -> StoreResult<()> {
        self.check_id(first)?;
        self.check_id(last)?;
        if first > last {
            return Ok(());
        }
        let start = self.slot_start(first) * WORD;
        let end = (self.slot_start(last) + self.kind.record_words()) * WORD;
        self.map.flush_range(start, end - start)?;
        Ok(())
    }
}

/// The segment map and bucket map of one store.
#[derive(Debug)]
pub struct MetadataLog {
    segments: MappedArray,
    buckets: MappedArray,
}

impl MetadataLog {
    /// Creates empty metadata files and the bucket directory under `config.data_dir`.
    pub fn create(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(config.bucket_dir())?;

        let segments = MappedArray::create(
            &config.segment_log_path(),
            LogKind::Segment,
            config.max_segments,
        )?;
        let buckets =
            MappedArray::create(&config.bucket_log_path(), LogKind::Bucket, config.max_buckets)?;

        info!(data_dir = %config.data_dir.display(), "created metadata log");
        Ok(Self { segments, buckets })
    }

    /// Maps the existing metadata files of a store.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let segments = MappedArray::open(
            &config.segment_log_path(),
            LogKind::Segment,
            config.max_segments,
        )?;
        let buckets =
            MappedArray::open(&config.bucket_log_path(), LogKind::Bucket, config.max_buckets)?;

        info!(
            data_dir = %config.data_dir.display(),
            segments = segments.high_water(),
            buckets = buckets.high_water(),
            "opened metadata log"
        );
        Ok(Self { segments, buckets })
    }

    /// Reads a segment record.
    pub fn segment(&self, id: SegmentId) -> StoreResult<SegmentEntry> {
        let record = SegmentRecord::load(self.segments.slot(id.into_inner())?);
        Ok(SegmentEntry { id, record })
    }

    /// Reads a bucket record.
    pub fn bucket(&self, id: BucketId) -> StoreResult<BucketEntry> {
        let record = BucketRecord::load(self.buckets.slot(id.into_inner())?);
        Ok(BucketEntry { id, record })
    }

    /// Largest segment id allocated so far (0 when empty).
    pub fn segment_high_water(&self) -> SegmentId {
        SegmentId::new(self.segments.high_water())
    }

    /// Largest bucket id allocated so far (0 when empty).
    pub fn bucket_high_water(&self) -> BucketId {
        BucketId::new(self.buckets.high_water())
    }

    /// Capacity of the segment map.
    pub fn segment_capacity(&self) -> u64 {
        self.segments.capacity
    }

    /// Capacity of the bucket map.
    pub fn bucket_capacity(&self) -> u64 {
        self.buckets.capacity
    }

    /// All bucket records from id 1 up to the high-water mark, including zeroed ones.
    pub fn bucket_entries(&self) -> StoreResult<Vec<BucketEntry>> {
        (1..=self.buckets.high_water())
            .map(|id| self.bucket(BucketId::new(id)))
            .collect()
    }

    /// Allocates the next segment id and stores `record` in it.
    pub fn allocate_segment(&mut self, record: SegmentRecord) -> StoreResult<SegmentId> {
        let id = self.segments.allocate()?;
        record.store(self.segments.slot(id)?);
        Ok(SegmentId::new(id))
    }

    /// Overwrites the reference count of a segment.
    pub fn set_reference_count(&mut self, id: SegmentId, count: u64) -> StoreResult<()> {
        let slot = self.segments.slot(id.into_inner())?;
        let mut record = SegmentRecord::load(slot);
        record.reference_count = count;
        record.store(slot);
        Ok(())
    }

    /// Allocates the next bucket id; its record stays zeroed until `put_bucket`.
    pub fn allocate_bucket(&mut self) -> StoreResult<BucketId> {
        self.buckets.allocate().map(BucketId::new)
    }

    /// Overwrites a bucket record.
    pub fn put_bucket(&mut self, id: BucketId, record: BucketRecord) -> StoreResult<()> {
        record.store(self.buckets.slot(id.into_inner())?);
        Ok(())
    }

    /// Marks `bytes` of a bucket as reclaimable, making it a compaction candidate.
    pub fn mark_reclaimable(&mut self, id: BucketId, bytes: u64) -> StoreResult<()> {
        let slot = self.buckets.slot(id.into_inner())?;
        let mut record = BucketRecord::load(slot);
        record.reclaimable_size = bytes;
        record.store(slot);
        Ok(())
    }

    /// Splits the log into the driver's and the writer's capabilities.
    ///
    /// The bucket high-water mark at this moment becomes the retire limit: the
    /// driver may only zero buckets at or below it, the writer may only publish
    /// buckets above it.
    pub fn split(&mut self) -> (RetireHandle<'_>, PublishHandle<'_>) {
        let limit = self.bucket_high_water();
        let log: &MetadataLog = self;
        (RetireHandle { log, limit }, PublishHandle { log, limit })
    }

    /// Forces both maps to stable storage.
    pub fn flush(&self) -> StoreResult<()> {
        self.segments.flush()?;
        self.buckets.flush()?;
        Ok(())
    }
}

/// Compaction driver capability: read records, retire old buckets.
#[derive(Debug, Clone, Copy)]
pub struct RetireHandle<'a> {
    log: &'a MetadataLog,
    limit: BucketId,
}

impl<'a> RetireHandle<'a> {
    /// Highest bucket id that existed when the log was split.
    pub fn retire_limit(&self) -> BucketId {
        self.limit
    }

    /// Reads a bucket record.
    pub fn bucket(&self, id: BucketId) -> StoreResult<BucketEntry> {
        self.log.bucket(id)
    }

    /// Reads a segment record.
    pub fn segment(&self, id: SegmentId) -> StoreResult<SegmentEntry> {
        self.log.segment(id)
    }

    /// Largest segment id allocated so far.
    pub fn segment_high_water(&self) -> SegmentId {
        self.log.segment_high_water()
    }

    /// Durably tags a pre-existing bucket as being retired, before any of its
    /// segments are relocated.
    pub fn mark_retiring(&self, id: BucketId) -> StoreResult<()> {
        self.check_retirable(id)?;
        let slot = self.log.buckets.slot(id.into_inner())?;
        let mut record = BucketRecord::load(slot);
        record.version = VERSION_RETIRING;
        record.store(slot);
        self.log.buckets.flush_records(id.into_inner(), id.into_inner())
    }

    /// Durably zeroes the record of a pre-existing bucket.
    pub fn retire_bucket(&self, id: BucketId) -> StoreResult<()> {
        self.check_retirable(id)?;
        BucketRecord::default().store(self.log.buckets.slot(id.into_inner())?);
        self.log.buckets.flush_records(id.into_inner(), id.into_inner())
    }

    fn check_retirable(&self, id: BucketId) -> StoreResult<()> {
        if id > self.limit {
            return Err(StoreError::CapabilityViolation(format!(
                "cannot retire {} created after the split (limit {})",
                id, self.limit
            )));
        }
        Ok(())
    }
}

/// Bucket writer capability: allocate and publish new buckets, relocate segments.
#[derive(Debug)]
pub struct PublishHandle<'a> {
    log: &'a MetadataLog,
    limit: BucketId,
}

impl<'a> PublishHandle<'a> {
    /// Largest segment id allocated so far.
    pub fn segment_high_water(&self) -> SegmentId {
        self.log.segment_high_water()
    }

    /// Reads a segment record.
    pub fn segment(&self, id: SegmentId) -> StoreResult<SegmentEntry> {
        self.log.segment(id)
    }

    /// Allocates a new bucket id above every existing one.
    pub fn allocate_bucket(&self) -> StoreResult<BucketId> {
        self.log.buckets.allocate().map(BucketId::new)
    }

    /// Points a segment at its new location. Only `bucket_id` and `offset` change.
    pub fn relocate_segment(&self, id: SegmentId, bucket: BucketId, offset: u64) -> StoreResult<()> {
        self.check_owned(bucket)?;
        let slot = self.log.segments.slot(id.into_inner())?;
        SegmentRecord::store_location(slot, bucket, offset);
        Ok(())
    }

    /// Publishes the final record of a bucket allocated by this handle.
    pub fn publish_bucket(&self, id: BucketId, record: BucketRecord) -> StoreResult<()> {
        self.check_owned(id)?;
        record.store(self.log.buckets.slot(id.into_inner())?);
        Ok(())
    }

    /// Forces the bucket-map high-water mark to stable storage, so allocated
    /// ids are never handed out again after a crash.
    pub fn flush_allocations(&self) -> StoreResult<()> {
        self.log.buckets.flush_header()
    }

    /// Forces one bucket record to stable storage.
    pub fn flush_bucket(&self, id: BucketId) -> StoreResult<()> {
        self.check_owned(id)?;
        self.log
            .buckets
            .flush_records(id.into_inner(), id.into_inner())
    }

    /// Forces the segment records `first..=last` to stable storage.
    pub fn flush_segments(&self, first: SegmentId, last: SegmentId) -> StoreResult<()> {
        self.log
            .segments
            .flush_records(first.into_inner(), last.into_inner())
    }

    fn check_owned(&self, id: BucketId) -> StoreResult<()> {
        if id <= self.limit || id > self.log.bucket_high_water() {
            return Err(StoreError::CapabilityViolation(format!(
                "{} was not allocated by the bucket writer (limit {})",
                id, self.limit
            )));
        }
        Ok(())
    }
}
