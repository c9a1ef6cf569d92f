//! Test Harness - store fixtures for reclamation tests

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use revdedup_storage::{
    compact, BucketEntry, BucketId, BucketRecord, CompactionReport, MetadataLog, SegmentEntry,
    SegmentId, SegmentRecord, StoreConfig, StoreResult,
};
use tempfile::TempDir;
use tracing::debug;

/// Shape of one segment to ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpec {
    /// Payload length in bytes.
    pub length: usize,
    /// Reference count to record.
    pub references: u64,
}

impl SegmentSpec {
    /// A segment referenced by one backup.
    pub fn live(length: usize) -> Self {
        Self {
            length,
            references: 1,
        }
    }

    /// A segment no backup references any more.
    pub fn dead(length: usize) -> Self {
        Self {
            length,
            references: 0,
        }
    }
}

/// Deterministic pseudo-random payload for a seed.
pub fn payload_for(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

#[derive(Debug, Default)]
struct PendingBucket {
    data: Vec<u8>,
    segments: Vec<SegmentId>,
}

/// Point-in-time copy of every record in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Segment records `1..=high water`.
    pub segments: Vec<SegmentEntry>,
    /// Bucket records `1..=high water`, zeroed ones included.
    pub buckets: Vec<BucketEntry>,
}

/// A throwaway store in a temp directory, populated the way the ingest path would.
#[derive(Debug)]
pub struct TestStore {
    temp_dir: TempDir,
    config: StoreConfig,
    log: MetadataLog,
    payloads: HashMap<SegmentId, Vec<u8>>,
    pending: BTreeMap<BucketId, PendingBucket>,
}

impl TestStore {
    /// Small limits: 1KB segments, 4KB buckets, 512-byte blocks.
    pub fn new() -> Self {
        Self::with_limits(1024, 4096, 512)
    }

    /// A store with the given size limits and room for 4096 segments and 512 buckets.
    pub fn with_limits(max_segment_size: u64, max_bucket_size: u64, block_size: u64) -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        let config = StoreConfig {
            data_dir: temp_dir.path().to_path_buf(),
            max_segment_size,
            max_bucket_size,
            block_size,
            max_segments: 4096,
            max_buckets: 512,
        };
        let log = MetadataLog::create(&config).expect("failed to create metadata log");
        debug!(path = %temp_dir.path().display(), max_bucket_size, block_size, "created test store");
        Self {
            temp_dir,
            config,
            log,
            payloads: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Root of the store on disk.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// The store's configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Read access to the metadata log.
    pub fn log(&self) -> &MetadataLog {
        &self.log
    }

    /// Ingest-side access to the metadata log, for staging crash states.
    pub fn log_mut(&mut self) -> &mut MetadataLog {
        &mut self.log
    }

    /// Starts a bucket that segments can be added to, possibly interleaved with others.
    pub fn begin_bucket(&mut self) -> BucketId {
        let id = self.log.allocate_bucket().expect("bucket map full");
        self.pending.insert(id, PendingBucket::default());
        id
    }

    /// Appends a segment to a bucket started with `begin_bucket`.
    pub fn add_segment(&mut self, bucket: BucketId, spec: SegmentSpec) -> SegmentId {
        let seed = self.log.segment_high_water().into_inner() + 1;
        let payload = payload_for(seed, spec.length);
        let pending = self.pending.get_mut(&bucket).expect("bucket not started");
        let record = SegmentRecord::new(
            spec.length as u64,
            bucket,
            pending.data.len() as u64,
            spec.references,
        );
        let id = self.log.allocate_segment(record).expect("segment map full");
        pending.data.extend_from_slice(&payload);
        pending.segments.push(id);
        self.payloads.insert(id, payload);
        id
    }

    /// Pads and writes the bucket file and publishes its record.
    pub fn finish_bucket(&mut self, bucket: BucketId, reclaimable: u64) {
        let mut pending = self.pending.remove(&bucket).expect("bucket not started");
        let padding = self.config.padding_for(pending.data.len() as u64) as usize;
        pending.data.resize(pending.data.len() + padding, 0);
        std::fs::write(self.config.bucket_path(bucket), &pending.data)
            .expect("failed to write bucket file");

        let start = pending
            .segments
            .iter()
            .min()
            .copied()
            .unwrap_or_else(|| SegmentId::new(self.log.segment_high_water().into_inner() + 1));
        let mut record =
            BucketRecord::sealed(start, pending.segments.len() as u64, pending.data.len() as u64);
        record.reclaimable_size = reclaimable;
        self.log
            .put_bucket(bucket, record)
            .expect("failed to publish bucket");
    }

    /// Ingests a whole bucket at once.
    pub fn add_bucket(
        &mut self,
        segments: &[SegmentSpec],
        reclaimable: u64,
    ) -> (BucketId, Vec<SegmentId>) {
        let bucket = self.begin_bucket();
        let ids = segments
            .iter()
            .map(|spec| self.add_segment(bucket, *spec))
            .collect();
        self.finish_bucket(bucket, reclaimable);
        (bucket, ids)
    }

    /// Runs a full compaction pass.
    pub fn compact(&mut self) -> StoreResult<CompactionReport> {
        debug!(pending = self.pending.len(), "compacting test store");
        compact(&mut self.log, &self.config)
    }

    /// The payload a segment was ingested with.
    pub fn original_payload(&self, id: SegmentId) -> &[u8] {
        &self.payloads[&id]
    }

    /// Reads a segment's bytes from wherever its record currently points.
    pub fn read_segment(&self, id: SegmentId) -> std::io::Result<Vec<u8>> {
        let record = self.log.segment(id).expect("segment id out of range").record;
        let data = std::fs::read(self.config.bucket_path(BucketId::new(record.bucket_id)))?;
        let start = record.offset as usize;
        let end = start + record.length as usize;
        data.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "segment past end of bucket")
        })
    }

    /// Ids of all segments with a nonzero reference count.
    pub fn live_segments(&self) -> BTreeSet<SegmentId> {
        self.snapshot()
            .segments
            .into_iter()
            .filter(|e| e.record.is_live())
            .map(|e| e.id)
            .collect()
    }

    /// Returns true if the bucket's file is on disk.
    pub fn bucket_file_exists(&self, id: BucketId) -> bool {
        self.config.bucket_path(id).exists()
    }

    /// The bucket file's full contents, padding included.
    pub fn bucket_file(&self, id: BucketId) -> Vec<u8> {
        std::fs::read(self.config.bucket_path(id)).expect("failed to read bucket file")
    }

    /// Every segment and bucket record up to the high-water marks.
    pub fn snapshot(&self) -> StoreSnapshot {
        let segments = (1..=self.log.segment_high_water().into_inner())
            .map(|id| self.log.segment(SegmentId::new(id)).expect("segment read"))
            .collect();
        let buckets = self.log.bucket_entries().expect("bucket read");
        StoreSnapshot { segments, buckets }
    }

    /// Checks that every live segment reads back as the bytes it was ingested with.
    pub fn verify_integrity(&self) -> Result<(), String> {
        for id in self.live_segments() {
            let actual = self
                .read_segment(id)
                .map_err(|e| format!("{}: {}", id, e))?;
            if actual != self.original_payload(id) {
                return Err(format!("{}: payload differs after compaction", id));
            }
        }
        Ok(())
    }

    /// Segments whose records point into `bucket`, ordered by offset.
    pub fn segments_in(&self, bucket: BucketId) -> Vec<SegmentEntry> {
        let mut entries: Vec<SegmentEntry> = self
            .snapshot()
            .segments
            .into_iter()
            .filter(|e| e.record.belongs_to(bucket))
            .collect();
        entries.sort_by_key(|e| e.record.offset);
        entries
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}
