//! Bucket writer: packs segment payloads into size-bounded, block-padded bucket files.
//!
//! A bucket is append-only. Inserting a segment that would push the bucket past
//! `max_bucket_size` seals the current bucket and rolls over to a new one.
//! Sealing pads the file with zeroes to a multiple of `block_size`, syncs it
//! and publishes the final bucket record.
//!
//! Segment records are not repointed on insert. Relocations are held on the
//! open bucket and applied by [`BucketWriter::checkpoint`] or
//! [`BucketWriter::seal`] in this order:
//!
//! 1. fsync the bucket file and the bucket directory
//! 2. flush the bucket-map high-water mark
//! 3. rewrite and flush the segment records
//! 4. publish and flush the bucket record
//!
//! A segment record on disk therefore only ever points at bytes and an id that
//! are already durable.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::metadata::PublishHandle;
use crate::record::{BucketEntry, BucketId, BucketRecord, SegmentEntry, SegmentId};

/// A bucket currently being filled. Owned by the writer thread only.
#[derive(Debug)]
pub struct Bucket {
    id: BucketId,
    start_segment: SegmentId,
    segment_count: u64,
    size: u64,
    file: File,
    path: PathBuf,
    relocations: Vec<(SegmentId, u64)>,
}

impl Bucket {
    /// Id of this bucket.
    pub fn id(&self) -> BucketId {
        self.id
    }

    /// Lower bound on the ids of segments written so far.
    pub fn start_segment(&self) -> SegmentId {
        self.start_segment
    }

    /// Segments written so far.
    pub fn segment_count(&self) -> u64 {
        self.segment_count
    }

    /// Payload bytes written so far (no padding).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the bucket file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Segments written but not yet repointed at this bucket.
    pub fn pending_relocations(&self) -> usize {
        self.relocations.len()
    }
}

/// Statistics for the bucket writer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriterStats {
    /// Buckets sealed and published
    pub buckets_sealed: u64,
    /// Segments written into new buckets
    pub segments_written: u64,
    /// Payload bytes written
    pub bytes_written: u64,
    /// Zero bytes appended for block alignment
    pub padding_bytes: u64,
    /// Ids of the sealed buckets, in sealing order
    pub sealed: Vec<BucketId>,
}

/// Packs segments into new buckets and rewrites their segment records.
pub struct BucketWriter<'a> {
    publisher: PublishHandle<'a>,
    config: StoreConfig,
    padding: Vec<u8>,
    stats: WriterStats,
}

impl<'a> BucketWriter<'a> {
    /// Creates a writer publishing through `publisher`.
    pub fn new(publisher: PublishHandle<'a>, config: &StoreConfig) -> Self {
        debug!(
            "BucketWriter created: max_bucket_size={}, block_size={}",
            config.max_bucket_size, config.block_size
        );
        Self {
            publisher,
            config: config.clone(),
            padding: vec![0u8; config.block_size as usize],
            stats: WriterStats::default(),
        }
    }

    /// Allocates the next bucket id and creates its empty file.
    ///
    /// A file left behind under the new id by an interrupted pass is only
    /// reused when no segment record points into it.
    pub fn open_new_bucket(&mut self) -> StoreResult<Bucket> {
        let id = self.publisher.allocate_bucket()?;
        let path = self.config.bucket_path(id);
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => self.reuse_orphan(id, &path)?,
            Err(e) => return Err(e.into()),
        };
        let start_segment = self.publisher.segment_high_water();

        debug!(bucket = %id, path = %path.display(), "opened new bucket");
        Ok(Bucket {
            id,
            start_segment,
            segment_count: 0,
            size: 0,
            file,
            path,
            relocations: Vec::new(),
        })
    }

    fn reuse_orphan(&self, id: BucketId, path: &Path) -> StoreResult<File> {
        for seg in 1..=self.publisher.segment_high_water().into_inner() {
            if self.publisher.segment(SegmentId::new(seg))?.record.belongs_to(id) {
                return Err(StoreError::StaleBucketFile {
                    bucket: id,
                    path: path.to_path_buf(),
                });
            }
        }
        warn!(bucket = %id, path = %path.display(), "truncating orphaned bucket file");
        let file = OpenOptions::new().write(true).truncate(true).open(path)?;
        Ok(file)
    }

    /// Appends a segment payload, rolling over to a new bucket when full.
    ///
    /// Returns the bucket to use for the next insertion.
    pub fn insert(
        &mut self,
        bucket: Option<Bucket>,
        segment: &SegmentEntry,
        payload: &[u8],
    ) -> StoreResult<Bucket> {
        let len = payload.len() as u64;
        if len != segment.record.length {
            return Err(StoreError::PayloadLengthMismatch {
                segment: segment.id,
                expected: segment.record.length,
                actual: len,
            });
        }
        if len == 0 || len > self.config.max_segment_size {
            return Err(StoreError::CorruptSegment {
                segment: segment.id,
                reason: format!(
                    "length {} outside 1..={}",
                    len, self.config.max_segment_size
                ),
            });
        }

        let mut bucket = match bucket {
            Some(bucket) => bucket,
            None => self.open_new_bucket()?,
        };
        if bucket.size + len > self.config.max_bucket_size {
            self.seal(bucket)?;
            bucket = self.open_new_bucket()?;
        }
        if segment.id < bucket.start_segment {
            bucket.start_segment = segment.id;
        }

        let offset = bucket.size;
        bucket.file.write_all(payload)?;
        bucket.relocations.push((segment.id, offset));

        bucket.segment_count += 1;
        bucket.size += len;
        self.stats.segments_written += 1;
        self.stats.bytes_written += len;

        debug!(
            segment = %segment.id,
            bucket = %bucket.id,
            offset,
            length = len,
            bucket_size = bucket.size,
            "packed segment"
        );
        Ok(bucket)
    }

    /// Pads, syncs and closes a bucket, then publishes its record.
    pub fn seal(&mut self, mut bucket: Bucket) -> StoreResult<BucketEntry> {
        let padding = self.config.padding_for(bucket.size);
        bucket.file.write_all(&self.padding[..padding as usize])?;

        let record =
            BucketRecord::sealed(bucket.start_segment, bucket.segment_count, bucket.size + padding);
        self.commit(&mut bucket, record)?;
        let Bucket { id, file, .. } = bucket;
        drop(file);

        self.stats.buckets_sealed += 1;
        self.stats.padding_bytes += padding;
        self.stats.sealed.push(id);

        debug!(
            bucket = %id,
            segments = record.segment_count,
            size = record.size,
            padding,
            "sealed bucket"
        );
        Ok(BucketEntry { id, record })
    }

    /// Makes everything inserted so far durable and repoints its segments.
    ///
    /// The open bucket is published with its unpadded size so far; sealing
    /// later republishes it. Sealed buckets were committed when sealed.
    pub fn checkpoint(&mut self, bucket: Option<&mut Bucket>) -> StoreResult<()> {
        if let Some(bucket) = bucket {
            let record =
                BucketRecord::sealed(bucket.start_segment, bucket.segment_count, bucket.size);
            self.commit(bucket, record)?;
        }
        Ok(())
    }

    fn commit(&mut self, bucket: &mut Bucket, record: BucketRecord) -> StoreResult<()> {
        bucket.file.sync_all()?;
        File::open(self.config.bucket_dir())?.sync_all()?;
        self.publisher.flush_allocations()?;

        let mut range: Option<(SegmentId, SegmentId)> = None;
        for (segment, offset) in bucket.relocations.drain(..) {
            self.publisher
                .relocate_segment(segment, bucket.id, offset)?;
            range = Some(match range {
                Some((first, last)) => (first.min(segment), last.max(segment)),
                None => (segment, segment),
            });
        }
        if let Some((first, last)) = range {
            self.publisher.flush_segments(first, last)?;
        }

        self.publisher.publish_bucket(bucket.id, record)?;
        self.publisher.flush_bucket(bucket.id)?;
        debug!(bucket = %bucket.id, size = record.size, "committed bucket");
        Ok(())
    }

    /// Statistics so far.
    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Consumes the writer, returning its statistics.
    pub fn into_stats(self) -> WriterStats {
        self.stats
    }
}
