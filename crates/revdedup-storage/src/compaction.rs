//! Bucket reclamation driver.
//!
//! Walks the bucket map oldest-first, and for every bucket marked reclaimable
//! reads its still-referenced segments, streams them to the bucket writer,
//! then zeroes its record and deletes the old bucket file.
//!
//! Per bucket, the on-disk steps are ordered so that a re-run after a crash
//! at any point can finish the job:
//!
//! 1. locate the bucket's segments (no writes; a count mismatch aborts here)
//! 2. durably tag the record `VERSION_RETIRING`
//! 3. submit live segments, then checkpoint until they are durably relocated
//! 4. durably zero the record
//! 5. unlink the file
//!
//! A retiring bucket may come up short on the re-run scan because its moved
//! segments no longer point at it. A zeroed record with a lingering file is
//! an orphan that no segment references.

use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::metadata::RetireHandle;
use crate::pipeline::PipelineProducer;
use crate::record::{BucketEntry, BucketId, SegmentEntry, SegmentId};

/// Statistics about a reclamation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactionStats {
    /// Bucket records examined.
    pub buckets_scanned: u64,
    /// Candidate buckets deleted and zeroed.
    pub buckets_reclaimed: u64,
    /// Live segments handed to the bucket writer.
    pub segments_copied: u64,
    /// Dead segments discarded.
    pub segments_dropped: u64,
    /// Payload bytes handed to the bucket writer.
    pub bytes_copied: u64,
    /// On-disk bytes of the deleted bucket files.
    pub bytes_freed: u64,
    /// Buckets whose retirement an earlier, interrupted pass had started.
    pub buckets_resumed: u64,
}

/// Scans candidate buckets and feeds their live segments into the pipeline.
pub struct CompactionDriver<'a> {
    retirer: RetireHandle<'a>,
    config: &'a StoreConfig,
    stats: CompactionStats,
}

impl<'a> CompactionDriver<'a> {
    /// Creates a driver retiring through `retirer`.
    pub fn new(retirer: RetireHandle<'a>, config: &'a StoreConfig) -> Self {
        Self {
            retirer,
            config,
            stats: CompactionStats::default(),
        }
    }

    /// Buckets a run would reclaim, in scan order.
    pub fn candidates(&self) -> StoreResult<Vec<BucketEntry>> {
        let mut candidates = Vec::new();
        for id in 1..=self.retirer.retire_limit().into_inner() {
            let entry = self.retirer.bucket(BucketId::new(id))?;
            if entry.record.is_candidate() {
                candidates.push(entry);
            }
        }
        Ok(candidates)
    }

    /// Reclaims every candidate bucket, then sends end-of-stream.
    pub fn run(mut self, mut producer: PipelineProducer) -> StoreResult<CompactionStats> {
        let max = self.retirer.retire_limit();
        info!(max_bucket = %max, "starting bucket reclamation");

        for id in 1..=max.into_inner() {
            let entry = self.retirer.bucket(BucketId::new(id))?;
            self.stats.buckets_scanned += 1;
            if !entry.record.is_candidate() {
                continue;
            }
            self.reclaim(&entry, &mut producer)?;
        }

        producer.finish()?;
        info!(
            buckets_reclaimed = self.stats.buckets_reclaimed,
            segments_copied = self.stats.segments_copied,
            bytes_freed = self.stats.bytes_freed,
            "bucket scan complete"
        );
        Ok(self.stats)
    }

    fn reclaim(&mut self, bucket: &BucketEntry, producer: &mut PipelineProducer) -> StoreResult<()> {
        let segments = self.locate_segments(bucket)?;
        if bucket.record.is_retiring() {
            warn!(bucket = %bucket.id, "resuming interrupted retirement");
            self.stats.buckets_resumed += 1;
        }
        let path = self.config.bucket_path(bucket.id);
        let file = match File::open(&path) {
            Ok(file) => Some(file),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if segments.iter().any(|s| s.record.is_live()) {
                    return Err(e.into());
                }
                warn!(bucket = %bucket.id, path = %path.display(), "bucket file already gone");
                None
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(file) = &file {
            advise_willneed(file, bucket.id);
        }

        self.retirer.mark_retiring(bucket.id)?;

        let mut submitted = 0u64;
        for segment in segments {
            match &file {
                Some(file) if segment.record.is_live() => {
                    let payload = self.read_payload(bucket, &segment, file)?;
                    self.stats.segments_copied += 1;
                    self.stats.bytes_copied += segment.record.length;
                    producer.submit(segment, payload)?;
                    submitted += 1;
                }
                _ => self.stats.segments_dropped += 1,
            }
        }
        let had_file = file.is_some();
        drop(file);

        if submitted > 0 {
            producer.checkpoint(bucket.id)?;
        }
        self.retirer.retire_bucket(bucket.id)?;
        if had_file {
            std::fs::remove_file(&path)?;
        }

        self.stats.buckets_reclaimed += 1;
        self.stats.bytes_freed += bucket.record.size;
        debug!(
            bucket = %bucket.id,
            submitted,
            size = bucket.record.size,
            "retired bucket"
        );
        Ok(())
    }

    /// Walks segment ids from the bucket's hint until `segment_count` segments
    /// of this bucket have been seen, and returns them in id order.
    ///
    /// A bucket tagged retiring may fall short: the missing segments were
    /// relocated by the interrupted pass.
    fn locate_segments(&self, bucket: &BucketEntry) -> StoreResult<Vec<SegmentEntry>> {
        let high_water = self.retirer.segment_high_water().into_inner();
        let expected = bucket.record.segment_count;
        let mut next = bucket.record.start_segment().into_inner();
        let mut found = Vec::new();

        while (found.len() as u64) < expected {
            if next > high_water {
                if bucket.record.is_retiring() {
                    debug!(
                        bucket = %bucket.id,
                        expected,
                        found = found.len(),
                        "remaining segments were relocated earlier"
                    );
                    break;
                }
                return Err(StoreError::InconsistentBucket {
                    bucket: bucket.id,
                    expected,
                    found: found.len() as u64,
                });
            }
            let segment = self.retirer.segment(SegmentId::new(next))?;
            next += 1;
            if segment.record.belongs_to(bucket.id) {
                found.push(segment);
            }
        }
        Ok(found)
    }

    fn read_payload(
        &self,
        bucket: &BucketEntry,
        segment: &SegmentEntry,
        file: &File,
    ) -> StoreResult<Vec<u8>> {
        let record = segment.record;
        if record.length == 0 || record.length > self.config.max_segment_size {
            return Err(StoreError::CorruptSegment {
                segment: segment.id,
                reason: format!(
                    "length {} outside 1..={}",
                    record.length, self.config.max_segment_size
                ),
            });
        }
        match record.offset.checked_add(record.length) {
            Some(end) if end <= bucket.record.size => {}
            _ => {
                return Err(StoreError::CorruptSegment {
                    segment: segment.id,
                    reason: format!(
                        "range {}+{} past end of {} ({} bytes)",
                        record.offset, record.length, bucket.id, bucket.record.size
                    ),
                })
            }
        }

        let mut payload = vec![0u8; record.length as usize];
        file.read_exact_at(&mut payload, record.offset)?;
        Ok(payload)
    }
}

#[cfg(target_os = "linux")]
fn advise_willneed(file: &File, bucket: BucketId) {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor stays open for the duration of the call.
    let rc = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_WILLNEED) };
    if rc != 0 {
        warn!(bucket = %bucket, errno = rc, "posix_fadvise(WILLNEED) failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_willneed(_file: &File, _bucket: BucketId) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataLog;
    use crate::pipeline::{channel, PipelineItem};
    use crate::record::{BucketRecord, SegmentRecord, VERSION_RETIRING};
    use tempfile::TempDir;

    fn small_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            data_dir: dir.path().to_path_buf(),
            max_segment_size: 512,
            max_bucket_size: 1024,
            block_size: 256,
            max_segments: 64,
            max_buckets: 16,
        }
    }

    fn write_bucket(
        log: &mut MetadataLog,
        config: &StoreConfig,
        segments: &[(u64, u64)],
        reclaimable: u64,
    ) -> BucketId {
        let bucket = log.allocate_bucket().unwrap();
        let mut offset = 0;
        let mut first = None;
        for &(len, refs) in segments {
            let id = log
                .allocate_segment(SegmentRecord::new(len, bucket, offset, refs))
                .unwrap();
            first.get_or_insert(id);
            offset += len;
        }
        let size = offset + config.padding_for(offset);
        std::fs::write(config.bucket_path(bucket), vec![0xcd; size as usize]).unwrap();

        let start = first.unwrap_or(SegmentId::new(1));
        let mut record = BucketRecord::sealed(start, segments.len() as u64, size);
        record.reclaimable_size = reclaimable;
        log.put_bucket(bucket, record).unwrap();
        bucket
    }

    #[test]
    fn test_candidates_in_scan_order() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut log = MetadataLog::create(&config).unwrap();
        let a = write_bucket(&mut log, &config, &[(10, 1)], 5);
        write_bucket(&mut log, &config, &[(10, 1)], 0);
        let c = write_bucket(&mut log, &config, &[(10, 0)], 10);

        let (retire, _) = log.split();
        let driver = CompactionDriver::new(retire, &config);
        let ids: Vec<BucketId> = driver
            .candidates()
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[test]
    fn test_all_dead_bucket_submits_nothing() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut log = MetadataLog::create(&config).unwrap();
        let bucket = write_bucket(&mut log, &config, &[(10, 0), (20, 0)], 30);

        let (retire, _) = log.split();
        let (producer, rx) = channel();
        let stats = CompactionDriver::new(retire, &config).run(producer).unwrap();

        assert!(matches!(rx.recv().unwrap(), PipelineItem::EndOfStream));
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.buckets_reclaimed, 1);
        assert_eq!(stats.segments_dropped, 2);
        assert_eq!(stats.segments_copied, 0);
        assert_eq!(stats.bytes_freed, 256);
        assert!(!config.bucket_path(bucket).exists());
        assert!(retire.bucket(bucket).unwrap().record.is_zeroed());
    }

    #[test]
    fn test_interleaved_segments_are_skipped() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut log = MetadataLog::create(&config).unwrap();
        let a = log.allocate_bucket().unwrap();
        let b = log.allocate_bucket().unwrap();
        // ids: 1 -> a (dead), 2 -> b, 3 -> a (dead)
        log.allocate_segment(SegmentRecord::new(10, a, 0, 0)).unwrap();
        log.allocate_segment(SegmentRecord::new(10, b, 0, 1)).unwrap();
        log.allocate_segment(SegmentRecord::new(10, a, 10, 0)).unwrap();
        std::fs::write(config.bucket_path(a), vec![0; 256]).unwrap();
        let mut record = BucketRecord::sealed(SegmentId::new(1), 2, 256);
        record.reclaimable_size = 20;
        log.put_bucket(a, record).unwrap();
        log.put_bucket(b, BucketRecord::sealed(SegmentId::new(2), 1, 256))
            .unwrap();

        let (retire, _) = log.split();
        let (producer, _rx) = channel();
        let stats = CompactionDriver::new(retire, &config).run(producer).unwrap();
        assert_eq!(stats.segments_dropped, 2);
        assert_eq!(stats.buckets_reclaimed, 1);
        assert_eq!(stats.buckets_scanned, 2);
        assert!(!retire.bucket(b).unwrap().record.is_zeroed());
    }

    #[test]
    fn test_unsatisfiable_segment_count_is_inconsistent() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut log = MetadataLog::create(&config).unwrap();
        let bucket = write_bucket(&mut log, &config, &[(10, 0)], 10);
        let mut record = log.bucket(bucket).unwrap().record;
        record.segment_count = 3;
        log.put_bucket(bucket, record).unwrap();

        let (retire, _) = log.split();
        let (producer, _rx) = channel();
        let err = CompactionDriver::new(retire, &config)
            .run(producer)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InconsistentBucket {
                expected: 3,
                found: 1,
                ..
            }
        ));
        // Nothing was retired or tagged.
        assert!(config.bucket_path(bucket).exists());
        let record = retire.bucket(bucket).unwrap().record;
        assert!(record.is_candidate());
        assert!(!record.is_retiring());
    }

    #[test]
    fn test_retiring_bucket_tolerates_relocated_segments() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut log = MetadataLog::create(&config).unwrap();
        let old = log.allocate_bucket().unwrap();
        let moved = log.allocate_bucket().unwrap();
        // The live segment already points at bucket 2 when the pass resumes.
        log.allocate_segment(SegmentRecord::new(10, old, 0, 0)).unwrap();
        log.allocate_segment(SegmentRecord::new(20, moved, 0, 1)).unwrap();
        std::fs::write(config.bucket_path(old), vec![0; 256]).unwrap();
        let mut record = BucketRecord::sealed(SegmentId::new(1), 2, 256);
        record.reclaimable_size = 20;
        record.version = VERSION_RETIRING;
        log.put_bucket(old, record).unwrap();
        log.put_bucket(moved, BucketRecord::sealed(SegmentId::new(2), 1, 256))
            .unwrap();

        let (retire, _) = log.split();
        let (producer, rx) = channel();
        let stats = CompactionDriver::new(retire, &config).run(producer).unwrap();
        assert!(matches!(rx.recv().unwrap(), PipelineItem::EndOfStream));
        assert_eq!(stats.buckets_reclaimed, 1);
        assert_eq!(stats.buckets_resumed, 1);
        assert_eq!(stats.segments_dropped, 1);
        assert_eq!(stats.segments_copied, 0);
        assert!(!config.bucket_path(old).exists());
        assert!(retire.bucket(old).unwrap().record.is_zeroed());
        assert_eq!(retire.segment(SegmentId::new(2)).unwrap().record.bucket_id, 2);
    }

    #[test]
    fn test_candidate_is_tagged_retiring_before_segments_move() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut log = MetadataLog::create(&config).unwrap();
        let bucket = write_bucket(&mut log, &config, &[(10, 1)], 5);

        let (retire, _) = log.split();
        let (producer, rx) = channel();
        let handle = std::thread::scope(|s| {
            let rx = rx;
            let driver = s.spawn(|| CompactionDriver::new(retire, &config).run(producer));
            // The segment arrives only after the tag is on the record.
            let item = rx.recv().unwrap();
            assert!(retire.bucket(bucket).unwrap().record.is_retiring());
            match item {
                PipelineItem::Segment { segment, .. } => assert_eq!(segment.id, SegmentId::new(1)),
                other => panic!("unexpected item {:?}", other),
            }
            match rx.recv().unwrap() {
                PipelineItem::Checkpoint { ack, .. } => ack.send(()).unwrap(),
                other => panic!("unexpected item {:?}", other),
            }
            driver.join().unwrap()
        });
        let stats = handle.unwrap();
        assert_eq!(stats.segments_copied, 1);
        assert!(retire.bucket(bucket).unwrap().record.is_zeroed());
    }

    #[test]
    fn test_segment_past_bucket_end_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut log = MetadataLog::create(&config).unwrap();
        let bucket = log.allocate_bucket().unwrap();
        log.allocate_segment(SegmentRecord::new(100, bucket, 200, 1))
            .unwrap();
        std::fs::write(config.bucket_path(bucket), vec![0; 256]).unwrap();
        let mut record = BucketRecord::sealed(SegmentId::new(1), 1, 256);
        record.reclaimable_size = 1;
        log.put_bucket(bucket, record).unwrap();

        let (retire, _) = log.split();
        let (producer, _rx) = channel();
        let err = CompactionDriver::new(retire, &config)
            .run(producer)
            .unwrap_err();
        assert!(matches!(err, StoreError::CorruptSegment { .. }));
    }

    #[test]
    fn test_missing_file_with_live_segment_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut log = MetadataLog::create(&config).unwrap();
        let bucket = write_bucket(&mut log, &config, &[(10, 0), (10, 1)], 10);
        std::fs::remove_file(config.bucket_path(bucket)).unwrap();

        let (retire, _) = log.split();
        let (producer, _rx) = channel();
        assert!(matches!(
            CompactionDriver::new(retire, &config).run(producer),
            Err(StoreError::IoError(_))
        ));
        let record = retire.bucket(bucket).unwrap().record;
        assert!(record.is_candidate());
        assert!(!record.is_retiring());
    }

    #[test]
    fn test_missing_file_without_live_segments_is_retired() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut log = MetadataLog::create(&config).unwrap();
        let bucket = write_bucket(&mut log, &config, &[(10, 0), (30, 0)], 40);
        std::fs::remove_file(config.bucket_path(bucket)).unwrap();

        let (retire, _) = log.split();
        let (producer, rx) = channel();
        let stats = CompactionDriver::new(retire, &config).run(producer).unwrap();
        assert!(matches!(rx.recv().unwrap(), PipelineItem::EndOfStream));
        assert_eq!(stats.buckets_reclaimed, 1);
        assert_eq!(stats.segments_dropped, 2);
        assert!(retire.bucket(bucket).unwrap().record.is_zeroed());
    }
}
