//! Producer/consumer pipeline between the compaction driver and the bucket writer.
//!
//! The driver (producer) runs on the calling thread; the bucket writer
//! (consumer) runs on a dedicated `bucket-writer` thread. They are connected by
//! an unbounded channel of [`PipelineItem`]s, consumed strictly in order, so
//! segments land in new buckets in exactly the order the driver found them.

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::bucket::{Bucket, BucketWriter, WriterStats};
use crate::compaction::{CompactionDriver, CompactionStats};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::metadata::MetadataLog;
use crate::record::{BucketId, SegmentEntry};

/// A unit of work for the bucket writer.
#[derive(Debug)]
pub enum PipelineItem {
    /// A live segment and its payload, to be packed into a new bucket.
    Segment {
        /// The segment record as read by the driver.
        segment: SegmentEntry,
        /// The segment's bytes.
        payload: Vec<u8>,
    },
    /// Make everything submitted so far durable, then acknowledge.
    Checkpoint {
        /// The old bucket about to be retired.
        bucket: BucketId,
        /// Signalled once the checkpoint is durable.
        ack: Sender<()>,
    },
    /// No more items; seal the open bucket and stop.
    EndOfStream,
}

/// Sending side of the pipeline, owned by the compaction driver.
#[derive(Debug)]
pub struct PipelineProducer {
    tx: Sender<PipelineItem>,
    submitted: u64,
}

/// Creates a connected producer and receiver.
pub fn channel() -> (PipelineProducer, Receiver<PipelineItem>) {
    let (tx, rx) = unbounded();
    (PipelineProducer { tx, submitted: 0 }, rx)
}

impl PipelineProducer {
    /// Queues a live segment for packing.
    pub fn submit(&mut self, segment: SegmentEntry, payload: Vec<u8>) -> StoreResult<()> {
        self.tx
            .send(PipelineItem::Segment { segment, payload })
            .map_err(|_| StoreError::PipelineClosed)?;
        self.submitted += 1;
        Ok(())
    }

    /// Blocks until every segment submitted so far is durably written and
    /// its segment record durably rewritten.
    pub fn checkpoint(&mut self, bucket: BucketId) -> StoreResult<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(PipelineItem::Checkpoint { bucket, ack: ack_tx })
            .map_err(|_| StoreError::PipelineClosed)?;
        ack_rx.recv().map_err(|_| StoreError::PipelineClosed)
    }

    /// Sends the end-of-stream marker. Consumes the producer so it is sent once.
    pub fn finish(self) -> StoreResult<()> {
        debug!(submitted = self.submitted, "end of stream");
        self.tx
            .send(PipelineItem::EndOfStream)
            .map_err(|_| StoreError::PipelineClosed)
    }

    /// Segments submitted so far.
    pub fn submitted(&self) -> u64 {
        self.submitted
    }
}

/// Consumer loop: inserts segments in receive order until end of stream,
/// then seals the trailing bucket.
///
/// If the producer disappears without sending `EndOfStream`, the open bucket
/// is still sealed (its segments already point into it) and
/// `PipelineClosed` is returned.
pub fn run_writer(rx: Receiver<PipelineItem>, mut writer: BucketWriter<'_>) -> StoreResult<WriterStats> {
    let mut bucket: Option<Bucket> = None;
    loop {
        match rx.recv() {
            Ok(PipelineItem::Segment { segment, payload }) => {
                bucket = Some(writer.insert(bucket.take(), &segment, &payload)?);
            }
            Ok(PipelineItem::Checkpoint { bucket: retiring, ack }) => {
                writer.checkpoint(bucket.as_mut())?;
                debug!(bucket = %retiring, "checkpoint before retirement");
                // The driver may already have given up; nothing to do then.
                let _ = ack.send(());
            }
            Ok(PipelineItem::EndOfStream) => break,
            Err(_) => {
                warn!("compaction driver went away without end of stream");
                if let Some(open) = bucket.take() {
                    writer.seal(open)?;
                }
                return Err(StoreError::PipelineClosed);
            }
        }
    }

    if let Some(open) = bucket.take() {
        writer.seal(open)?;
    }
    Ok(writer.into_stats())
}

/// Outcome of a complete compaction run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactionReport {
    /// Driver-side statistics.
    pub driver: CompactionStats,
    /// Writer-side statistics.
    pub writer: WriterStats,
}

/// Runs one full compaction pass over the store.
///
/// Spawns the bucket writer thread, runs the driver on the calling thread,
/// waits for the writer to drain, then forces the metadata log and the bucket
/// directory to stable storage.
#[instrument(skip(log, config), fields(data_dir = %config.data_dir.display()))]
pub fn compact(log: &mut MetadataLog, config: &StoreConfig) -> StoreResult<CompactionReport> {
    let (retire, publish) = log.split();
    let (producer, rx) = channel();
    let writer = BucketWriter::new(publish, config);
    let driver = CompactionDriver::new(retire, config);

    let (driver_result, writer_result) = std::thread::scope(|s| -> StoreResult<_> {
        let consumer = std::thread::Builder::new()
            .name("bucket-writer".to_string())
            .spawn_scoped(s, move || run_writer(rx, writer))?;
        let driver_result = driver.run(producer);
        let writer_result = consumer
            .join()
            .unwrap_or_else(|_| Err(StoreError::WorkerPanicked));
        Ok((driver_result, writer_result))
    })?;

    let driver = driver_result?;
    let writer = writer_result?;

    log.flush()?;
    sync_dir(&config.bucket_dir())?;

    info!(
        buckets_reclaimed = driver.buckets_reclaimed,
        buckets_resumed = driver.buckets_resumed,
        segments_copied = driver.segments_copied,
        segments_dropped = driver.segments_dropped,
        buckets_sealed = writer.buckets_sealed,
        "compaction complete"
    );
    Ok(CompactionReport { driver, writer })
}

fn sync_dir(path: &std::path::Path) -> StoreResult<()> {
    std::fs::File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BucketRecord, SegmentId, SegmentRecord};
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

    /// Writes a bucket file holding `segments` (payload, refcount) and records it.
    fn add_bucket(
        log: &mut MetadataLog,
        config: &StoreConfig,
        segments: &[(Vec<u8>, u64)],
        reclaimable: u64,
    ) -> (BucketId, Vec<SegmentId>) {
        let bucket = log.allocate_bucket().unwrap();
        let mut data = Vec::new();
        let mut ids = Vec::new();
        for (payload, refs) in segments {
            let record = SegmentRecord::new(payload.len() as u64, bucket, data.len() as u64, *refs);
            ids.push(log.allocate_segment(record).unwrap());
            data.extend_from_slice(payload);
        }
        data.resize(data.len() + config.padding_for(data.len() as u64) as usize, 0);
        std::fs::write(config.bucket_path(bucket), &data).unwrap();

        let start = ids.first().copied().unwrap_or(log.segment_high_water());
        let mut record = BucketRecord::sealed(start, ids.len() as u64, data.len() as u64);
        record.reclaimable_size = reclaimable;
        log.put_bucket(bucket, record).unwrap();
        (bucket, ids)
    }

    fn read_segment(log: &MetadataLog, config: &StoreConfig, id: SegmentId) -> Vec<u8> {
        let record = log.segment(id).unwrap().record;
        let data = std::fs::read(config.bucket_path(BucketId::new(record.bucket_id))).unwrap();
        data[record.offset as usize..(record.offset + record.length) as usize].to_vec()
    }

    #[test]
    fn test_compact_moves_live_segments() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut log = MetadataLog::create(&config).unwrap();
        let (old, ids) = add_bucket(
            &mut log,
            &config,
            &[(vec![1; 100], 1), (vec![2; 60], 0), (vec![3; 200], 2)],
            60,
        );

        let report = compact(&mut log, &config).unwrap();
        assert_eq!(report.driver.buckets_reclaimed, 1);
        assert_eq!(report.driver.segments_copied, 2);
        assert_eq!(report.driver.segments_dropped, 1);
        assert_eq!(report.writer.sealed, vec![BucketId::new(2)]);

        assert!(!config.bucket_path(old).exists());
        assert!(log.bucket(old).unwrap().record.is_zeroed());
        assert_eq!(read_segment(&log, &config, ids[0]), vec![1; 100]);
        assert_eq!(read_segment(&log, &config, ids[2]), vec![3; 200]);

        let fresh = log.bucket(BucketId::new(2)).unwrap().record;
        assert_eq!(fresh.segment_count, 2);
        assert_eq!(fresh.size, 512);
        assert_eq!(fresh.start_segment_id, ids[0].into_inner());
    }

    #[test]
    fn test_compact_with_no_candidates_is_noop() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut log = MetadataLog::create(&config).unwrap();
        let (bucket, _) = add_bucket(&mut log, &config, &[(vec![9; 10], 1)], 0);
        let before = log.bucket(bucket).unwrap();

        let report = compact(&mut log, &config).unwrap();
        assert_eq!(report.driver.buckets_reclaimed, 0);
        assert_eq!(report.writer.buckets_sealed, 0);
        assert_eq!(log.bucket(bucket).unwrap(), before);
        assert_eq!(log.bucket_high_water(), bucket);
    }

    #[test]
    fn test_run_writer_seals_on_end_of_stream() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut log = MetadataLog::create(&config).unwrap();
        let (_, ids) = add_bucket(&mut log, &config, &[(vec![5; 30], 1)], 30);
        let (retire, publish) = log.split();
        let writer = BucketWriter::new(publish, &config);

        let (mut producer, rx) = channel();
        let segment = retire.segment(ids[0]).unwrap();
        producer.submit(segment, vec![5; 30]).unwrap();
        assert_eq!(producer.submitted(), 1);
        producer.finish().unwrap();

        let stats = run_writer(rx, writer).unwrap();
        assert_eq!(stats.buckets_sealed, 1);
        assert_eq!(stats.segments_written, 1);
    }

    #[test]
    fn test_run_writer_reports_closed_pipeline() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut log = MetadataLog::create(&config).unwrap();
        let (_, ids) = add_bucket(&mut log, &config, &[(vec![5; 30], 1)], 30);
        let (retire, publish) = log.split();
        let writer = BucketWriter::new(publish, &config);

        let (mut producer, rx) = channel();
        producer
            .submit(retire.segment(ids[0]).unwrap(), vec![5; 30])
            .unwrap();
        drop(producer);

        assert!(matches!(
            run_writer(rx, writer),
            Err(StoreError::PipelineClosed)
        ));
        // The partially filled bucket was still sealed and published.
        assert_eq!(retire.bucket(BucketId::new(2)).unwrap().record.segment_count, 1);
    }

    #[test]
    fn test_checkpoint_fails_without_consumer() {
        let (mut producer, rx) = channel();
        drop(rx);
        assert!(matches!(
            producer.checkpoint(BucketId::new(1)),
            Err(StoreError::PipelineClosed)
        ));
    }
}
