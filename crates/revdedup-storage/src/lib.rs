#![warn(missing_docs)]

//! RevDedup storage subsystem: memory-mapped segment/bucket metadata and bucket reclamation
//!
//! Segments are packed into bucket files; the metadata log maps each segment to
//! `(bucket, offset)`. Reclamation rewrites the live segments of sparsely-live
//! buckets into fresh, densely packed buckets and deletes the old ones.
//!
//! Reclaim path: Bucket map scan → Read live segments → Pipeline → Bucket writer → Seal → Retire old bucket

pub mod bucket;
pub mod compaction;
pub mod config;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod record;

pub use bucket::{Bucket, BucketWriter, WriterStats};
pub use compaction::{CompactionDriver, CompactionStats};
pub use config::{StoreConfig, CONFIG_ENV};
pub use error::{StoreError, StoreResult};
pub use metadata::{MetadataLog, PublishHandle, RetireHandle, LOG_MAGIC, LOG_VERSION};
pub use pipeline::{compact, CompactionReport, PipelineItem, PipelineProducer};
pub use record::{
    BucketEntry, BucketId, BucketRecord, SegmentEntry, SegmentId, SegmentRecord, VERSION_ACTIVE,
    VERSION_RETIRING,
};
