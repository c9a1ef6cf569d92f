//! Error types for the storage subsystem.

use std::path::PathBuf;

use thiserror::Error;

use crate::record::{BucketId, SegmentId};

/// Result type alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for metadata log, bucket and compaction operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wraps standard I/O errors, including short reads and writes on bucket files.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A metadata file could not be created, opened or mapped.
    #[error("Failed to open metadata log {path}: {reason}")]
    LogOpen {
        /// Path of the metadata file.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// A metadata file has a header or length that does not match the configuration.
    #[error("Corrupted metadata log {path}: {reason}")]
    CorruptedLog {
        /// Path of the metadata file.
        path: PathBuf,
        /// Description of the corruption.
        reason: String,
    },

    /// No free record slots remain in a metadata array.
    #[error("Metadata log full: {kind} capacity {capacity} exhausted")]
    LogFull {
        /// Which array ran out of slots.
        kind: &'static str,
        /// Configured capacity of that array.
        capacity: u64,
    },

    /// A record id is zero or beyond the array capacity.
    #[error("{kind} id {id} out of range (capacity {capacity})")]
    IdOutOfRange {
        /// Which array was addressed.
        kind: &'static str,
        /// The offending id.
        id: u64,
        /// Configured capacity of that array.
        capacity: u64,
    },

    /// A bucket's recorded segment count cannot be satisfied by the segment map.
    #[error("Inconsistent bucket {bucket}: expected {expected} segments, found {found}")]
    InconsistentBucket {
        /// The bucket under inspection.
        bucket: BucketId,
        /// Segment count recorded in the bucket record.
        expected: u64,
        /// Matching segments found before the segment map ran out.
        found: u64,
    },

    /// A segment record points outside its bucket or has an invalid length.
    #[error("Corrupt segment {segment}: {reason}")]
    CorruptSegment {
        /// The offending segment.
        segment: SegmentId,
        /// Description of the problem.
        reason: String,
    },

    /// A payload handed to the bucket writer does not match the segment's length.
    #[error("Payload length mismatch for {segment}: record says {expected}, got {actual}")]
    PayloadLengthMismatch {
        /// The segment being inserted.
        segment: SegmentId,
        /// Length from the segment record.
        expected: u64,
        /// Length of the supplied payload.
        actual: u64,
    },

    /// A freshly allocated bucket id already has a file that segments point into.
    #[error("Bucket file {path} for new {bucket} is still referenced")]
    StaleBucketFile {
        /// The newly allocated bucket.
        bucket: BucketId,
        /// Path of the existing file.
        path: PathBuf,
    },

    /// A compaction capability tried to write a record it does not own.
    #[error("Capability violation: {0}")]
    CapabilityViolation(String),

    /// The other end of the compaction pipeline went away.
    #[error("Compaction pipeline closed unexpectedly")]
    PipelineClosed,

    /// The bucket writer thread panicked.
    #[error("Bucket writer thread panicked")]
    WorkerPanicked,

    /// The store configuration is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
