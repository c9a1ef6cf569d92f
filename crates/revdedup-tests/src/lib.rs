//! RevDedup reclamation test infrastructure
//!
//! Store fixtures that populate a metadata log and bucket files the way the
//! ingest path does, plus scenario and property-based tests for compaction.

pub mod harness;
pub mod proptest_reclaim;

pub use harness::{payload_for, SegmentSpec, StoreSnapshot, TestStore};
pub use proptest_reclaim::{arb_bucket, arb_interleaved_layout, arb_layout, arb_segment, BucketPlan};
