//! Property-based tests for bucket reclamation

use proptest::prelude::*;
use revdedup_storage::{BucketId, CompactionReport, SegmentId};
use std::collections::BTreeSet;

use crate::harness::{SegmentSpec, StoreSnapshot, TestStore};

/// One ingested bucket: its segments and whether it is marked reclaimable.
#[derive(Debug, Clone)]
pub struct BucketPlan {
    /// Segments in ingest order.
    pub segments: Vec<SegmentSpec>,
    /// Whether the bucket is marked reclaimable.
    pub candidate: bool,
}

/// Generates a segment of 1..=1024 bytes, live about two times in three.
pub fn arb_segment() -> impl Strategy<Value = SegmentSpec> {
    (1usize..=1024, prop_oneof![2 => Just(1u64), 1 => Just(0u64), 1 => 2u64..5])
        .prop_map(|(length, references)| SegmentSpec { length, references })
}

/// Generates one bucket holding up to four segments.
pub fn arb_bucket() -> impl Strategy<Value = BucketPlan> {
    (prop::collection::vec(arb_segment(), 0..5), any::<bool>())
        .prop_map(|(segments, candidate)| BucketPlan { segments, candidate })
}

/// Generates a store layout of up to eight buckets.
pub fn arb_layout() -> impl Strategy<Value = Vec<BucketPlan>> {
    prop::collection::vec(arb_bucket(), 1..8)
}

/// Generates a layout plus the order segments are ingested in: each entry is
/// the index of the bucket receiving the next segment, shuffled so that
/// several open buckets fill up at once.
pub fn arb_interleaved_layout() -> impl Strategy<Value = (Vec<BucketPlan>, Vec<usize>)> {
    arb_layout().prop_flat_map(|layout| {
        let order: Vec<usize> = layout
            .iter()
            .enumerate()
            .flat_map(|(i, plan)| std::iter::repeat(i).take(plan.segments.len()))
            .collect();
        (Just(layout), Just(order).prop_shuffle())
    })
}

type IngestedBucket = (BucketId, Vec<(SegmentId, SegmentSpec)>, bool);

struct Ingested {
    store: TestStore,
    buckets: Vec<IngestedBucket>,
}

fn reclaimable(plan: &BucketPlan) -> u64 {
    if plan.candidate {
        1
    } else {
        0
    }
}

/// Ingests one bucket at a time.
fn ingest(layout: &[BucketPlan]) -> Ingested {
    let mut store = TestStore::new();
    let buckets = layout
        .iter()
        .map(|plan| {
            let (id, ids) = store.add_bucket(&plan.segments, reclaimable(plan));
            let segments = ids.into_iter().zip(plan.segments.iter().copied()).collect();
            (id, segments, plan.candidate)
        })
        .collect();
    Ingested { store, buckets }
}

/// Opens every bucket up front and hands out segments in `order`.
fn ingest_interleaved(layout: &[BucketPlan], order: &[usize]) -> Ingested {
    let mut store = TestStore::new();
    let ids: Vec<BucketId> = layout.iter().map(|_| store.begin_bucket()).collect();
    let mut segments: Vec<Vec<(SegmentId, SegmentSpec)>> = vec![Vec::new(); layout.len()];

    for &index in order {
        let spec = layout[index].segments[segments[index].len()];
        let id = store.add_segment(ids[index], spec);
        segments[index].push((id, spec));
    }
    for (plan, id) in layout.iter().zip(&ids) {
        store.finish_bucket(*id, reclaimable(plan));
    }

    let buckets = ids
        .into_iter()
        .zip(segments)
        .zip(layout)
        .map(|((id, segments), plan)| (id, segments, plan.candidate))
        .collect();
    Ingested { store, buckets }
}

fn sealed_stream(store: &TestStore, report: &CompactionReport) -> Vec<SegmentId> {
    report
        .writer
        .sealed
        .iter()
        .flat_map(|b| store.segments_in(*b))
        .map(|e| e.id)
        .collect()
}

/// Live segments survive, read back intact, and nothing else moves.
fn conservation_and_integrity(ingested: Ingested) {
    let Ingested { mut store, .. } = ingested;
    let live_before = store.live_segments();

    store.compact().unwrap();

    assert_eq!(store.live_segments(), live_before);
    store.verify_integrity().unwrap();
}

/// New buckets respect the size bound and are block aligned with minimal padding.
fn packing_bounds(ingested: Ingested) {
    let Ingested { mut store, .. } = ingested;
    let report = store.compact().unwrap();
    let config = store.config().clone();

    for bucket in &report.writer.sealed {
        let record = store.log().bucket(*bucket).unwrap().record;
        let payload: u64 = store
            .segments_in(*bucket)
            .iter()
            .map(|e| e.record.length)
            .sum();
        assert!(record.segment_count > 0);
        assert!(payload <= config.max_bucket_size);
        assert_eq!(record.size % config.block_size, 0);
        assert!(record.size >= payload);
        assert!(record.size - payload < config.block_size);
        assert_eq!(store.bucket_file(*bucket).len() as u64, record.size);
    }
}

/// Candidates are gone, non-candidates are byte-for-byte untouched.
fn candidates_retired_others_untouched(ingested: Ingested) {
    let Ingested { mut store, buckets } = ingested;
    let kept: Vec<_> = buckets
        .iter()
        .filter(|(_, _, candidate)| !candidate)
        .map(|(id, _, _)| (*id, store.log().bucket(*id).unwrap(), store.bucket_file(*id)))
        .collect();

    let report = store.compact().unwrap();

    let candidates = buckets.iter().filter(|(_, _, c)| *c).count() as u64;
    assert_eq!(report.driver.buckets_reclaimed, candidates);
    for (id, _, candidate) in &buckets {
        if *candidate {
            assert!(!store.bucket_file_exists(*id));
            assert!(store.log().bucket(*id).unwrap().record.is_zeroed());
        }
    }
    for (id, entry, file) in kept {
        assert_eq!(store.log().bucket(id).unwrap(), entry);
        assert_eq!(store.bucket_file(id), file);
    }
}

/// Live segments of candidates arrive in bucket order, then segment order;
/// dead ones never appear; new bucket ids are fresh and increasing.
fn stream_order_and_fresh_ids(ingested: Ingested) {
    let Ingested { mut store, buckets } = ingested;
    let previous = store.log().bucket_high_water();
    let expected: Vec<SegmentId> = buckets
        .iter()
        .filter(|(_, _, candidate)| *candidate)
        .flat_map(|(_, segments, _)| segments.iter())
        .filter(|(_, spec)| spec.references > 0)
        .map(|(id, _)| *id)
        .collect();
    let dead: BTreeSet<SegmentId> = buckets
        .iter()
        .flat_map(|(_, segments, _)| segments.iter())
        .filter(|(_, spec)| spec.references == 0)
        .map(|(id, _)| *id)
        .collect();

    let report = store.compact().unwrap();
    let stream = sealed_stream(&store, &report);

    assert_eq!(stream, expected);
    assert!(stream.iter().all(|id| !dead.contains(id)));
    assert!(report.writer.sealed.iter().all(|id| *id > previous));
    assert!(report.writer.sealed.windows(2).all(|w| w[0] < w[1]));
}

/// A second pass finds nothing to do.
fn second_pass_idempotent(ingested: Ingested) {
    let Ingested { mut store, .. } = ingested;
    store.compact().unwrap();
    let snapshot: StoreSnapshot = store.snapshot();

    let report = store.compact().unwrap();
    assert_eq!(report.driver.buckets_reclaimed, 0);
    assert!(report.writer.sealed.is_empty());
    assert_eq!(store.snapshot(), snapshot);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_conservation_and_integrity(layout in arb_layout()) {
        conservation_and_integrity(ingest(&layout));
    }

    #[test]
    fn prop_packing_bounds(layout in arb_layout()) {
        packing_bounds(ingest(&layout));
    }

    #[test]
    fn prop_candidates_retired_others_untouched(layout in arb_layout()) {
        candidates_retired_others_untouched(ingest(&layout));
    }

    #[test]
    fn prop_stream_order_and_fresh_ids(layout in arb_layout()) {
        stream_order_and_fresh_ids(ingest(&layout));
    }

    #[test]
    fn prop_second_pass_idempotent(layout in arb_layout()) {
        second_pass_idempotent(ingest(&layout));
    }

    #[test]
    fn prop_interleaved_conservation_and_integrity((layout, order) in arb_interleaved_layout()) {
        conservation_and_integrity(ingest_interleaved(&layout, &order));
    }

    #[test]
    fn prop_interleaved_packing_bounds((layout, order) in arb_interleaved_layout()) {
        packing_bounds(ingest_interleaved(&layout, &order));
    }

    #[test]
    fn prop_interleaved_candidates_retired_others_untouched(
        (layout, order) in arb_interleaved_layout()
    ) {
        candidates_retired_others_untouched(ingest_interleaved(&layout, &order));
    }

    #[test]
    fn prop_interleaved_stream_order_and_fresh_ids((layout, order) in arb_interleaved_layout()) {
        stream_order_and_fresh_ids(ingest_interleaved(&layout, &order));
    }

    #[test]
    fn prop_interleaved_second_pass_idempotent((layout, order) in arb_interleaved_layout()) {
        second_pass_idempotent(ingest_interleaved(&layout, &order));
    }
}

#[test]
fn test_empty_candidate_bucket_is_reclaimed() {
    candidates_retired_others_untouched(ingest(&[BucketPlan {
        segments: Vec::new(),
        candidate: true,
    }]));
}

#[test]
fn test_two_buckets_alternating_segments() {
    let layout = vec![
        BucketPlan {
            segments: vec![SegmentSpec::live(300), SegmentSpec::dead(200), SegmentSpec::live(50)],
            candidate: true,
        },
        BucketPlan {
            segments: vec![SegmentSpec::dead(10), SegmentSpec::live(700)],
            candidate: true,
        },
    ];
    let ingested = ingest_interleaved(&layout, &[0, 1, 0, 1, 0]);
    let first: Vec<u64> = ingested.buckets[0]
        .1
        .iter()
        .map(|(id, _)| id.into_inner())
        .collect();
    assert_eq!(first, vec![1, 3, 5]);
    stream_order_and_fresh_ids(ingested);
}
