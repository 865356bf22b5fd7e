/*!
 * Region Tracker Tests
 * Mapping bookkeeping, overlap handling and usage totals
 *
 * The tracker is a process-wide singleton, so every test here runs
 * serialized and balances its init with a shutdown.
 */

use heaptrace::regions;
use pretty_assertions::assert_eq;
use serial_test::serial;

#[test]
#[serial]
fn inactive_tracker_answers_nothing() {
    assert!(!regions::is_active());
    regions::record_mapping(0x1000, 0x1000, &[]);
    assert!(regions::find_region(0x1800).is_none());
    assert!(!regions::shutdown());
}

#[test]
#[serial]
fn mapping_and_point_queries() {
    regions::init(16);
    regions::record_mapping(0x10_0000, 0x8000, &[0xaa, 0xbb]);
    let r = regions::find_region(0x10_4000).unwrap();
    assert_eq!(r.start, 0x10_0000);
    assert_eq!(r.end, 0x10_8000);
    assert_eq!(r.call_stack(), &[0xaa, 0xbb]);
    // first and last byte are inside, the end is not
    assert!(regions::find_region(0x10_0000).is_some());
    assert!(regions::find_region(0x10_7fff).is_some());
    assert!(regions::find_region(0x10_8000).is_none());
    assert!(regions::shutdown());
}

#[test]
#[serial]
fn subset_remapping_changes_nothing() {
    regions::init(16);
    regions::record_mapping(0x20_0000, 0x10000, &[0x1]);
    let before = regions::tracked_bytes();
    // reservation-style re-commit of an interior piece
    regions::record_mapping(0x20_2000, 0x2000, &[0x2]);
    assert_eq!(regions::tracked_bytes(), before);
    let usage = regions::cumulative_usage();
    assert_eq!(usage.mapped_bytes, 0x10000);
    assert!(regions::shutdown());
}

#[test]
#[serial]
fn partial_unmapping_splits_the_region() {
    regions::init(16);
    regions::record_mapping(0x30_0000, 0x8000, &[0x1]);
    regions::record_unmapping(0x30_2000, 0x2000);
    assert!(regions::find_region(0x30_1000).is_some());
    assert!(regions::find_region(0x30_2800).is_none());
    assert!(regions::find_region(0x30_5000).is_some());
    // head keeps [0x30_0000, 0x30_2000), tail keeps [0x30_4000, 0x30_8000)
    assert_eq!(regions::tracked_bytes(), 0x8000 - 0x2000);
    assert!(regions::shutdown());
}

#[test]
#[serial]
fn unmapping_spanning_many_regions() {
    regions::init(16);
    regions::record_mapping(0x40_0000, 0x1000, &[0x1]);
    regions::record_mapping(0x40_2000, 0x1000, &[0x2]);
    regions::record_mapping(0x40_4000, 0x1000, &[0x3]);
    // covers the tail of none, all of the middle, and is oblivious to
    // the untracked gaps in between
    regions::record_unmapping(0x40_1000, 0x3000);
    assert!(regions::find_region(0x40_0800).is_some());
    assert!(regions::find_region(0x40_2800).is_none());
    assert!(regions::find_region(0x40_4800).is_some());
    assert!(regions::shutdown());
}

#[test]
#[serial]
fn tracked_bytes_equal_mapped_minus_unmapped() {
    regions::init(16);
    regions::record_mapping(0x50_0000, 0x4000, &[0x1]);
    regions::record_mapping(0x51_0000, 0x2000, &[0x2]);
    regions::record_unmapping(0x50_1000, 0x1000);
    regions::record_unmapping(0x51_0000, 0x2000);
    let usage = regions::cumulative_usage();
    assert_eq!(usage.mapped_bytes, 0x6000);
    assert_eq!(usage.unmapped_bytes, 0x3000);
    assert_eq!(
        regions::tracked_bytes() as u64,
        usage.mapped_bytes - usage.unmapped_bytes
    );
    assert!(regions::shutdown());
}

#[test]
#[serial]
fn remapping_moves_the_span() {
    regions::init(16);
    regions::record_mapping(0x60_0000, 0x2000, &[0x1]);
    regions::record_remapping(0x60_0000, 0x2000, 0x61_0000, 0x4000, &[0x1]);
    assert!(regions::find_region(0x60_1000).is_none());
    let r = regions::find_region(0x61_2000).unwrap();
    assert_eq!(r.size(), 0x4000);
    assert!(regions::shutdown());
}

#[test]
#[serial]
fn usage_is_attributed_to_creation_stacks() {
    regions::init(16);
    regions::record_mapping(0x70_0000, 0x1000, &[0x100]);
    regions::record_mapping(0x71_0000, 0x3000, &[0x200]);
    // unmapping half of the second region charges its creation stack
    regions::record_unmapping(0x71_0000, 0x1800);
    let by_stack = regions::usage_by_stack().unwrap();
    let first = heaptrace::core::types::hash_stack(&[0x100]);
    let second = heaptrace::core::types::hash_stack(&[0x200]);
    let get = |h| {
        by_stack
            .iter()
            .find(|(hash, _)| *hash == h)
            .map(|(_, u)| *u)
            .unwrap()
    };
    assert_eq!(get(first).mapped_bytes, 0x1000);
    assert_eq!(get(first).unmapped_bytes, 0);
    assert_eq!(get(second).mapped_bytes, 0x3000);
    assert_eq!(get(second).unmapped_bytes, 0x1800);
    assert!(regions::shutdown());
}

#[test]
#[serial]
fn stack_region_marking() {
    regions::init(16);
    regions::record_mapping(0x80_0000, 0x4000, &[]);
    let r = regions::find_and_mark_stack_region(0x80_3000).unwrap();
    assert!(r.is_stack);
    assert_eq!(r.start, 0x80_0000);
    // the mark persists on the tracked region
    let again = regions::find_region(0x80_3000).unwrap();
    assert!(again.is_stack);
    assert!(regions::shutdown());
}

#[test]
#[serial]
fn events_during_iteration_become_visible_on_return() {
    regions::init(16);
    regions::record_mapping(0xa0_0000, 0x1000, &[0x1]);
    // events arriving while the region set is locked for iteration are
    // staged; both must land before any later query runs
    let iterated = regions::with_regions(|_| {
        regions::record_mapping(0xa1_0000, 0x1000, &[0x2]);
        regions::record_unmapping(0xa0_0000, 0x1000);
    });
    assert!(iterated.is_some());
    assert!(regions::find_region(0xa0_0800).is_none());
    let r = regions::find_region(0xa1_0800).unwrap();
    assert_eq!(r.start, 0xa1_0000);
    assert_eq!(regions::tracked_bytes(), 0x1000);
    assert!(regions::shutdown());
}

#[test]
#[serial]
fn init_is_reference_counted() {
    regions::init(16);
    regions::init(16);
    regions::record_mapping(0x90_0000, 0x1000, &[]);
    assert!(regions::shutdown());
    // still active after the first shutdown
    assert!(regions::is_active());
    assert!(regions::find_region(0x90_0800).is_some());
    assert!(regions::shutdown());
    assert!(!regions::is_active());
}
