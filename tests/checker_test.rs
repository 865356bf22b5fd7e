/*!
 * Leak Checker Tests
 * End-to-end conservative leak detection against live heap objects
 */

use heaptrace::checker::{ExplicitRoots, LeakChecker};
use heaptrace::core::types::WORD_SIZE;
use heaptrace::{AllocationTable, CheckConfig, LeakAction, TraceError};
use pretty_assertions::assert_eq;
use serial_test::serial;

fn quiet_config() -> CheckConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    CheckConfig::default()
        .with_scan_globals(false)
        .with_on_leak(LeakAction::Report)
}

#[test]
#[serial]
fn overwritten_pointer_is_reported_reachable_one_is_not() {
    let table = AllocationTable::new();

    // the slot is the only root; it must be registered before arming
    let mut slot: usize = 0;
    let slot_addr = &mut slot as *mut usize as usize;
    let mut checker = LeakChecker::new("scenario-overwrite", &table, quiet_config());
    checker.add_root_source(Box::new(
        ExplicitRoots::new().with(slot_addr, slot_addr + WORD_SIZE),
    ));
    checker.arm().unwrap();

    // kept: reachable through the slot for the whole check
    let kept: Box<[u8; 100]> = Box::new([0; 100]);
    let kept_addr = kept.as_ptr() as usize;
    table.record(kept_addr, 100, &[0x1111, 0x1112]);

    // lost: recorded, then its only pointer is overwritten
    let lost: Box<[u8; 50]> = Box::new([0; 50]);
    let lost_addr = lost.as_ptr() as usize;
    table.record(lost_addr, 50, &[0x2222, 0x2223]);

    unsafe {
        let p = slot_addr as *mut usize;
        p.write_volatile(lost_addr);
        // the overwrite: the only reference to `lost` disappears
        p.write_volatile(kept_addr);
    }

    let report = checker.check().unwrap();

    assert_eq!(report.leaked_objects, 1);
    assert_eq!(report.leaked_bytes, 50);
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].stack, vec![0x2222, 0x2223]);
    assert_eq!(checker.leaked_bytes(), Some(50));
    assert_eq!(checker.leaked_objects(), Some(1));
    drop((kept, lost));
}

#[test]
#[serial]
fn unreachable_cycle_leaks_both_nodes() {
    let table = AllocationTable::new();
    let mut checker = LeakChecker::new("scenario-cycle", &table, quiet_config());
    checker.arm().unwrap();

    // two nodes pointing at each other, reachable from nowhere
    let mut a: Box<[usize; 4]> = Box::new([0; 4]);
    let mut b: Box<[usize; 4]> = Box::new([0; 4]);
    let a_addr = a.as_ptr() as usize;
    let b_addr = b.as_ptr() as usize;
    a[0] = b_addr;
    b[0] = a_addr;
    table.record(a_addr, 32, &[0xa]);
    table.record(b_addr, 32, &[0xb]);

    let report = checker.check().unwrap();

    assert_eq!(report.leaked_objects, 2);
    assert_eq!(report.leaked_bytes, 64);
    drop((a, b));
}

#[test]
#[serial]
fn cycle_held_by_a_root_is_fully_live() {
    let table = AllocationTable::new();
    let mut slot: usize = 0;
    let slot_addr = &mut slot as *mut usize as usize;
    let mut checker = LeakChecker::new("rooted-cycle", &table, quiet_config());
    checker.add_root_source(Box::new(
        ExplicitRoots::new().with(slot_addr, slot_addr + WORD_SIZE),
    ));
    checker.arm().unwrap();

    let mut a: Box<[usize; 4]> = Box::new([0; 4]);
    let mut b: Box<[usize; 4]> = Box::new([0; 4]);
    let a_addr = a.as_ptr() as usize;
    let b_addr = b.as_ptr() as usize;
    a[0] = b_addr;
    b[0] = a_addr;
    table.record(a_addr, 32, &[0xa]);
    table.record(b_addr, 32, &[0xb]);

    // rooting either node keeps the whole cycle
    unsafe { (slot_addr as *mut usize).write_volatile(a_addr) };
    let report = checker.check().unwrap();
    assert_eq!(report.leaked_objects, 0);
    drop((a, b));
}

#[test]
#[serial]
fn scoped_window_ignores_earlier_garbage() {
    let table = AllocationTable::new();
    let old: Box<u64> = Box::new(1);
    let old_addr = &*old as *const u64 as usize;
    table.record(old_addr, 8, &[0x1]);

    let mut checker = LeakChecker::new("window", &table, quiet_config());
    checker.arm().unwrap();

    let fresh: Box<u64> = Box::new(2);
    let fresh_addr = &*fresh as *const u64 as usize;
    table.record(fresh_addr, 8, &[0x2]);

    let report = checker.check_and_enforce().unwrap();
    assert_eq!(report.leaked_objects, 1);
    assert_eq!(report.entries[0].stack, vec![0x2]);
    drop((old, fresh));
}

#[test]
#[serial]
fn whole_program_checker_is_single_use() {
    let table = AllocationTable::new();
    let mut checker = LeakChecker::whole_program(&table, quiet_config()).unwrap();
    assert!(matches!(
        LeakChecker::whole_program(&table, quiet_config()),
        Err(TraceError::WholeProgramCheckerExists)
    ));
    checker.arm().unwrap();
    let report = checker.check().unwrap();
    assert_eq!(report.leaked_objects, 0);
}

#[test]
#[serial]
fn trusted_code_allocations_anchor_their_referents() {
    let table = AllocationTable::new();
    let config = quiet_config().with_trusted_range(0x7000_0000, 0x7000_1000);
    let mut checker = LeakChecker::new("trusted", &table, config);
    checker.arm().unwrap();

    let mut holder: Box<[usize; 2]> = Box::new([0; 2]);
    let target: Box<u64> = Box::new(9);
    let target_addr = &*target as *const u64 as usize;
    holder[0] = target_addr;
    let holder_addr = holder.as_ptr() as usize;
    // the holder was allocated from a trusted code range; the target
    // has an ordinary stack
    table.record(holder_addr, 16, &[0x7000_0010]);
    table.record(target_addr, 8, &[0x9999]);

    let report = checker.check().unwrap();
    assert_eq!(report.leaked_objects, 0);
    drop((holder, target));
}
