/*!
 * Region Tracker
 * Records every virtual-memory region creation and destruction
 *
 * The bootstrap problem: installing tracking requires backing memory,
 * whose acquisition can itself trigger the very mapping events being
 * tracked, before the ordered structure exists. While the re-entrancy
 * depth is above zero, events land in a small fixed static staging
 * buffer; as the outermost lock level is released, every staged entry
 * is replayed into the real structure, still under the lock, so no
 * caller can observe a staged event once the triggering call has
 * unwound. Replay terminates because backing memory arrives in large
 * amortizing chunks.
 *
 * Locking is one process-wide re-entrant spin lock: an explicit
 * (owner, depth) pair guarded by a raw spin lock, never a blocking OS
 * mutex, so the tracker stays safe inside allocation hooks and signal
 * contexts.
 */

use crate::core::sync::ReentrantSpinLock;
use crate::core::types::{hash_stack, Address, Size, StackHash, MAX_STACK_DEPTH};
use crate::fatal;
use ahash::AHashMap;
use std::cell::UnsafeCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One contiguous span of virtual address space from a single mapping
/// or growth event
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub start: Address,
    pub end: Address,
    /// Set lazily by [`find_and_mark_stack_region`]
    pub is_stack: bool,
    stack_depth: usize,
    call_stack: [Address; MAX_STACK_DEPTH],
}

impl Region {
    fn new(start: Address, end: Address, stack: &[Address], max_depth: usize) -> Self {
        let mut call_stack = [0; MAX_STACK_DEPTH];
        let depth = stack.len().min(max_depth).min(MAX_STACK_DEPTH);
        call_stack[..depth].copy_from_slice(&stack[..depth]);
        Self {
            start,
            end,
            is_stack: false,
            stack_depth: depth,
            call_stack,
        }
    }

    pub fn size(&self) -> Size {
        self.end - self.start
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Bounded-depth creation call stack
    pub fn call_stack(&self) -> &[Address] {
        &self.call_stack[..self.stack_depth]
    }

    pub fn stack_hash(&self) -> StackHash {
        hash_stack(self.call_stack())
    }
}

/// Cumulative mapped/unmapped byte totals for one creation call stack
///
/// Counts live-set deltas: a subset insertion (reservation-style
/// remapping of an already-tracked span) changes nothing, so tracked
/// bytes always equal mapped minus unmapped.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub mapped_bytes: u64,
    pub unmapped_bytes: u64,
}

#[derive(Clone, Copy)]
enum PendingEvent {
    Insert(Region),
    Remove { start: Address, end: Address },
}

/// Staged events are few: only mapping activity triggered by the
/// tracker's own backing growth lands here
const STAGING_CAPACITY: usize = 128;

struct TrackerState {
    refcount: usize,
    max_depth: usize,
    /// Ordered by end address for O(log n) point and interval queries
    regions: Option<BTreeMap<Address, Region>>,
    usage: Option<AHashMap<StackHash, UsageTotals>>,
    staging: [Option<PendingEvent>; STAGING_CAPACITY],
    staged: usize,
}

struct TrackerShared {
    lock: ReentrantSpinLock,
    state: UnsafeCell<TrackerState>,
}

unsafe impl Sync for TrackerShared {}

static TRACKER: TrackerShared = TrackerShared {
    lock: ReentrantSpinLock::new(),
    state: UnsafeCell::new(TrackerState {
        refcount: 0,
        max_depth: MAX_STACK_DEPTH,
        regions: None,
        usage: None,
        staging: [None; STAGING_CAPACITY],
        staged: 0,
    }),
};

/// One level of the tracker lock
///
/// Dropping the outermost level replays everything reentrant calls
/// staged, before the lock is released, so the staging buffer is empty
/// whenever the lock is free.
struct TrackerGuard {
    depth: usize,
}

impl TrackerGuard {
    fn acquire() -> Self {
        Self {
            depth: TRACKER.lock.lock(),
        }
    }

    fn state(&self) -> *mut TrackerState {
        TRACKER.state.get()
    }
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        if self.depth == 1 {
            unsafe { drain(TRACKER.state.get()) };
        }
        TRACKER.lock.unlock();
    }
}

/// Start tracking, or add a reference if already running
///
/// Reference-counted across clients; the first call decides the
/// recorded stack depth.
pub fn init(max_stack_depth: usize) {
    let guard = TrackerGuard::acquire();
    let st = guard.state();
    unsafe {
        if (*st).refcount == 0 {
            (*st).max_depth = max_stack_depth.min(MAX_STACK_DEPTH);
            (*st).regions = Some(BTreeMap::new());
            (*st).usage = Some(AHashMap::new());
            (*st).staged = 0;
            log::info!(
                "region tracker started (stack depth {})",
                (*st).max_depth
            );
        }
        (*st).refcount += 1;
    }
}

/// Drop one reference; the last one releases all tracking state
///
/// Returns false when called without a matching `init`.
pub fn shutdown() -> bool {
    let guard = TrackerGuard::acquire();
    let st = guard.state();
    unsafe {
        if (*st).refcount == 0 {
            log::warn!("region tracker shutdown without matching init");
            false
        } else {
            (*st).refcount -= 1;
            if (*st).refcount == 0 {
                let count = (&(*st).regions).as_ref().map_or(0, |m| m.len());
                (*st).regions = None;
                (*st).usage = None;
                (*st).staged = 0;
                log::info!("region tracker stopped ({count} regions released)");
            }
            true
        }
    }
}

pub fn is_active() -> bool {
    let guard = TrackerGuard::acquire();
    unsafe { (*guard.state()).refcount > 0 }
}

/// Record a mapping event (mmap, growth) exactly once
pub fn record_mapping(start: Address, len: Size, stack: &[Address]) {
    if len == 0 {
        return;
    }
    let guard = TrackerGuard::acquire();
    let st = guard.state();
    unsafe {
        if (&(*st).regions).is_some() {
            let region = Region::new(start, start + len, stack, (*st).max_depth);
            dispatch(st, guard.depth, PendingEvent::Insert(region));
        }
    }
}

/// Record an unmapping event exactly once; removing an untracked or
/// partially tracked range affects only the tracked parts
pub fn record_unmapping(start: Address, len: Size) {
    if len == 0 {
        return;
    }
    let guard = TrackerGuard::acquire();
    let st = guard.state();
    unsafe {
        if (&(*st).regions).is_some() {
            dispatch(
                st,
                guard.depth,
                PendingEvent::Remove {
                    start,
                    end: start + len,
                },
            );
        }
    }
}

/// Record a move/resize as an unmapping of the old span and a mapping
/// of the new one
pub fn record_remapping(
    old_start: Address,
    old_len: Size,
    new_start: Address,
    new_len: Size,
    stack: &[Address],
) {
    record_unmapping(old_start, old_len);
    record_mapping(new_start, new_len, stack);
}

/// Region containing `addr`, if tracking is active and one is tracked
pub fn find_region(addr: Address) -> Option<Region> {
    let guard = TrackerGuard::acquire();
    let st = guard.state();
    unsafe {
        (&(*st).regions).as_ref().and_then(|map| {
            map.range((addr + 1)..)
                .next()
                .map(|(_, r)| *r)
                .filter(|r| r.contains(addr))
        })
    }
}

/// Find the region holding a thread's stack top and flag it as a stack
pub fn find_and_mark_stack_region(top: Address) -> Option<Region> {
    let guard = TrackerGuard::acquire();
    let st = guard.state();
    unsafe {
        (&mut (*st).regions).as_mut().and_then(|map| {
            let r = map
                .range_mut((top + 1)..)
                .next()
                .map(|(_, r)| r)
                .filter(|r| r.contains(top))?;
            r.is_stack = true;
            Some(*r)
        })
    }
}

/// Ordered iteration over all tracked regions under the held lock
pub fn with_regions<R>(f: impl FnOnce(&mut dyn Iterator<Item = &Region>) -> R) -> Option<R> {
    let guard = TrackerGuard::acquire();
    let st = guard.state();
    unsafe {
        (&(*st).regions).as_ref().map(|map| {
            let mut iter = map.values();
            f(&mut iter)
        })
    }
}

/// Cumulative per-creation-stack usage, independent of the live set
pub fn usage_by_stack() -> Option<Vec<(StackHash, UsageTotals)>> {
    let guard = TrackerGuard::acquire();
    let st = guard.state();
    unsafe {
        (&(*st).usage)
            .as_ref()
            .map(|u| u.iter().map(|(k, v)| (*k, *v)).collect())
    }
}

/// Aggregate cumulative totals across all creation stacks
pub fn cumulative_usage() -> UsageTotals {
    usage_by_stack()
        .unwrap_or_default()
        .iter()
        .fold(UsageTotals::default(), |mut acc, (_, u)| {
            acc.mapped_bytes += u.mapped_bytes;
            acc.unmapped_bytes += u.unmapped_bytes;
            acc
        })
}

/// Total bytes currently tracked
pub fn tracked_bytes() -> Size {
    with_regions(|iter| iter.map(|r| r.size()).sum()).unwrap_or(0)
}

/// Route an event: apply directly at the outermost level, stage on
/// reentry. Staged events replay when the outermost lock level drops.
///
/// # Safety
/// Caller holds the tracker lock at the given depth.
unsafe fn dispatch(st: *mut TrackerState, depth: usize, event: PendingEvent) {
    if depth > 1 {
        stage(st, event);
    } else {
        apply(st, event);
    }
}

/// Replay staged events in arrival order. Replaying can stage more,
/// but each round consumes backing memory in large chunks, so the loop
/// terminates.
///
/// # Safety
/// Caller holds the tracker lock at depth one.
unsafe fn drain(st: *mut TrackerState) {
    while (*st).staged > 0 {
        let next = (&mut (*st).staging[0]).take();
        for i in 1..(*st).staged {
            (*st).staging[i - 1] = (&mut (*st).staging[i]).take();
        }
        (*st).staged -= 1;
        if let Some(ev) = next {
            apply(st, ev);
        }
    }
}

unsafe fn stage(st: *mut TrackerState, event: PendingEvent) {
    if (*st).staged >= STAGING_CAPACITY {
        fatal!(
            "regions",
            "staging buffer overflow ({STAGING_CAPACITY} events): unbounded hook recursion"
        );
    }
    let slot = (*st).staged;
    (*st).staging[slot] = Some(event);
    (*st).staged += 1;
}

unsafe fn apply(st: *mut TrackerState, event: PendingEvent) {
    match event {
        PendingEvent::Insert(region) => apply_insert(st, region),
        PendingEvent::Remove { start, end } => apply_remove(st, start, end),
    }
}

unsafe fn apply_insert(st: *mut TrackerState, region: Region) {
    let Some(map) = (&mut (*st).regions).as_mut() else {
        return;
    };
    if let Some((_, existing)) = map.range((region.start + 1)..).next() {
        if existing.start < region.end {
            // Overlap. A region wholly inside an existing one is a
            // reservation-style remap and a no-op; anything else means
            // the tracked picture is wrong.
            if existing.start <= region.start && region.end <= existing.end {
                return;
            }
            fatal!(
                "regions",
                "overlapping regions: inserting [{:#x}, {:#x}) over [{:#x}, {:#x})",
                region.start,
                region.end,
                existing.start,
                existing.end
            );
        }
    }
    let hash = region.stack_hash();
    let size = region.size() as u64;
    map.insert(region.end, region);
    if let Some(usage) = (&mut (*st).usage).as_mut() {
        usage.entry(hash).or_default().mapped_bytes += size;
    }
}

unsafe fn apply_remove(st: *mut TrackerState, start: Address, end: Address) {
    let Some(map) = (&mut (*st).regions).as_mut() else {
        return;
    };
    let mut removed_keys: Vec<Address> = Vec::new();
    let mut reinsert: Vec<Region> = Vec::new();
    let mut unmapped: Vec<(StackHash, u64)> = Vec::new();
    for (&key, r) in map.range((start + 1)..) {
        if r.start >= end {
            break;
        }
        let overlap_start = r.start.max(start);
        let overlap_end = r.end.min(end);
        unmapped.push((r.stack_hash(), (overlap_end - overlap_start) as u64));
        removed_keys.push(key);
        if r.start < start {
            // keep the head
            let mut head = *r;
            head.end = start;
            reinsert.push(head);
        }
        if end < r.end {
            // keep the tail
            let mut tail = *r;
            tail.start = end;
            reinsert.push(tail);
        }
    }
    for key in removed_keys {
        map.remove(&key);
    }
    for r in reinsert {
        map.insert(r.end, r);
    }
    if let Some(usage) = (&mut (*st).usage).as_mut() {
        for (hash, bytes) in unmapped {
            usage.entry(hash).or_default().unmapped_bytes += bytes;
        }
    }
}
