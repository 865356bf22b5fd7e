/*!
 * Allocation Table
 * Per-allocation metadata: the substrate for profiling and leak checks
 *
 * Records are keyed by address through an AddressClusterMap backed by a
 * dedicated bootstrap arena, so the table itself never touches the
 * allocator it is tracking. Full call stacks are not duplicated per
 * allocation: each record points at a stack-trace bucket aggregating
 * counts and byte totals for one unique stack hash. Buckets are never
 * freed while the table lives, so bucket references cannot dangle.
 */

mod profile;
mod snapshot;

pub use snapshot::{LeakEntry, Snapshot};

use crate::bootstrap::{Arena, ArenaFlags};
use crate::cluster::AddressClusterMap;
use crate::core::sync::SpinLock;
use crate::core::types::{hash_stack, Address, Size, StackHash, MAX_STACK_DEPTH};
use std::mem::ManuallyDrop;
use std::ptr;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Aggregate statistics for one unique call stack
#[repr(C)]
pub(crate) struct Bucket {
    hash: StackHash,
    depth: usize,
    stack: [Address; MAX_STACK_DEPTH],
    allocs: u64,
    frees: u64,
    alloc_bytes: u64,
    free_bytes: u64,
    next: *mut Bucket,
}

impl Bucket {
    pub(crate) fn stack(&self) -> &[Address] {
        &self.stack[..self.depth]
    }

    pub(crate) fn hash(&self) -> StackHash {
        self.hash
    }

    fn live_count(&self) -> u64 {
        self.allocs - self.frees
    }

    fn live_bytes(&self) -> u64 {
        self.alloc_bytes - self.free_bytes
    }
}

/// Chained hash table of buckets, arena-allocated
const BUCKET_TABLE_SIZE: usize = 4093;

/// One tracked allocation
///
/// The live and ignore flags are ordinary bools; packing them into
/// spare pointer bits would change nothing observable.
#[derive(Clone, Copy)]
struct AllocRecord {
    size: Size,
    bucket: *mut Bucket,
    live: bool,
    ignore: bool,
}

/// Details of one tracked allocation, for external consumption
#[derive(Debug, Clone)]
pub struct AllocationInfo {
    pub size: Size,
    pub live: bool,
    pub ignored: bool,
    pub stack: Vec<Address>,
    pub stack_hash: StackHash,
}

/// Running table totals
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TableStats {
    pub alloc_count: u64,
    pub alloc_bytes: u64,
    pub free_count: u64,
    pub free_bytes: u64,
}

impl TableStats {
    pub fn outstanding_count(&self) -> u64 {
        self.alloc_count - self.free_count
    }

    pub fn outstanding_bytes(&self) -> u64 {
        self.alloc_bytes - self.free_bytes
    }
}

pub(crate) struct TableInner {
    arena: Arena,
    map: ManuallyDrop<AddressClusterMap<AllocRecord, Arena>>,
    bucket_table: *mut [*mut Bucket; BUCKET_TABLE_SIZE],
    bucket_count: usize,
    stats: TableStats,
    // Conservative-scan bounds; they only ever widen
    min_addr: Address,
    max_addr: Address,
    max_object: Size,
}

unsafe impl Send for TableInner {}

/// Address-keyed allocation metadata table
pub struct AllocationTable {
    inner: SpinLock<TableInner>,
}

static GLOBAL_TABLE: OnceLock<AllocationTable> = OnceLock::new();

impl AllocationTable {
    pub fn new() -> Self {
        let arena = Arena::new(ArenaFlags::default(), None);
        let map = AddressClusterMap::new(arena);
        let bucket_table = arena.alloc(std::mem::size_of::<[*mut Bucket; BUCKET_TABLE_SIZE]>())
            as *mut [*mut Bucket; BUCKET_TABLE_SIZE];
        unsafe {
            (&mut *bucket_table).fill(ptr::null_mut());
        }
        Self {
            inner: SpinLock::new(TableInner {
                arena,
                map: ManuallyDrop::new(map),
                bucket_table,
                bucket_count: 0,
                stats: TableStats::default(),
                min_addr: Address::MAX,
                max_addr: 0,
                max_object: 0,
            }),
        }
    }

    /// Process-wide table fed by the allocation hooks
    pub fn global() -> &'static AllocationTable {
        GLOBAL_TABLE.get_or_init(AllocationTable::new)
    }

    /// Record an allocation; an existing record at `ptr` is replaced,
    /// consistent with allocator address reuse (the missed free is
    /// folded into the old record's bucket)
    pub fn record(&self, ptr: Address, size: Size, stack: &[Address]) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.map.find(ptr) {
            inner.stats.free_count += 1;
            inner.stats.free_bytes += old.size as u64;
            unsafe {
                (*old.bucket).frees += 1;
                (*old.bucket).free_bytes += old.size as u64;
            }
        }
        let bucket = inner.intern_bucket(stack);
        unsafe {
            (*bucket).allocs += 1;
            (*bucket).alloc_bytes += size as u64;
        }
        inner.stats.alloc_count += 1;
        inner.stats.alloc_bytes += size as u64;
        inner.min_addr = inner.min_addr.min(ptr);
        inner.max_addr = inner.max_addr.max(ptr + size);
        inner.max_object = inner.max_object.max(size);
        inner.map.insert(
            ptr,
            AllocRecord {
                size,
                bucket,
                live: false,
                ignore: false,
            },
        );
    }

    /// Record a free; silently ignores untracked pointers
    pub fn record_free(&self, ptr: Address) {
        let mut inner = self.inner.lock();
        if let Some(rec) = inner.map.find_and_remove(ptr) {
            inner.stats.free_count += 1;
            inner.stats.free_bytes += rec.size as u64;
            unsafe {
                (*rec.bucket).frees += 1;
                (*rec.bucket).free_bytes += rec.size as u64;
            }
        }
    }

    /// Size of the allocation starting exactly at `ptr`
    pub fn find_allocation(&self, ptr: Address) -> Option<Size> {
        self.inner.lock().map.find(ptr).map(|r| r.size)
    }

    pub fn find_allocation_details(&self, ptr: Address) -> Option<AllocationInfo> {
        let inner = self.inner.lock();
        inner.map.find(ptr).map(|r| unsafe {
            AllocationInfo {
                size: r.size,
                live: r.live,
                ignored: r.ignore,
                stack: (&*r.bucket).stack().to_vec(),
                stack_hash: (*r.bucket).hash,
            }
        })
    }

    /// Allocation whose `[base, base + size)` range contains `ptr`
    ///
    /// Interior pointers arise from array headers, sub-object layouts
    /// and similar offsets; the backward search is bounded by
    /// `max_size`, the largest object size worth considering.
    pub fn find_inside_allocation(&self, ptr: Address, max_size: Size) -> Option<(Address, Size)> {
        let inner = self.inner.lock();
        inner
            .map
            .find_inside(|r| r.size, max_size, ptr)
            .map(|(base, r)| (base, r.size))
    }

    /// Mark the allocation at `ptr` live; true iff it was newly marked
    pub fn mark_live(&self, ptr: Address) -> bool {
        let mut inner = self.inner.lock();
        match inner.map.find_mut(ptr) {
            Some(rec) if !rec.live => {
                rec.live = true;
                true
            }
            _ => false,
        }
    }

    /// Permanently exclude the allocation at `ptr` from leak reports
    pub fn mark_ignored(&self, ptr: Address) {
        let mut inner = self.inner.lock();
        if let Some(rec) = inner.map.find_mut(ptr) {
            rec.ignore = true;
        }
    }

    /// Clear every live flag; each check starts from a clean sweep
    pub fn unmark_all_live(&self) {
        let mut inner = self.inner.lock();
        inner.map.iterate(|_, rec| rec.live = false);
    }

    /// Exact-or-interior resolution for the reachability flood: marks
    /// the owning allocation live and returns its extent, or None when
    /// the value resolves to nothing new
    pub(crate) fn flood_resolve(&self, value: Address, max_size: Size) -> Option<(Address, Size)> {
        let mut inner = self.inner.lock();
        let (base, rec) = match inner.map.find(value) {
            Some(rec) => (value, rec),
            None => inner.map.find_inside(|r| r.size, max_size, value)?,
        };
        if rec.live {
            return None;
        }
        if let Some(rec) = inner.map.find_mut(base) {
            rec.live = true;
        }
        Some((base, rec.size))
    }

    /// Extents of allocations that count as roots themselves: every
    /// ignored record, plus records whose leading stack frames fall in
    /// a trusted code range. All of them are marked live here so only
    /// their contents remain to scan.
    pub(crate) fn collect_object_roots(
        &self,
        trusted_ranges: &[(Address, Address)],
        trusted_depth: usize,
    ) -> Vec<(Address, Size)> {
        let mut roots = Vec::new();
        let mut inner = self.inner.lock();
        inner.map.iterate(|base, rec| {
            let trusted = !rec.ignore
                && !trusted_ranges.is_empty()
                && unsafe { (&*rec.bucket).stack() }
                    .iter()
                    .take(trusted_depth)
                    .any(|f| trusted_ranges.iter().any(|(s, e)| (*s..*e).contains(f)));
            if rec.ignore || trusted {
                rec.live = true;
                roots.push((base, rec.size));
            }
        });
        roots
    }

    /// (lowest tracked address, highest tracked end, largest object)
    pub(crate) fn heap_bounds(&self) -> (Address, Address, Size) {
        let inner = self.inner.lock();
        (inner.min_addr, inner.max_addr, inner.max_object)
    }

    pub fn stats(&self) -> TableStats {
        self.inner.lock().stats
    }

    pub fn outstanding_count(&self) -> u64 {
        self.stats().outstanding_count()
    }

    pub fn outstanding_bytes(&self) -> u64 {
        self.stats().outstanding_bytes()
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut TableInner) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner)
    }
}

impl Default for AllocationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AllocationTable {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        unsafe {
            // Buckets and the bucket table go back to the arena first,
            // then the record map releases its chunks, and the arena
            // unmaps everything in one pass.
            for slot in 0..BUCKET_TABLE_SIZE {
                let mut b = (*inner.bucket_table)[slot];
                while !b.is_null() {
                    let next = (*b).next;
                    Arena::free(b as *mut u8);
                    b = next;
                }
            }
            Arena::free(inner.bucket_table as *mut u8);
            ManuallyDrop::drop(&mut inner.map);
        }
        if !inner.arena.delete() {
            log::warn!("allocation table arena not fully released on drop");
        }
    }
}

impl TableInner {
    /// Find or create the bucket for a call stack
    fn intern_bucket(&mut self, stack: &[Address]) -> *mut Bucket {
        let depth = stack.len().min(MAX_STACK_DEPTH);
        let stack = &stack[..depth];
        let hash = hash_stack(stack);
        let slot = (hash % BUCKET_TABLE_SIZE as u64) as usize;
        unsafe {
            let mut b = (*self.bucket_table)[slot];
            while !b.is_null() {
                if (*b).hash == hash && (&*b).stack() == stack {
                    return b;
                }
                b = (*b).next;
            }
            let b = self.arena.alloc(std::mem::size_of::<Bucket>()) as *mut Bucket;
            (*b).hash = hash;
            (*b).depth = depth;
            (*b).stack = [0; MAX_STACK_DEPTH];
            (&mut (*b).stack)[..depth].copy_from_slice(stack);
            (*b).allocs = 0;
            (*b).frees = 0;
            (*b).alloc_bytes = 0;
            (*b).free_bytes = 0;
            (*b).next = (*self.bucket_table)[slot];
            (*self.bucket_table)[slot] = b;
            self.bucket_count += 1;
            b
        }
    }

    /// Visit every bucket
    pub(crate) fn for_each_bucket(&self, mut f: impl FnMut(&Bucket)) {
        unsafe {
            for slot in 0..BUCKET_TABLE_SIZE {
                let mut b = (*self.bucket_table)[slot];
                while !b.is_null() {
                    f(&*b);
                    b = (*b).next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_free_balance() {
        let table = AllocationTable::new();
        let stack = [0x1111usize, 0x2222];
        table.record(0x7000_0000, 100, &stack);
        table.record(0x7000_1000, 50, &stack);
        assert_eq!(table.outstanding_count(), 2);
        assert_eq!(table.outstanding_bytes(), 150);
        table.record_free(0x7000_0000);
        assert_eq!(table.outstanding_count(), 1);
        assert_eq!(table.outstanding_bytes(), 50);
        // untracked free is a silent no-op
        table.record_free(0xdead_beef);
        assert_eq!(table.outstanding_count(), 1);
    }

    #[test]
    fn overwrite_on_address_reuse() {
        let table = AllocationTable::new();
        table.record(0x7000_0000, 100, &[0x1]);
        table.record(0x7000_0000, 64, &[0x2]);
        assert_eq!(table.find_allocation(0x7000_0000), Some(64));
        assert_eq!(table.outstanding_count(), 1);
        assert_eq!(table.outstanding_bytes(), 64);
    }

    #[test]
    fn interior_lookup() {
        let table = AllocationTable::new();
        table.record(0x7000_0000, 256, &[0x1]);
        assert_eq!(
            table.find_inside_allocation(0x7000_00ff, 4096),
            Some((0x7000_0000, 256))
        );
        assert_eq!(table.find_inside_allocation(0x7000_0100, 4096), None);
    }

    #[test]
    fn live_marking() {
        let table = AllocationTable::new();
        table.record(0x7000_0000, 8, &[0x1]);
        assert!(table.mark_live(0x7000_0000));
        assert!(!table.mark_live(0x7000_0000));
        assert!(!table.mark_live(0x9999_9999));
        table.unmark_all_live();
        assert!(table.mark_live(0x7000_0000));
    }
}
