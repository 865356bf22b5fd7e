/*!
 * Event Hooks
 * Single entry point for allocation and mapping events
 *
 * Allocator integrations call these free functions; they fan out to the
 * global allocation table and the region tracker. A process-wide kill
 * switch stops all recording once an untrackable operation (such as
 * launching the symbolizer) has happened.
 */

use crate::core::types::{Address, Size};
use crate::regions;
use crate::table::AllocationTable;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::alloc::{GlobalAlloc, Layout};

static MONITORING: AtomicBool = AtomicBool::new(true);

thread_local! {
    // Set while a hook is already running on this thread; recording
    // may itself allocate through the wrapped allocator.
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
    static DISABLED_SCOPES: Cell<usize> = const { Cell::new(0) };
}

/// Whether events are still being recorded
#[inline]
pub fn monitoring_enabled() -> bool {
    MONITORING.load(Ordering::Acquire)
}

/// Permanently stop recording events
///
/// One way: after an operation whose own allocations cannot be tracked,
/// the table would drift from reality, so recording never resumes.
pub fn disable_monitoring() {
    if MONITORING.swap(false, Ordering::AcqRel) {
        log::warn!("allocation monitoring disabled; no further events will be recorded");
    }
}

/// Record a heap allocation at `ptr` of `size` bytes
pub fn record_alloc(ptr: Address, size: Size, stack: &[Address]) {
    if !monitoring_enabled() || ptr == 0 {
        return;
    }
    let table = AllocationTable::global();
    table.record(ptr, size, stack);
    if DISABLED_SCOPES.with(|d| d.get()) > 0 {
        table.mark_ignored(ptr);
    }
}

/// Record a heap deallocation; unknown pointers are ignored
pub fn record_free(ptr: Address) {
    if !monitoring_enabled() || ptr == 0 {
        return;
    }
    AllocationTable::global().record_free(ptr);
}

/// Record an address-space mapping (mmap or equivalent)
pub fn record_mmap(start: Address, len: Size, stack: &[Address]) {
    if !monitoring_enabled() {
        return;
    }
    regions::record_mapping(start, len, stack);
}

/// Record an address-space unmapping
pub fn record_munmap(start: Address, len: Size) {
    if !monitoring_enabled() {
        return;
    }
    regions::record_unmapping(start, len);
}

/// Record a mapping move or resize
pub fn record_remap(
    old_start: Address,
    old_len: Size,
    new_start: Address,
    new_len: Size,
    stack: &[Address],
) {
    if !monitoring_enabled() {
        return;
    }
    regions::record_remapping(old_start, old_len, new_start, new_len, stack);
}

/// Record in-place growth of an existing mapping (sbrk-style)
pub fn record_growth(start: Address, len: Size, stack: &[Address]) {
    if !monitoring_enabled() {
        return;
    }
    regions::record_mapping(start, len, stack);
}

/// Permanently exclude one tracked object from leak reports
///
/// The object and everything reachable from it count as live in every
/// later check. Unknown pointers are ignored.
pub fn ignore_object(ptr: Address) {
    if ptr == 0 {
        return;
    }
    AllocationTable::global().mark_ignored(ptr);
}

/// Marks allocations made while it lives as intentionally unreported
///
/// Used around caches and interned data that are reachable for the
/// process lifetime but would otherwise show up as leaks. Nests.
pub struct ScopedDisable {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ScopedDisable {
    pub fn new() -> Self {
        DISABLED_SCOPES.with(|d| d.set(d.get() + 1));
        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Default for ScopedDisable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedDisable {
    fn drop(&mut self) {
        DISABLED_SCOPES.with(|d| d.set(d.get() - 1));
    }
}

/// Global-allocator adapter recording every allocation it serves
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: TracingAllocator<std::alloc::System> =
///     TracingAllocator::new(std::alloc::System);
/// ```
pub struct TracingAllocator<A> {
    inner: A,
}

impl<A> TracingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

/// Run `f` unless this thread is already inside a hook
fn nonreentrant(f: impl FnOnce()) {
    IN_HOOK.with(|flag| {
        if flag.replace(true) {
            return;
        }
        f();
        flag.set(false);
    });
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TracingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            nonreentrant(|| record_alloc(ptr as Address, layout.size(), &[]));
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        nonreentrant(|| record_free(ptr as Address));
        self.inner.dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            nonreentrant(|| {
                record_free(ptr as Address);
                record_alloc(new_ptr as Address, new_size, &[]);
            });
        }
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_disable_nests() {
        assert_eq!(DISABLED_SCOPES.with(|d| d.get()), 0);
        {
            let _outer = ScopedDisable::new();
            let _inner = ScopedDisable::new();
            assert_eq!(DISABLED_SCOPES.with(|d| d.get()), 2);
        }
        assert_eq!(DISABLED_SCOPES.with(|d| d.get()), 0);
    }

    #[test]
    fn scoped_allocations_are_ignored() {
        let addr: Address = 0xdead_0000;
        {
            let _guard = ScopedDisable::new();
            record_alloc(addr, 64, &[0x1]);
        }
        let table = AllocationTable::global();
        let info = table.find_allocation_details(addr).unwrap();
        assert!(info.ignored);
        table.record_free(addr);
    }
}
