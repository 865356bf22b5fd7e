/*!
 * Reachability Flood
 * Conservative pointer scan from the roots over the allocation table
 *
 * Anything that looks like a pointer is treated as one. The frontier is
 * an intrusive stack of ranges allocated from a scratch arena, never
 * from the allocator under test; by the time the flood returns the
 * frontier is empty and every node has gone back to the arena.
 */

use super::roots::RootRange;
use crate::bootstrap::Arena;
use crate::core::types::{Address, Size, WORD_SIZE};
use crate::table::AllocationTable;

#[repr(C)]
struct FrontierNode {
    start: Address,
    end: Address,
    next: *mut FrontierNode,
}

struct Frontier<'a> {
    arena: &'a Arena,
    top: *mut FrontierNode,
}

impl<'a> Frontier<'a> {
    fn new(arena: &'a Arena) -> Self {
        Self {
            arena,
            top: std::ptr::null_mut(),
        }
    }

    fn push(&mut self, start: Address, end: Address) {
        if start >= end {
            return;
        }
        let node = self.arena.alloc(std::mem::size_of::<FrontierNode>()) as *mut FrontierNode;
        unsafe {
            (*node).start = start;
            (*node).end = end;
            (*node).next = self.top;
        }
        self.top = node;
    }

    fn pop(&mut self) -> Option<(Address, Address)> {
        if self.top.is_null() {
            return None;
        }
        let node = self.top;
        unsafe {
            self.top = (*node).next;
            let range = ((*node).start, (*node).end);
            Arena::free(node as *mut u8);
            Some(range)
        }
    }
}

/// What one flood pass visited and found
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FloodStats {
    pub scanned_words: u64,
    pub marked_objects: u64,
    pub marked_bytes: u64,
}

/// Flood the table from `roots`, marking every reachable allocation live
///
/// Candidate words are filtered against the table's address bounds
/// before the map lookup; interior pointers resolve to their owning
/// allocation. Newly marked allocations have their contents scanned in
/// turn until the frontier drains.
pub(crate) fn flood(
    table: &AllocationTable,
    roots: &[RootRange],
    scratch: &Arena,
    alignment: Size,
) -> FloodStats {
    let mut frontier = Frontier::new(scratch);
    for root in roots {
        frontier.push(root.start, root.end);
    }
    let (min_addr, max_addr, max_object) = table.heap_bounds();
    let mut stats = FloodStats::default();
    while let Some((start, end)) = frontier.pop() {
        let mut addr = align_up(start, alignment);
        while addr.checked_add(WORD_SIZE).is_some_and(|e| e <= end) {
            // Volatile so the scan of live program memory is not
            // reordered or elided; unaligned reads only in byte mode.
            let value = unsafe {
                if addr % WORD_SIZE == 0 {
                    std::ptr::read_volatile(addr as *const Address)
                } else {
                    std::ptr::read_unaligned(addr as *const Address)
                }
            };
            stats.scanned_words += 1;
            if value >= min_addr && value < max_addr {
                if let Some((base, size)) = table.flood_resolve(value, max_object) {
                    stats.marked_objects += 1;
                    stats.marked_bytes += size as u64;
                    frontier.push(base, base + size);
                }
            }
            addr += alignment;
        }
    }
    stats
}

fn align_up(addr: Address, alignment: Size) -> Address {
    (addr + alignment - 1) & !(alignment - 1)
}
