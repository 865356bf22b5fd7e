/*!
 * Address Cluster Map
 * Address-keyed associative structure exploiting spatial locality
 *
 * Allocator-issued addresses cluster tightly, so a flat hash over the
 * full address space would waste most of its reach. Instead a
 * fixed-size top-level table is keyed by a coarse cluster id; each
 * cluster holds a dense array of per-block entry lists covering a
 * contiguous address window. Average cost is near O(1) and sparse
 * address ranges cost nothing.
 *
 * All backing memory comes from an injected allocator so the map can
 * live on the bootstrap layer; every backing chunk is kept on one list
 * and the whole structure releases in a single pass on drop.
 */

use crate::core::types::{Address, Size};
use std::marker::PhantomData;
use std::ptr;

/// Injected allocate/deallocate pair
///
/// Implemented by [`crate::bootstrap::Arena`] for tracking-side maps
/// and by [`HeapBacking`] for snapshots and tests.
pub trait BackingAlloc {
    fn alloc(&self, size: Size) -> *mut u8;
    /// # Safety
    /// `ptr` must have come from `alloc(size)` on this same allocator.
    unsafe fn dealloc(&self, ptr: *mut u8, size: Size);
}

impl BackingAlloc for crate::bootstrap::Arena {
    fn alloc(&self, size: Size) -> *mut u8 {
        crate::bootstrap::Arena::alloc(self, size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _size: Size) {
        crate::bootstrap::Arena::free(ptr);
    }
}

/// Process-heap backing for maps that are not on the bootstrap path
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapBacking;

impl BackingAlloc for HeapBacking {
    fn alloc(&self, size: Size) -> *mut u8 {
        let layout = std::alloc::Layout::from_size_align(size.max(1), 16)
            .unwrap_or_else(|_| crate::fatal!("cluster", "bad backing layout for {size} bytes"));
        let p = unsafe { std::alloc::alloc(layout) };
        if p.is_null() {
            crate::fatal!("cluster", "backing allocation of {size} bytes failed");
        }
        p
    }

    unsafe fn dealloc(&self, ptr: *mut u8, size: Size) {
        let layout = std::alloc::Layout::from_size_align_unchecked(size.max(1), 16);
        std::alloc::dealloc(ptr, layout);
    }
}

// Geometry: a block is the unit of list chaining, a cluster covers a
// dense window of blocks, and the top table hashes cluster ids.
const BLOCK_BITS: usize = 7;
const BLOCK_SIZE: usize = 1 << BLOCK_BITS;
const CLUSTER_BLOCKS_BITS: usize = 13;
const CLUSTER_BLOCKS: usize = 1 << CLUSTER_BLOCKS_BITS;
const HASH_BITS: usize = 12;
const HASH_SIZE: usize = 1 << HASH_BITS;

/// Entries handed out from the recycle list in batches of this many
const ENTRY_BATCH: usize = 64;

#[repr(C)]
struct Entry<V> {
    next: *mut Entry<V>,
    key: Address,
    value: V,
}

#[repr(C)]
struct Cluster<V> {
    next: *mut Cluster<V>,
    id: usize,
    blocks: [*mut Entry<V>; CLUSTER_BLOCKS],
}

/// Header prepended to every backing allocation, forming the
/// single-pass release list
#[repr(C)]
struct BackingChunk {
    next: *mut BackingChunk,
    size: Size,
}

#[inline]
fn cluster_id(key: Address) -> usize {
    key >> (BLOCK_BITS + CLUSTER_BLOCKS_BITS)
}

#[inline]
fn cluster_hash(id: usize) -> usize {
    (id.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> (usize::BITS as usize - HASH_BITS)) & (HASH_SIZE - 1)
}

#[inline]
fn block_index(key: Address) -> usize {
    (key >> BLOCK_BITS) & (CLUSTER_BLOCKS - 1)
}

/// Address-keyed map over an injected backing allocator
///
/// Values are `Copy`: teardown releases backing chunks wholesale and
/// never runs value destructors.
pub struct AddressClusterMap<V: Copy, A: BackingAlloc> {
    backing: A,
    hashtable: *mut [*mut Cluster<V>; HASH_SIZE],
    free_entries: *mut Entry<V>,
    chunks: *mut BackingChunk,
    len: usize,
    _values: PhantomData<V>,
}

unsafe impl<V: Copy + Send, A: BackingAlloc + Send> Send for AddressClusterMap<V, A> {}

impl<V: Copy, A: BackingAlloc> AddressClusterMap<V, A> {
    pub fn new(backing: A) -> Self {
        let mut map = Self {
            backing,
            hashtable: ptr::null_mut(),
            free_entries: ptr::null_mut(),
            chunks: ptr::null_mut(),
            len: 0,
            _values: PhantomData,
        };
        let table = map.backed_alloc(std::mem::size_of::<[*mut Cluster<V>; HASH_SIZE]>())
            as *mut [*mut Cluster<V>; HASH_SIZE];
        unsafe {
            (&mut *table).fill(ptr::null_mut());
        }
        map.hashtable = table;
        map
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocate from the backing allocator, recording the chunk for
    /// single-pass release
    fn backed_alloc(&mut self, size: Size) -> *mut u8 {
        let total = size + std::mem::size_of::<BackingChunk>();
        let raw = self.backing.alloc(total) as *mut BackingChunk;
        unsafe {
            (*raw).next = self.chunks;
            (*raw).size = total;
            self.chunks = raw;
            raw.add(1) as *mut u8
        }
    }

    fn find_cluster(&mut self, key: Address, create: bool) -> *mut Cluster<V> {
        let id = cluster_id(key);
        let slot = cluster_hash(id);
        unsafe {
            let mut c = (*self.hashtable)[slot];
            while !c.is_null() {
                if (*c).id == id {
                    return c;
                }
                c = (*c).next;
            }
            if !create {
                return ptr::null_mut();
            }
            let c = self.backed_alloc(std::mem::size_of::<Cluster<V>>()) as *mut Cluster<V>;
            (*c).id = id;
            (&mut (*c).blocks).fill(ptr::null_mut());
            (*c).next = (*self.hashtable)[slot];
            (*self.hashtable)[slot] = c;
            c
        }
    }

    /// Pop a recycled entry node, refilling the free list from the
    /// backing allocator only when it is empty
    fn take_entry(&mut self) -> *mut Entry<V> {
        unsafe {
            if self.free_entries.is_null() {
                let batch = self
                    .backed_alloc(std::mem::size_of::<Entry<V>>() * ENTRY_BATCH)
                    as *mut Entry<V>;
                for i in 0..ENTRY_BATCH {
                    let e = batch.add(i);
                    (*e).next = self.free_entries;
                    self.free_entries = e;
                }
            }
            let e = self.free_entries;
            self.free_entries = (*e).next;
            e
        }
    }

    /// Most recent surviving value inserted at `key`
    pub fn find(&self, key: Address) -> Option<V> {
        unsafe {
            let id = cluster_id(key);
            let mut c = (*self.hashtable)[cluster_hash(id)];
            while !c.is_null() {
                if (*c).id == id {
                    let mut e = (*c).blocks[block_index(key)];
                    while !e.is_null() {
                        if (*e).key == key {
                            return Some((*e).value);
                        }
                        e = (*e).next;
                    }
                    return None;
                }
                c = (*c).next;
            }
            None
        }
    }

    pub fn find_mut(&mut self, key: Address) -> Option<&mut V> {
        let c = self.find_cluster(key, false);
        if c.is_null() {
            return None;
        }
        unsafe {
            let mut e = (*c).blocks[block_index(key)];
            while !e.is_null() {
                if (*e).key == key {
                    return Some(&mut (*e).value);
                }
                e = (*e).next;
            }
        }
        None
    }

    /// Insert `value` at `key`, overwriting any existing value
    pub fn insert(&mut self, key: Address, value: V) {
        let c = self.find_cluster(key, true);
        unsafe {
            let block = block_index(key);
            let mut e = (*c).blocks[block];
            while !e.is_null() {
                if (*e).key == key {
                    (*e).value = value;
                    return;
                }
                e = (*e).next;
            }
            let e = self.take_entry();
            (*e).key = key;
            (*e).value = value;
            (*e).next = (*c).blocks[block];
            (*c).blocks[block] = e;
            self.len += 1;
        }
    }

    /// Remove and return the value at `key`; the node is recycled
    pub fn find_and_remove(&mut self, key: Address) -> Option<V> {
        let c = self.find_cluster(key, false);
        if c.is_null() {
            return None;
        }
        unsafe {
            let block = block_index(key);
            let mut link: *mut *mut Entry<V> = &mut (*c).blocks[block];
            while !(*link).is_null() {
                let e = *link;
                if (*e).key == key {
                    *link = (*e).next;
                    let value = (*e).value;
                    (*e).next = self.free_entries;
                    self.free_entries = e;
                    self.len -= 1;
                    return Some(value);
                }
                link = &mut (*e).next;
            }
        }
        None
    }

    /// Resolve an interior pointer: the entry whose `[key, key + size)`
    /// range contains `key`, searching at most `max_search` bytes back
    ///
    /// Assumes entries describe non-overlapping ranges no longer than
    /// `max_search`; returns `None` for probes in a gap.
    pub fn find_inside(
        &self,
        size_of: impl Fn(&V) -> Size,
        max_search: Size,
        key: Address,
    ) -> Option<(Address, V)> {
        let mut block_addr = key & !(BLOCK_SIZE - 1);
        loop {
            unsafe {
                let id = cluster_id(block_addr);
                let mut c = (*self.hashtable)[cluster_hash(id)];
                while !c.is_null() && (*c).id != id {
                    c = (*c).next;
                }
                if !c.is_null() {
                    // Nearest entry at or below the probe within this block
                    let mut best: Option<(Address, V)> = None;
                    let mut e = (*c).blocks[block_index(block_addr)];
                    while !e.is_null() {
                        if (*e).key <= key && best.is_none_or(|(bk, _)| (*e).key > bk) {
                            best = Some(((*e).key, (*e).value));
                        }
                        e = (*e).next;
                    }
                    if let Some((bk, bv)) = best {
                        // Non-overlap makes this entry the only candidate
                        return if key < bk + size_of(&bv) {
                            Some((bk, bv))
                        } else {
                            None
                        };
                    }
                }
            }
            if block_addr == 0 || key - block_addr >= max_search {
                return None;
            }
            block_addr -= BLOCK_SIZE;
        }
    }

    /// Visit every entry; the callback may mutate values but must not
    /// insert or remove
    pub fn iterate(&mut self, mut f: impl FnMut(Address, &mut V)) {
        unsafe {
            for slot in 0..HASH_SIZE {
                let mut c = (*self.hashtable)[slot];
                while !c.is_null() {
                    for block in 0..CLUSTER_BLOCKS {
                        let mut e = (*c).blocks[block];
                        while !e.is_null() {
                            f((*e).key, &mut (*e).value);
                            e = (*e).next;
                        }
                    }
                    c = (*c).next;
                }
            }
        }
    }
}

impl<V: Copy, A: BackingAlloc> Drop for AddressClusterMap<V, A> {
    fn drop(&mut self) {
        unsafe {
            let mut chunk = self.chunks;
            while !chunk.is_null() {
                let next = (*chunk).next;
                let size = (*chunk).size;
                self.backing.dealloc(chunk as *mut u8, size);
                chunk = next;
            }
        }
    }
}
