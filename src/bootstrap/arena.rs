/*!
 * Arena Allocator
 * First-fit allocation over an address-ordered probabilistic skip list
 *
 * Each arena owns a set of anonymously mapped chunks and a skip-list
 * free list ordered by address. Freed blocks coalesce with free
 * neighbors inside the same chunk. Larger blocks get more skip-list
 * levels, keeping search and insert near O(log n).
 *
 * The arena lock is a raw spin lock and is released around the OS
 * mapping call: that call may re-enter this allocator transitively for
 * its own bookkeeping (chunk records, mapping-hook notifications), and
 * that window is the only place where same-thread reentry is valid.
 */

use crate::core::sync::RawSpinLock;
use crate::core::types::{Size, WORD_SIZE};
use crate::fatal;
use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::num::NonZeroUsize;

/// Maximum skip-list level
const MAX_LEVEL: usize = 30;

/// Allocation granularity; every block size is a multiple of this
const ROUND_UP: usize = 16;

/// Chunks are requested in this many pages at once to amortize mmap calls
const GROWTH_PAGES: usize = 16;

/// Header check constants; a block's magic is the constant XOR'd with
/// the header's own address, so a relocated or stray-written header
/// never validates
const MAGIC_ALLOCATED: usize = 0x4c83_3e95;
const MAGIC_FREE: usize = !0x4c83_3e95;

#[inline]
fn magic(base: usize, header: *const BlockHeader) -> usize {
    base ^ header as usize
}

/// Per-block header, present on allocated and free blocks alike
#[repr(C)]
struct BlockHeader {
    /// Total block size including this header
    size: usize,
    /// MAGIC_ALLOCATED or MAGIC_FREE, XOR'd with the header address
    magic: usize,
    /// Owning arena back-reference
    arena: *mut ArenaInner,
}

/// A free block viewed as a skip-list node
///
/// The `levels` next pointers live inline directly after this struct,
/// inside the free block's own storage. Allocated blocks reuse that
/// space as user data; only the header survives allocation.
#[repr(C)]
struct FreeNode {
    header: BlockHeader,
    levels: usize,
    // next pointers follow inline
}

const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();
const NEXT_OFFSET: usize = std::mem::size_of::<FreeNode>();

/// Smallest block: header + level count + one next pointer, rounded
const MIN_BLOCK: usize = (NEXT_OFFSET + WORD_SIZE).div_ceil(ROUND_UP) * ROUND_UP;

/// Skip-list head embedded in the arena
///
/// Laid out so that the next-pointer arithmetic used for real nodes
/// works unchanged on the head: repr(C) places `next` exactly at
/// NEXT_OFFSET from the node base.
#[repr(C)]
struct HeadNode {
    node: FreeNode,
    next: [*mut FreeNode; MAX_LEVEL],
}

#[inline]
unsafe fn next_slot(node: *mut FreeNode, level: usize) -> *mut *mut FreeNode {
    ((node as *mut u8).add(NEXT_OFFSET) as *mut *mut FreeNode).add(level)
}

#[inline]
unsafe fn get_next(node: *mut FreeNode, level: usize) -> *mut FreeNode {
    *next_slot(node, level)
}

#[inline]
unsafe fn set_next(node: *mut FreeNode, level: usize, value: *mut FreeNode) {
    *next_slot(node, level) = value;
}

/// Record of one OS-obtained chunk, kept for bulk release
#[repr(C)]
struct ChunkNode {
    start: usize,
    len: usize,
    next: *mut ChunkNode,
}

/// Arena creation flags
#[derive(Debug, Clone, Copy, Default)]
pub struct ArenaFlags {
    /// Notify the mapping hooks of every chunk this arena maps/unmaps.
    /// Off for arenas that back the tracking structures themselves.
    pub notify_mapping_hooks: bool,
}

/// Arena statistics
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArenaStats {
    pub blocks_outstanding: usize,
    pub bytes_outstanding: Size,
    pub bytes_mapped: Size,
}

struct ArenaInner {
    lock: RawSpinLock,
    head: HeadNode,
    rng: u64,
    pagesize: usize,
    min_size: usize,
    flags: ArenaFlags,
    blocks_outstanding: usize,
    bytes_outstanding: usize,
    bytes_mapped: usize,
    chunks_lock: RawSpinLock,
    chunks: *mut ChunkNode,
    /// Arena supplying this arena's own metadata (chunk records, the
    /// ArenaInner itself). The default arena is its own metadata arena.
    meta: *mut ArenaInner,
    /// The default arena is static and can never be deleted
    is_static: bool,
}

impl ArenaInner {
    const fn empty() -> Self {
        Self {
            lock: RawSpinLock::new(),
            head: HeadNode {
                node: FreeNode {
                    header: BlockHeader {
                        size: 0,
                        magic: 0,
                        arena: ptr::null_mut(),
                    },
                    levels: 0,
                },
                next: [ptr::null_mut(); MAX_LEVEL],
            },
            rng: 1,
            pagesize: 0,
            min_size: MIN_BLOCK,
            flags: ArenaFlags {
                notify_mapping_hooks: false,
            },
            blocks_outstanding: 0,
            bytes_outstanding: 0,
            bytes_mapped: 0,
            chunks_lock: RawSpinLock::new(),
            chunks: ptr::null_mut(),
            meta: ptr::null_mut(),
            is_static: true,
        }
    }
}

/// Handle to an isolated allocation pool
///
/// Copyable token; the arena itself lives until [`Arena::delete`]
/// succeeds (or forever, for the default arena).
#[derive(Clone, Copy)]
pub struct Arena {
    inner: NonNull<ArenaInner>,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

struct DefaultArenaCell(UnsafeCell<ArenaInner>);
unsafe impl Sync for DefaultArenaCell {}

static DEFAULT_ARENA: DefaultArenaCell = DefaultArenaCell(UnsafeCell::new(ArenaInner::empty()));

#[inline]
fn round_to(n: usize, unit: usize) -> usize {
    n.div_ceil(unit) * unit
}

fn int_log2(size: usize, base: usize) -> usize {
    let mut result = 0;
    let mut i = size;
    while i > base {
        i >>= 1;
        result += 1;
    }
    result
}

#[inline]
fn xorshift(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

/// Geometric random increment: 1 + number of consecutive heads
fn random_increment(rng: &mut u64) -> usize {
    let mut level = 1;
    loop {
        *rng = xorshift(*rng);
        if (*rng >> 32) & 1 == 0 {
            return level;
        }
        level += 1;
    }
}

/// Level count for a block of `size` bytes
///
/// `floor(log2(size / base))` plus a geometric increment when `rng` is
/// given (one otherwise, for the deterministic minimum used during
/// search), capped by the pointer space available inside the block and
/// by MAX_LEVEL.
fn skiplist_levels(size: usize, base: usize, rng: Option<&mut u64>) -> usize {
    let max_fit = (size - NEXT_OFFSET) / WORD_SIZE;
    let mut level = int_log2(size, base)
        + match rng {
            Some(r) => random_increment(r),
            None => 1,
        };
    if level > max_fit {
        level = max_fit;
    }
    if level > MAX_LEVEL {
        level = MAX_LEVEL;
    }
    level.max(1)
}

/// Find the first node at or after `e` on level 0, filling `prev` with
/// the last node strictly before `e` on every head level
unsafe fn skiplist_search(
    head: *mut FreeNode,
    e: *mut FreeNode,
    prev: &mut [*mut FreeNode; MAX_LEVEL],
) -> *mut FreeNode {
    let mut p = head;
    let levels = (*head).levels;
    for level in (0..levels).rev() {
        loop {
            let n = get_next(p, level);
            if n.is_null() || (n as usize) >= (e as usize) {
                break;
            }
            p = n;
        }
        prev[level] = p;
    }
    if levels == 0 {
        ptr::null_mut()
    } else {
        get_next(prev[0], 0)
    }
}

unsafe fn skiplist_insert(head: *mut FreeNode, e: *mut FreeNode) {
    let mut prev = [ptr::null_mut(); MAX_LEVEL];
    skiplist_search(head, e, &mut prev);
    let head_levels = (*head).levels;
    for slot in prev.iter_mut().take((*e).levels).skip(head_levels) {
        *slot = head;
    }
    if (*e).levels > head_levels {
        (*head).levels = (*e).levels;
    }
    for level in 0..(*e).levels {
        set_next(e, level, get_next(prev[level], level));
        set_next(prev[level], level, e);
    }
}

unsafe fn skiplist_delete(head: *mut FreeNode, e: *mut FreeNode) {
    let mut prev = [ptr::null_mut(); MAX_LEVEL];
    let found = skiplist_search(head, e, &mut prev);
    if found != e {
        fatal!(
            "bootstrap",
            "free list corruption: block {:#x} not found on its own list",
            e as usize
        );
    }
    for level in 0..(*e).levels {
        if get_next(prev[level], level) == e {
            set_next(prev[level], level, get_next(e, level));
        }
    }
    while (*head).levels > 0 && get_next(head, (*head).levels - 1).is_null() {
        (*head).levels -= 1;
    }
}

impl Arena {
    /// The process-wide default arena
    ///
    /// Usable before any other subsystem exists: construction is const
    /// and the page size is queried lazily on first allocation.
    pub fn default_arena() -> Arena {
        let inner = DEFAULT_ARENA.0.get();
        unsafe {
            if (*inner).meta.is_null() {
                // Benign if two threads race: both write the same values.
                (*inner).meta = inner;
            }
        }
        Arena {
            inner: unsafe { NonNull::new_unchecked(inner) },
        }
    }

    /// Create a new arena; metadata (the arena record, chunk records)
    /// comes from `metadata_arena`, defaulting to the default arena
    pub fn new(flags: ArenaFlags, metadata_arena: Option<Arena>) -> Arena {
        let meta = metadata_arena.unwrap_or_else(Arena::default_arena);
        let raw = meta.alloc(std::mem::size_of::<ArenaInner>()) as *mut ArenaInner;
        unsafe {
            raw.write(ArenaInner::empty());
            (*raw).is_static = false;
            (*raw).flags = flags;
            (*raw).meta = meta.inner.as_ptr();
        }
        Arena {
            inner: unsafe { NonNull::new_unchecked(raw) },
        }
    }

    #[inline]
    fn inner(&self) -> *mut ArenaInner {
        self.inner.as_ptr()
    }

    /// Allocate `n` bytes; returns null only when `n == 0`
    ///
    /// Aborts the process if the OS refuses to map more memory: this
    /// allocator underlies the monitoring that would otherwise report
    /// the failure.
    pub fn alloc(&self, n: Size) -> *mut u8 {
        if n == 0 {
            return ptr::null_mut();
        }
        let a = self.inner();
        let req = round_to(n.saturating_add(HEADER_SIZE).max(MIN_BLOCK), ROUND_UP);
        unsafe {
            (&(*a).lock).lock();
            if (*a).pagesize == 0 {
                (*a).pagesize = page_size();
            }
            let head = &mut (*a).head.node as *mut FreeNode;
            let block = loop {
                if let Some(found) = first_fit(head, req, (*a).min_size) {
                    break found;
                }
                // No free block fits. Release the lock around the OS
                // call; it may re-enter this arena for chunk records.
                (&(*a).lock).unlock();
                let chunk_len = round_to(req, (*a).pagesize * GROWTH_PAGES);
                let chunk = map_chunk(chunk_len);
                (&(*a).lock).lock();
                (*a).bytes_mapped += chunk_len;
                let node = chunk as *mut FreeNode;
                (*node).header.size = chunk_len;
                (*node).header.magic = magic(MAGIC_FREE, &(*node).header);
                (*node).header.arena = a;
                (*node).levels = skiplist_levels(chunk_len, (*a).min_size, Some(&mut (*a).rng));
                skiplist_insert(head, node);
                // Record the chunk with the lock dropped: the record
                // node comes from the metadata arena, which may be this
                // very arena (now able to satisfy it from the new chunk).
                (&(*a).lock).unlock();
                record_chunk(a, chunk as usize, chunk_len);
                if (*a).flags.notify_mapping_hooks {
                    crate::hooks::record_mmap(chunk as usize, chunk_len, &[]);
                }
                (&(*a).lock).lock();
            };
            skiplist_delete(head, block);
            // Split off the tail when the remainder is itself a usable block
            if req + (*a).min_size <= (*block).header.size {
                let tail = (block as *mut u8).add(req) as *mut FreeNode;
                (*tail).header.size = (*block).header.size - req;
                (*tail).header.magic = magic(MAGIC_FREE, &(*tail).header);
                (*tail).header.arena = a;
                (*tail).levels = skiplist_levels((*tail).header.size, (*a).min_size, Some(&mut (*a).rng));
                skiplist_insert(head, tail);
                (*block).header.size = req;
            }
            (*block).header.magic = magic(MAGIC_ALLOCATED, &(*block).header);
            (*a).blocks_outstanding += 1;
            (*a).bytes_outstanding += (*block).header.size;
            (&(*a).lock).unlock();
            (block as *mut u8).add(HEADER_SIZE)
        }
    }

    /// Return a block to its owning arena
    ///
    /// The arena is recovered from the block header; a corrupted header
    /// or a double free is a fatal consistency violation.
    pub fn free(p: *mut u8) {
        if p.is_null() {
            return;
        }
        unsafe {
            let block = p.sub(HEADER_SIZE) as *mut FreeNode;
            let header = &(*block).header as *const BlockHeader;
            if (*block).header.magic == magic(MAGIC_FREE, header) {
                fatal!("bootstrap", "double free of block at {:#x}", p as usize);
            }
            if (*block).header.magic != magic(MAGIC_ALLOCATED, header) {
                fatal!(
                    "bootstrap",
                    "corrupted block header at {:#x} (stray write?)",
                    p as usize
                );
            }
            let a = (*block).header.arena;
            (&(*a).lock).lock();
            (*a).blocks_outstanding -= 1;
            (*a).bytes_outstanding -= (*block).header.size;
            add_to_freelist(a, block);
            (&(*a).lock).unlock();
        }
    }

    /// Destroy the arena, releasing every chunk it owns in one pass
    ///
    /// Fails (and leaves the arena intact) while any block is still
    /// outstanding. The default arena is never deletable.
    pub fn delete(self) -> bool {
        let a = self.inner();
        unsafe {
            if (*a).is_static {
                return false;
            }
            (&(*a).lock).lock();
            if (*a).blocks_outstanding != 0 {
                log::warn!(
                    "arena delete refused: {} blocks ({} bytes) outstanding",
                    (*a).blocks_outstanding,
                    (*a).bytes_outstanding
                );
                (&(*a).lock).unlock();
                return false;
            }
            (&(*a).lock).unlock();
            let meta = (*a).meta;
            let notify = (*a).flags.notify_mapping_hooks;
            (&(*a).chunks_lock).lock();
            let mut chunk = (*a).chunks;
            (*a).chunks = ptr::null_mut();
            (&(*a).chunks_lock).unlock();
            while !chunk.is_null() {
                let next = (*chunk).next;
                let (start, len) = ((*chunk).start, (*chunk).len);
                Arena::free(chunk as *mut u8);
                if notify {
                    crate::hooks::record_munmap(start, len);
                }
                if let Some(nn) = NonNull::new(start as *mut c_void) {
                    if let Err(e) = munmap(nn, len) {
                        log::warn!("munmap({start:#x}, {len}) failed during arena delete: {e}");
                    }
                }
                chunk = next;
            }
            debug_assert!(!meta.is_null());
            Arena::free(a as *mut u8);
        }
        true
    }

    pub fn stats(&self) -> ArenaStats {
        let a = self.inner();
        unsafe {
            (&(*a).lock).lock();
            let stats = ArenaStats {
                blocks_outstanding: (*a).blocks_outstanding,
                bytes_outstanding: (*a).bytes_outstanding,
                bytes_mapped: (*a).bytes_mapped,
            };
            (&(*a).lock).unlock();
            stats
        }
    }
}

/// First-fit search starting at the minimal level guaranteed to hold
/// the request
unsafe fn first_fit(head: *mut FreeNode, req: usize, min_size: usize) -> Option<*mut FreeNode> {
    let min_levels = skiplist_levels(req, min_size, None);
    let level = min_levels - 1;
    if level >= (*head).levels {
        return None;
    }
    let mut before = head;
    loop {
        let s = get_next(before, level);
        if s.is_null() {
            return None;
        }
        if (*s).header.size >= req {
            return Some(s);
        }
        before = s;
    }
}

/// Insert a block into the free list and coalesce with free neighbors
/// inside the same chunk
unsafe fn add_to_freelist(a: *mut ArenaInner, block: *mut FreeNode) {
    let head = &mut (*a).head.node as *mut FreeNode;
    let mut f = block;
    (*f).header.magic = magic(MAGIC_FREE, &(*f).header);

    let (chunk_start, chunk_len) = chunk_containing(a, f as usize);

    // Coalesce with the successor in address space. The successor
    // header is only readable if it lies inside the same mapped chunk.
    let succ = (f as *mut u8).add((*f).header.size) as *mut FreeNode;
    if (succ as usize) < chunk_start + chunk_len
        && (*succ).header.magic == magic(MAGIC_FREE, &(*succ).header)
        && (*succ).header.arena == a
    {
        skiplist_delete(head, succ);
        (*f).header.size += (*succ).header.size;
        (*succ).header.magic = 0;
    }

    // Coalesce with the predecessor: the nearest free block below us
    let mut prev = [ptr::null_mut(); MAX_LEVEL];
    skiplist_search(head, f, &mut prev);
    if (*head).levels > 0 {
        let p = prev[0];
        if p != head
            && (p as usize) + (*p).header.size == f as usize
            && (p as usize) >= chunk_start
            && chunk_len > 0
        {
            skiplist_delete(head, p);
            (*p).header.size += (*f).header.size;
            (*f).header.magic = 0;
            f = p;
        }
    }

    (*f).levels = skiplist_levels((*f).header.size, (*a).min_size, Some(&mut (*a).rng));
    skiplist_insert(head, f);
}

unsafe fn chunk_containing(a: *mut ArenaInner, addr: usize) -> (usize, usize) {
    (&(*a).chunks_lock).lock();
    let mut c = (*a).chunks;
    while !c.is_null() {
        if addr >= (*c).start && addr < (*c).start + (*c).len {
            let span = ((*c).start, (*c).len);
            (&(*a).chunks_lock).unlock();
            return span;
        }
        c = (*c).next;
    }
    (&(*a).chunks_lock).unlock();
    // Chunk not recorded yet: the record is written with the arena lock
    // dropped, so a free racing the very first allocation from a fresh
    // chunk can get here. Treat the block's own extent as the chunk;
    // coalescing is then simply skipped.
    (addr, 0)
}

unsafe fn record_chunk(a: *mut ArenaInner, start: usize, len: usize) {
    let meta = Arena {
        inner: NonNull::new_unchecked((*a).meta),
    };
    let node = meta.alloc(std::mem::size_of::<ChunkNode>()) as *mut ChunkNode;
    (*node).start = start;
    (*node).len = len;
    (&(*a).chunks_lock).lock();
    (*node).next = (*a).chunks;
    (*a).chunks = node;
    (&(*a).chunks_lock).unlock();
}

fn map_chunk(len: usize) -> *mut u8 {
    let length = match NonZeroUsize::new(len) {
        Some(l) => l,
        None => fatal!("bootstrap", "zero-length chunk request"),
    };
    match unsafe {
        mmap_anonymous(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )
    } {
        Ok(p) => p.as_ptr() as *mut u8,
        Err(e) => {
            // No recovery path: this allocator underlies the monitoring
            // infrastructure itself.
            fatal!("bootstrap", "out of memory: mmap({len}) failed: {e}");
        }
    }
}

fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 {
        4096
    } else {
        n as usize
    }
}
