/*!
 * Reentrant Spin Lock
 * Explicit (owner, depth) recursion lock for hook reentrancy
 *
 * The region tracker's insertions can allocate, which re-enters the
 * tracker on the same thread. An OS recursive mutex is off limits here
 * (it may itself allocate, and is unsafe in signal contexts), so the
 * recursion state is an explicit pair guarded by a raw spin lock.
 */

use super::spin::RawSpinLock;
use crate::core::types::current_thread_marker;
use std::cell::Cell;

pub struct ReentrantSpinLock {
    guard: RawSpinLock,
    state: Cell<OwnerState>,
}

#[derive(Clone, Copy)]
struct OwnerState {
    owner: usize,
    depth: usize,
}

// OwnerState is only touched while `guard` is held or by the owner.
unsafe impl Send for ReentrantSpinLock {}
unsafe impl Sync for ReentrantSpinLock {}

impl ReentrantSpinLock {
    pub const fn new() -> Self {
        Self {
            guard: RawSpinLock::new(),
            state: Cell::new(OwnerState { owner: 0, depth: 0 }),
        }
    }

    /// Acquire the lock, incrementing the recursion depth on reentry
    ///
    /// Returns the depth after acquisition: 1 for an outermost
    /// acquisition, >1 when re-entered by the owning thread.
    pub fn lock(&self) -> usize {
        let me = current_thread_marker();
        loop {
            self.guard.lock();
            let st = self.state.get();
            if st.depth == 0 || st.owner == me {
                let depth = st.depth + 1;
                self.state.set(OwnerState { owner: me, depth });
                self.guard.unlock();
                return depth;
            }
            self.guard.unlock();
            std::hint::spin_loop();
        }
    }

    /// Release one level; returns the remaining depth
    pub fn unlock(&self) -> usize {
        let me = current_thread_marker();
        self.guard.lock();
        let st = self.state.get();
        if st.depth == 0 || st.owner != me {
            self.guard.unlock();
            crate::fatal!("sync", "reentrant unlock by non-owner thread {me:#x}");
        }
        let depth = st.depth - 1;
        self.state.set(OwnerState {
            owner: if depth == 0 { 0 } else { st.owner },
            depth,
        });
        self.guard.unlock();
        depth
    }

    /// Current recursion depth if held by the calling thread, else 0
    pub fn depth_if_owned(&self) -> usize {
        let me = current_thread_marker();
        self.guard.lock();
        let st = self.state.get();
        let depth = if st.depth > 0 && st.owner == me {
            st.depth
        } else {
            0
        };
        self.guard.unlock();
        depth
    }
}

impl Default for ReentrantSpinLock {
    fn default() -> Self {
        Self::new()
    }
}
