/*!
 * Core Types
 * Common types used across the tracing subsystem
 */

/// Address type for memory operations
pub type Address = usize;

/// Size type for memory operations
pub type Size = usize;

/// Hash of a bounded-depth call stack
pub type StackHash = u64;

/// Machine word size; also the default pointer-alignment assumption
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Hard cap on recorded call-stack depth; configured depths are clamped to this
pub const MAX_STACK_DEPTH: usize = 32;

/// Hash a bounded-depth call stack into a bucket key
///
/// FNV-1a over the frame addresses. Stable across runs for identical
/// stacks, which keeps dump output diffable.
pub fn hash_stack(stack: &[Address]) -> StackHash {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for frame in stack {
        h ^= *frame as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    // depth disambiguates a truncated stack from its prefix
    h ^= stack.len() as u64;
    h.wrapping_mul(0x0000_0100_0000_01b3)
}

/// A unique marker address for the calling thread
///
/// The address of a thread-local slot stands in for a thread id: it is
/// unique per live thread, costs no syscall, and is safe to take on
/// allocation-hook paths. Once TLS teardown has begun the slot is
/// gone, and the marker falls back to [`teardown_marker`].
pub fn current_thread_marker() -> usize {
    thread_local! {
        static MARKER: u8 = const { 0 };
    }
    MARKER
        .try_with(|slot| slot as *const u8 as usize)
        .unwrap_or_else(|_| teardown_marker())
}

/// Thread identity usable during TLS teardown
///
/// The pthread handle is valid for the whole life of the thread,
/// including destructor context, and is never shared between two live
/// threads, so tearing-down threads cannot alias as one lock owner.
fn teardown_marker() -> usize {
    unsafe { libc::pthread_self() as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_hash_distinguishes_depth() {
        let a = [0x1000, 0x2000];
        let b = [0x1000, 0x2000, 0x3000];
        assert_ne!(hash_stack(&a), hash_stack(&b));
        assert_ne!(hash_stack(&a[..1]), hash_stack(&a));
        assert_eq!(hash_stack(&a), hash_stack(&[0x1000, 0x2000]));
    }

    #[test]
    fn teardown_identity_is_unique_among_live_threads() {
        let here = teardown_marker();
        assert_ne!(here, 0);
        assert_ne!(here, usize::MAX);
        let (tx, rx) = std::sync::mpsc::channel();
        let (hold_tx, hold_rx) = std::sync::mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            tx.send(teardown_marker()).unwrap();
            hold_rx.recv().unwrap();
        });
        // compare while the other thread is still alive
        let other = rx.recv().unwrap();
        assert_ne!(other, here);
        hold_tx.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn thread_marker_is_stable_within_thread() {
        let m1 = current_thread_marker();
        let m2 = current_thread_marker();
        assert_eq!(m1, m2);
        let other = std::thread::spawn(current_thread_marker).join().unwrap();
        assert_ne!(m1, other);
    }
}
