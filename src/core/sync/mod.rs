/*!
 * Synchronization Primitives
 * Spin-based locks safe on allocation and signal paths
 */

mod reentrant;
mod spin;

pub use reentrant::ReentrantSpinLock;
pub use spin::{RawSpinLock, SpinGuard, SpinLock};
