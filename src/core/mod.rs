/*!
 * Core Module
 * Shared types, errors, and sync primitives
 */

pub mod errors;
pub mod sync;
pub mod types;

pub use errors::{TraceError, TraceResult};
pub use types::{Address, Size, StackHash};
