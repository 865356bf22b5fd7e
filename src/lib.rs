/*!
 * heaptrace
 * Allocation tracking and conservative leak detection
 *
 * A self-hosting tracking layer: every internal structure lives in
 * dedicated bootstrap arenas so the subsystem can observe an allocator
 * without allocating through it. On top of the tracking substrate sit
 * address-keyed metadata maps, a mapping-event region tracker, an
 * aggregate allocation table and a conservative reachability-based
 * leak checker.
 */

pub mod bootstrap;
pub mod checker;
pub mod cluster;
pub mod config;
pub mod core;
pub mod hooks;
pub mod regions;
pub mod table;

pub use bootstrap::{Arena, ArenaFlags, ArenaStats};
pub use checker::{LeakChecker, LeakReport, RootKind, RootRange, RootSource};
pub use config::{CheckConfig, LeakAction};
pub use crate::core::errors::{TraceError, TraceResult};
pub use hooks::{ignore_object, ScopedDisable, TracingAllocator};
pub use table::{AllocationTable, LeakEntry, Snapshot, TableStats};
