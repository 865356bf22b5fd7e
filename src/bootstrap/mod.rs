/*!
 * Bootstrap Allocator
 * Standalone allocator the tracking structures are built on
 *
 * Everything above this layer (the cluster map, the region tracker, the
 * allocation table) needs memory of its own, acquired without touching
 * the allocator being tracked. Arenas here go straight to anonymous
 * mappings and are safe to use before process constructors run.
 */

mod arena;

pub use arena::{Arena, ArenaFlags, ArenaStats};
