/*!
 * Root Discovery
 * Where the reachability flood starts
 *
 * Every root is a half-open address range of raw memory to scan for
 * heap pointers. Sources are pluggable so tests can substitute exact
 * ranges for the process-introspection sources.
 */

use crate::core::errors::{TraceError, TraceResult};
use crate::core::types::Address;
use crate::regions;
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;

/// Why a range is considered a root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    /// Writable global/static data of a loaded module
    GlobalData,
    /// Registered thread stack or saved thread context
    ThreadSpan,
    /// Range supplied directly by the caller
    Explicit,
    /// Contents of an allocation flagged as ignored or trusted
    ObjectContents,
}

/// Half-open `[start, end)` range to scan for heap pointers
#[derive(Debug, Clone, Copy)]
pub struct RootRange {
    pub start: Address,
    pub end: Address,
    pub kind: RootKind,
}

impl RootRange {
    pub fn new(start: Address, end: Address, kind: RootKind) -> Self {
        Self { start, end, kind }
    }
}

/// A producer of root ranges
///
/// An `Err` means the source could not enumerate its roots; the check
/// proceeds with reduced precision rather than failing.
pub trait RootSource {
    fn name(&self) -> &'static str;
    fn collect(&self, out: &mut Vec<RootRange>) -> TraceResult<()>;
}

/// Writable data segments of loaded modules, from the kernel's map view
pub struct ModuleDataRoots {
    maps_path: PathBuf,
}

impl ModuleDataRoots {
    pub fn new() -> Self {
        Self {
            maps_path: PathBuf::from("/proc/self/maps"),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_path(maps_path: PathBuf) -> Self {
        Self { maps_path }
    }

    fn parse_line(line: &str) -> Option<RootRange> {
        let mut fields = line.split_whitespace();
        let span = fields.next()?;
        let perms = fields.next()?;
        // offset, dev, inode
        let path = fields.nth(3)?;
        if !perms.starts_with("rw") || !path.starts_with('/') {
            return None;
        }
        let (start, end) = span.split_once('-')?;
        let start = Address::from_str_radix(start, 16).ok()?;
        let end = Address::from_str_radix(end, 16).ok()?;
        Some(RootRange::new(start, end, RootKind::GlobalData))
    }
}

impl Default for ModuleDataRoots {
    fn default() -> Self {
        Self::new()
    }
}

impl RootSource for ModuleDataRoots {
    fn name(&self) -> &'static str {
        "module-data"
    }

    fn collect(&self, out: &mut Vec<RootRange>) -> TraceResult<()> {
        let maps = fs::read_to_string(&self.maps_path)
            .map_err(|e| TraceError::MemoryMapUnreadable(e.to_string()))?;
        let before = out.len();
        out.extend(maps.lines().filter_map(Self::parse_line));
        log::debug!(
            "module-data roots: {} writable segments",
            out.len() - before
        );
        Ok(())
    }
}

static THREAD_SPANS: Mutex<Vec<(Address, Address)>> = Mutex::new(Vec::new());

/// Register a raw span (stack slice, saved thread context) as a root
/// for every subsequent check
pub fn register_thread_span(start: Address, end: Address) {
    if start < end {
        THREAD_SPANS.lock().push((start, end));
    }
}

/// Register the calling thread's live stack as a root
///
/// Only the span from the current frame to the stack base is scanned,
/// so stale pointers in dead frames below do not pin allocations. False
/// when region tracking is inactive or the stack region is untracked.
pub fn register_current_thread_stack() -> bool {
    let probe: u8 = 0;
    let top = &probe as *const u8 as Address;
    match regions::find_and_mark_stack_region(top) {
        Some(region) => {
            register_thread_span(top, region.end);
            true
        }
        None => {
            log::warn!("no tracked region holds the current stack; thread not registered");
            false
        }
    }
}

#[cfg(test)]
pub(crate) fn clear_thread_spans() {
    THREAD_SPANS.lock().clear();
}

/// Registered thread stacks and saved contexts
///
/// Threads register themselves; there is no way to suspend and inspect
/// an unregistered thread from inside the process, so a mismatch
/// against the kernel's task count only degrades the check.
pub struct ThreadSpanRoots;

impl RootSource for ThreadSpanRoots {
    fn name(&self) -> &'static str {
        "thread-spans"
    }

    fn collect(&self, out: &mut Vec<RootRange>) -> TraceResult<()> {
        let spans = THREAD_SPANS.lock().clone();
        for (start, end) in &spans {
            out.push(RootRange::new(*start, *end, RootKind::ThreadSpan));
        }
        let tasks = fs::read_dir("/proc/self/task")
            .map_err(|e| TraceError::ThreadEnumeration(e.to_string()))?
            .count();
        if tasks > spans.len() {
            log::warn!(
                "{} of {tasks} threads have registered stack spans; \
                 leaks reachable only from unregistered threads may be misreported",
                spans.len()
            );
        }
        Ok(())
    }
}

/// Caller-supplied ranges, used by embedders and tests
#[derive(Default)]
pub struct ExplicitRoots {
    ranges: Vec<(Address, Address)>,
}

impl ExplicitRoots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, start: Address, end: Address) {
        self.ranges.push((start, end));
    }

    pub fn with(mut self, start: Address, end: Address) -> Self {
        self.add(start, end);
        self
    }
}

impl RootSource for ExplicitRoots {
    fn name(&self) -> &'static str {
        "explicit"
    }

    fn collect(&self, out: &mut Vec<RootRange>) -> TraceResult<()> {
        for (start, end) in &self.ranges {
            out.push(RootRange::new(*start, *end, RootKind::Explicit));
        }
        Ok(())
    }
}
