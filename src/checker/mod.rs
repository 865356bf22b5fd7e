/*!
 * Leak Checker
 * Conservative whole-heap and scoped leak detection
 *
 * A checker walks Created, Armed, Checking, Checked in order and is
 * destroyed on drop. Arming a scoped checker snapshots the table so
 * only allocations made afterwards are judged; a whole-program checker
 * has no baseline and judges everything. Checks are serialized process
 * wide, and only one whole-program checker may ever exist.
 */

mod flood;
mod report;
mod roots;
mod symbolize;

pub use report::LeakReport;
pub use roots::{
    register_current_thread_stack, register_thread_span, ExplicitRoots, ModuleDataRoots,
    RootKind, RootRange, RootSource, ThreadSpanRoots,
};

use crate::bootstrap::{Arena, ArenaFlags};
use crate::config::CheckConfig;
use crate::core::errors::{TraceError, TraceResult};
use crate::fatal;
use crate::table::{AllocationTable, Snapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;

/// Serializes checks; concurrent floods would fight over live marks
static CHECK_GATE: Mutex<()> = Mutex::new(());

static WHOLE_PROGRAM_EXISTS: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckState {
    Created,
    Armed,
    Checking,
    Checked,
}

impl CheckState {
    fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Armed => "armed",
            Self::Checking => "checking",
            Self::Checked => "checked",
        }
    }
}

/// One leak check over an allocation table
pub struct LeakChecker<'t> {
    name: String,
    table: &'t AllocationTable,
    config: CheckConfig,
    state: CheckState,
    whole_program: bool,
    baseline: Option<Snapshot<'t>>,
    sources: Vec<Box<dyn RootSource>>,
    report: Option<LeakReport>,
}

impl<'t> LeakChecker<'t> {
    /// Scoped checker: judges allocations made after [`arm`](Self::arm)
    pub fn new(name: impl Into<String>, table: &'t AllocationTable, config: CheckConfig) -> Self {
        Self {
            name: name.into(),
            table,
            config,
            state: CheckState::Created,
            whole_program: false,
            baseline: None,
            sources: Vec::new(),
            report: None,
        }
    }

    /// Whole-program checker: no baseline, judges every allocation
    ///
    /// At most one per process lifetime.
    pub fn whole_program(table: &'t AllocationTable, config: CheckConfig) -> TraceResult<Self> {
        if WHOLE_PROGRAM_EXISTS.swap(true, Ordering::AcqRel) {
            return Err(TraceError::WholeProgramCheckerExists);
        }
        let mut checker = Self::new("whole-program", table, config);
        checker.whole_program = true;
        Ok(checker)
    }

    /// Add a root source on top of the defaults
    pub fn add_root_source(&mut self, source: Box<dyn RootSource>) {
        self.sources.push(source);
    }

    /// Start the watch window; scoped checkers snapshot the table here
    pub fn arm(&mut self) -> TraceResult<()> {
        if self.state != CheckState::Created {
            return Err(TraceError::InvalidCheckState {
                state: self.state.name(),
                operation: "arm",
            });
        }
        if !self.whole_program {
            self.baseline = Some(self.table.snapshot());
        }
        self.state = CheckState::Armed;
        log::debug!("leak checker \"{}\" armed", self.name);
        Ok(())
    }

    /// Run the check: flood from the roots, report what stayed dark
    pub fn check(&mut self) -> TraceResult<LeakReport> {
        if self.state != CheckState::Armed {
            return Err(TraceError::InvalidCheckState {
                state: self.state.name(),
                operation: "check",
            });
        }
        let _gate = CHECK_GATE.lock();
        self.state = CheckState::Checking;

        self.table.unmark_all_live();
        let (root_ranges, degraded) = self.gather_roots();

        // Frontier bookkeeping lives in its own arena; anything left in
        // it after the flood is the checker leaking, which disqualifies
        // every report it could ever make.
        let scratch = Arena::new(ArenaFlags::default(), None);
        let stats = flood::flood(self.table, &root_ranges, &scratch, self.config.alignment);
        log::debug!(
            "flood scanned {} words, marked {} objects / {} bytes",
            stats.scanned_words,
            stats.marked_objects,
            stats.marked_bytes
        );

        let mut leaks = self.table.non_live_snapshot(self.baseline.as_ref());
        let (leaked_objects, leaked_bytes) = (leaks.len() as u64, leaks.total_bytes());
        let mut entries = leaks.entries();
        drop(leaks);

        if self.config.alt_alignment_diagnostic && self.config.alignment != 1 && leaked_objects > 0
        {
            self.table.unmark_all_live();
            self.table
                .collect_object_roots(&self.config.trusted_ranges, self.config.trusted_depth);
            flood::flood(self.table, &root_ranges, &scratch, 1);
            let alt = self.table.non_live_snapshot(self.baseline.as_ref());
            log::info!(
                "alignment diagnostic: {} objects unreachable at word alignment, {} at byte \
                 alignment",
                leaked_objects,
                alt.len()
            );
        }

        if !scratch.delete() {
            fatal!("checker", "scratch arena still holds allocations after the flood");
        }

        if let (Some(program), false) = (self.config.symbolizer.clone(), entries.is_empty()) {
            if let Err(e) = symbolize::symbolize_entries(&mut entries, &program) {
                log::warn!("symbolization skipped, reporting raw addresses: {e}");
            }
        }

        let report = LeakReport::new(
            self.name.clone(),
            leaked_objects,
            leaked_bytes,
            entries,
            self.config.max_leak_traces,
            degraded,
        );
        self.state = CheckState::Checked;
        self.report = Some(report.clone());
        Ok(report)
    }

    /// Run the check and apply the configured leak action
    pub fn check_and_enforce(&mut self) -> TraceResult<LeakReport> {
        let report = self.check()?;
        report.enforce(self.config.on_leak);
        Ok(report)
    }

    /// Bytes found leaked, once checked
    pub fn leaked_bytes(&self) -> Option<u64> {
        self.report.as_ref().map(|r| r.leaked_bytes)
    }

    /// Objects found leaked, once checked
    pub fn leaked_objects(&self) -> Option<u64> {
        self.report.as_ref().map(|r| r.leaked_objects)
    }

    pub fn report(&self) -> Option<&LeakReport> {
        self.report.as_ref()
    }

    /// Default sources, caller sources, then object-content roots
    fn gather_roots(&self) -> (Vec<RootRange>, Vec<String>) {
        let mut ranges = Vec::new();
        let mut degraded = Vec::new();
        let module_roots = ModuleDataRoots::new();
        let thread_roots = ThreadSpanRoots;
        let mut defaults: Vec<&dyn RootSource> = Vec::new();
        if self.config.scan_globals {
            defaults.push(&module_roots);
        }
        defaults.push(&thread_roots);
        for source in defaults
            .into_iter()
            .chain(self.sources.iter().map(|s| s.as_ref() as &dyn RootSource))
        {
            if let Err(e) = source.collect(&mut ranges) {
                log::warn!("root source {} failed, precision reduced: {e}", source.name());
                degraded.push(format!("{}: {e}", source.name()));
            }
        }
        for (base, size) in self
            .table
            .collect_object_roots(&self.config.trusted_ranges, self.config.trusted_depth)
        {
            ranges.push(RootRange::new(base, base + size, RootKind::ObjectContents));
        }
        (ranges, degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckConfig;
    use crate::core::types::WORD_SIZE;
    use pretty_assertions::assert_eq;

    fn quiet_config() -> CheckConfig {
        CheckConfig::default()
            .with_scan_globals(false)
            .with_on_leak(crate::config::LeakAction::Report)
    }

    #[test]
    fn state_machine_rejects_out_of_order_calls() {
        let table = AllocationTable::new();
        let mut checker = LeakChecker::new("order", &table, quiet_config());
        assert!(matches!(
            checker.check(),
            Err(TraceError::InvalidCheckState {
                state: "created",
                operation: "check"
            })
        ));
        checker.arm().unwrap();
        assert!(matches!(
            checker.arm(),
            Err(TraceError::InvalidCheckState { .. })
        ));
        checker.check().unwrap();
        assert!(matches!(
            checker.check(),
            Err(TraceError::InvalidCheckState {
                state: "checked",
                operation: "check"
            })
        ));
    }

    #[test]
    fn baseline_excludes_prior_allocations() {
        roots::clear_thread_spans();
        let table = AllocationTable::new();
        let before: Box<u64> = Box::new(1);
        let before_addr = &*before as *const u64 as usize;
        table.record(before_addr, 8, &[0x1]);

        let mut checker = LeakChecker::new("scoped", &table, quiet_config());
        checker.arm().unwrap();

        let after: Box<u64> = Box::new(2);
        let after_addr = &*after as *const u64 as usize;
        table.record(after_addr, 8, &[0x2]);

        let report = checker.check().unwrap();
        assert_eq!(report.leaked_objects, 1);
        assert_eq!(report.leaked_bytes, 8);
        assert_eq!(report.entries[0].stack, vec![0x2]);
        drop((before, after));
    }

    #[test]
    fn explicit_roots_keep_allocations_out_of_the_report() {
        roots::clear_thread_spans();
        let table = AllocationTable::new();
        let kept: Box<u64> = Box::new(3);
        let kept_addr = &*kept as *const u64 as usize;
        let lost: Box<u64> = Box::new(4);
        let lost_addr = &*lost as *const u64 as usize;
        table.record(kept_addr, 8, &[0xa]);
        table.record(lost_addr, 8, &[0xb]);

        let slot: usize = kept_addr;
        let slot_addr = &slot as *const usize as usize;
        let mut checker = LeakChecker::new("rooted", &table, quiet_config());
        checker.add_root_source(Box::new(
            ExplicitRoots::new().with(slot_addr, slot_addr + WORD_SIZE),
        ));
        checker.arm().unwrap();
        let report = checker.check().unwrap();
        assert_eq!(report.leaked_objects, 0);
        drop((kept, lost));
    }

    #[test]
    fn ignored_allocations_root_their_contents() {
        roots::clear_thread_spans();
        let table = AllocationTable::new();
        let target: Box<u64> = Box::new(5);
        let target_addr = &*target as *const u64 as usize;
        let holder: Box<usize> = Box::new(target_addr);
        let holder_addr = &*holder as *const usize as usize;
        table.record(holder_addr, WORD_SIZE, &[0x1]);
        table.record(target_addr, 8, &[0x2]);
        table.mark_ignored(holder_addr);

        let mut checker = LeakChecker::new("ignored", &table, quiet_config());
        checker.arm().unwrap();
        let report = checker.check().unwrap();
        // holder is excluded as ignored; target survives through it
        assert_eq!(report.leaked_objects, 0);
        drop((target, holder));
    }
}
