/*!
 * Leak Reports
 * What a finished check found, and what to do about it
 */

use crate::config::LeakAction;
use crate::table::LeakEntry;
use std::fmt::Write;
use serde::Serialize;

/// Outcome of one leak check
#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    /// Name of the checker that produced this report
    pub name: String,
    pub leaked_objects: u64,
    pub leaked_bytes: u64,
    /// Distinct call stacks, descending by leaked bytes, capped by the
    /// configured trace limit
    pub entries: Vec<LeakEntry>,
    /// Stacks beyond the cap; their objects and bytes still count in
    /// the totals
    pub suppressed_traces: usize,
    /// Root sources that failed during discovery; a non-empty list
    /// means reduced precision, not a failed check
    pub degraded: Vec<String>,
}

impl LeakReport {
    pub(crate) fn new(
        name: String,
        leaked_objects: u64,
        leaked_bytes: u64,
        mut entries: Vec<LeakEntry>,
        max_traces: usize,
        degraded: Vec<String>,
    ) -> Self {
        let suppressed_traces = entries.len().saturating_sub(max_traces);
        entries.truncate(max_traces);
        Self {
            name,
            leaked_objects,
            leaked_bytes,
            entries,
            suppressed_traces,
            degraded,
        }
    }

    pub fn has_leaks(&self) -> bool {
        self.leaked_objects > 0
    }

    /// Machine-readable rendering for log shipping and tooling
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Human-readable report
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "leak check \"{}\": {} bytes in {} objects unreachable",
            self.name, self.leaked_bytes, self.leaked_objects
        );
        for entry in &self.entries {
            let _ = write!(out, "  {} bytes in {} objects @", entry.bytes, entry.count);
            for (i, frame) in entry.stack.iter().enumerate() {
                match entry.symbols.get(i) {
                    Some(sym) => {
                        let _ = write!(out, " {sym}");
                    }
                    None => {
                        let _ = write!(out, " {frame:#x}");
                    }
                }
            }
            out.push('\n');
        }
        if self.suppressed_traces > 0 {
            let _ = writeln!(out, "  ({} further stacks suppressed)", self.suppressed_traces);
        }
        for note in &self.degraded {
            let _ = writeln!(out, "  warning: {note}");
        }
        out
    }

    /// Apply the configured consequence of a leaky check
    pub fn enforce(&self, action: LeakAction) {
        if !self.has_leaks() {
            return;
        }
        match action {
            LeakAction::Abort => {
                eprintln!("{}", self.render());
                log::error!(
                    "leak check \"{}\" failed: {} bytes in {} objects",
                    self.name,
                    self.leaked_bytes,
                    self.leaked_objects
                );
                std::process::abort();
            }
            LeakAction::Exit { code } => {
                eprintln!("{}", self.render());
                std::process::exit(code);
            }
            LeakAction::Report => {
                log::warn!(
                    "leak check \"{}\": {} bytes in {} objects unreachable",
                    self.name,
                    self.leaked_bytes,
                    self.leaked_objects
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(bytes: u64, count: u64, stack: Vec<usize>) -> LeakEntry {
        LeakEntry {
            count,
            bytes,
            stack_hash: 0,
            stack,
            symbols: Vec::new(),
        }
    }

    #[test]
    fn trace_cap_counts_suppressed() {
        let report = LeakReport::new(
            "t".into(),
            5,
            500,
            vec![
                entry(300, 1, vec![0x1]),
                entry(150, 2, vec![0x2]),
                entry(50, 2, vec![0x3]),
            ],
            2,
            Vec::new(),
        );
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.suppressed_traces, 1);
        // totals still cover every stack
        assert_eq!(report.leaked_bytes, 500);
        let text = report.render();
        assert!(text.contains("500 bytes in 5 objects"));
        assert!(text.contains("(1 further stacks suppressed)"));
        let json = report.to_json();
        assert!(json.contains("\"leaked_bytes\": 500"));
    }

    #[test]
    fn clean_report_has_no_leaks() {
        let report = LeakReport::new("clean".into(), 0, 0, Vec::new(), 20, Vec::new());
        assert!(!report.has_leaks());
        // enforce must be a no-op on a clean report
        report.enforce(LeakAction::Abort);
    }
}
