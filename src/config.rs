/*!
 * Check Configuration
 * Programmatic defaults with environment-variable overrides
 */

use crate::core::types::{Address, Size, MAX_STACK_DEPTH, WORD_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What to do when a check finds leaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeakAction {
    /// Fatal abort with diagnostic
    Abort,
    /// Exit with the configured non-zero code
    Exit { code: i32 },
    /// Leave the decision to the caller
    Report,
}

/// Leak-check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Recorded call-stack depth, clamped to the hard cap
    pub max_stack_depth: usize,
    /// Pointer-alignment assumption for the conservative scan; word
    /// size by default, 1 to catch unaligned pointers at higher cost
    pub alignment: Size,
    /// Scan writable global/static data of loaded modules as roots
    pub scan_globals: bool,
    /// Cap on distinct call stacks in a report
    pub max_leak_traces: usize,
    pub on_leak: LeakAction,
    /// External symbolizer binary; addresses go in one per line in hex,
    /// symbol names come back one per line in order
    pub symbolizer: Option<PathBuf>,
    /// Code ranges whose allocations count as heuristic roots
    pub trusted_ranges: Vec<(Address, Address)>,
    /// How many leading frames of a record's stack are tested against
    /// the trusted ranges
    pub trusted_depth: usize,
    /// Re-run the flood with byte alignment and log the difference;
    /// informational only
    pub alt_alignment_diagnostic: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            max_stack_depth: MAX_STACK_DEPTH,
            alignment: WORD_SIZE,
            scan_globals: true,
            max_leak_traces: 20,
            on_leak: LeakAction::Abort,
            symbolizer: None,
            trusted_ranges: Vec::new(),
            trusted_depth: 2,
            alt_alignment_diagnostic: false,
        }
    }
}

impl CheckConfig {
    /// Defaults overridden by `HEAPTRACE_*` environment variables
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<usize>("HEAPTRACE_MAX_DEPTH") {
            cfg.max_stack_depth = v.min(MAX_STACK_DEPTH);
        }
        if let Some(v) = env_parse::<usize>("HEAPTRACE_ALIGNMENT") {
            if v == 1 || v == WORD_SIZE {
                cfg.alignment = v;
            } else {
                log::warn!("HEAPTRACE_ALIGNMENT must be 1 or {WORD_SIZE}, ignoring {v}");
            }
        }
        if let Some(v) = env_parse::<bool>("HEAPTRACE_SCAN_GLOBALS") {
            cfg.scan_globals = v;
        }
        if let Some(v) = env_parse::<usize>("HEAPTRACE_MAX_TRACES") {
            cfg.max_leak_traces = v;
        }
        if let Ok(v) = std::env::var("HEAPTRACE_ON_LEAK") {
            match v.as_str() {
                "abort" => cfg.on_leak = LeakAction::Abort,
                "report" => cfg.on_leak = LeakAction::Report,
                other => match other.strip_prefix("exit:").and_then(|c| c.parse().ok()) {
                    Some(code) => cfg.on_leak = LeakAction::Exit { code },
                    None => log::warn!("unrecognized HEAPTRACE_ON_LEAK value: {other}"),
                },
            }
        }
        if let Ok(v) = std::env::var("HEAPTRACE_SYMBOLIZER") {
            if !v.is_empty() {
                cfg.symbolizer = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = env_parse::<bool>("HEAPTRACE_ALT_ALIGNMENT") {
            cfg.alt_alignment_diagnostic = v;
        }
        cfg
    }

    pub fn with_alignment(mut self, alignment: Size) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_scan_globals(mut self, scan: bool) -> Self {
        self.scan_globals = scan;
        self
    }

    pub fn with_on_leak(mut self, action: LeakAction) -> Self {
        self.on_leak = action;
        self
    }

    pub fn with_trusted_range(mut self, start: Address, end: Address) -> Self {
        self.trusted_ranges.push((start, end));
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("invalid {name} value: {raw}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CheckConfig::default();
        assert_eq!(cfg.alignment, WORD_SIZE);
        assert!(cfg.scan_globals);
        assert_eq!(cfg.on_leak, LeakAction::Abort);
    }
}
