/*!
 * Profile Dump
 * Textual per-bucket profile plus a memory-map summary
 *
 * Consumed by an external symbolizing tool; the layout is a
 * compatibility surface in structure (ordered bucket records, then a
 * map section), not byte-exact.
 */

use super::AllocationTable;
use crate::core::types::Address;
use crate::regions;
use std::fmt::Write;

struct BucketLine {
    live_count: u64,
    live_bytes: u64,
    allocs: u64,
    alloc_bytes: u64,
    stack: Vec<Address>,
}

impl AllocationTable {
    /// Render the aggregate profile, buckets in descending order of
    /// live bytes, followed by the tracked memory map
    pub fn dump_profile(&self) -> String {
        let mut lines: Vec<BucketLine> = Vec::new();
        let mut total_live = 0u64;
        let mut total_live_bytes = 0u64;
        let mut total_allocs = 0u64;
        let mut total_alloc_bytes = 0u64;
        self.with_inner(|inner| {
            inner.for_each_bucket(|b| {
                total_live += b.live_count();
                total_live_bytes += b.live_bytes();
                total_allocs += b.allocs;
                total_alloc_bytes += b.alloc_bytes;
                lines.push(BucketLine {
                    live_count: b.live_count(),
                    live_bytes: b.live_bytes(),
                    allocs: b.allocs,
                    alloc_bytes: b.alloc_bytes,
                    stack: b.stack().to_vec(),
                });
            });
        });
        lines.sort_by(|a, b| {
            b.live_bytes
                .cmp(&a.live_bytes)
                .then(b.live_count.cmp(&a.live_count))
        });

        let mut out = String::new();
        let _ = writeln!(
            out,
            "heap profile: {total_live:6}: {total_live_bytes:8} [{total_allocs:6}: {total_alloc_bytes:8}] @ heaptrace"
        );
        for line in &lines {
            let _ = write!(
                out,
                "{:6}: {:8} [{:6}: {:8}] @",
                line.live_count, line.live_bytes, line.allocs, line.alloc_bytes
            );
            for frame in &line.stack {
                let _ = write!(out, " {frame:#x}");
            }
            out.push('\n');
        }

        out.push_str("\nMEMORY MAP:\n");
        let wrote_map = regions::with_regions(|iter| {
            let mut section = String::new();
            for r in iter {
                let _ = writeln!(
                    section,
                    "{:#016x}-{:#016x} {:10} bytes{}",
                    r.start,
                    r.end,
                    r.size(),
                    if r.is_stack { " [stack]" } else { "" }
                );
            }
            section
        });
        match wrote_map {
            Some(section) if !section.is_empty() => out.push_str(&section),
            _ => out.push_str("(region tracking inactive)\n"),
        }
        out
    }
}
