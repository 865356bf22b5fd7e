/*!
 * Allocation Snapshots
 * Immutable copies of the table for diffing and leak reporting
 */

use super::{AllocationTable, Bucket};
use crate::cluster::{AddressClusterMap, HeapBacking};
use crate::core::types::{Address, Size, StackHash};
use ahash::AHashMap;
use serde::Serialize;

#[derive(Clone, Copy)]
struct SnapRecord {
    size: Size,
    bucket: *mut Bucket,
}

/// Immutable, independently lived copy of the table's contents
///
/// Borrows the table so bucket references stay valid for the
/// snapshot's whole lifetime; released on drop.
pub struct Snapshot<'t> {
    _table: &'t AllocationTable,
    map: AddressClusterMap<SnapRecord, HeapBacking>,
    total_bytes: u64,
}

/// One reported group: all leaked objects sharing a call stack
#[derive(Debug, Clone, Serialize)]
pub struct LeakEntry {
    pub count: u64,
    pub bytes: u64,
    pub stack_hash: StackHash,
    pub stack: Vec<Address>,
    /// Filled by the symbolizer when available, one per frame
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
}

impl AllocationTable {
    /// Copy of every current record
    pub fn snapshot(&self) -> Snapshot<'_> {
        let mut map = AddressClusterMap::new(HeapBacking);
        let mut total_bytes = 0u64;
        self.with_inner(|inner| {
            inner.map.iterate(|ptr, rec| {
                total_bytes += rec.size as u64;
                map.insert(
                    ptr,
                    SnapRecord {
                        size: rec.size,
                        bucket: rec.bucket,
                    },
                );
            });
        });
        Snapshot {
            _table: self,
            map,
            total_bytes,
        }
    }

    /// Records that are not live, not ignored, and not in `base`
    ///
    /// With no base this is everything currently unreachable; with a
    /// base, everything newly unreachable since the base was taken.
    pub fn non_live_snapshot(&self, base: Option<&Snapshot<'_>>) -> Snapshot<'_> {
        let mut map = AddressClusterMap::new(HeapBacking);
        let mut total_bytes = 0u64;
        self.with_inner(|inner| {
            inner.map.iterate(|ptr, rec| {
                if rec.live || rec.ignore {
                    return;
                }
                if base.is_some_and(|b| b.contains(ptr)) {
                    return;
                }
                total_bytes += rec.size as u64;
                map.insert(
                    ptr,
                    SnapRecord {
                        size: rec.size,
                        bucket: rec.bucket,
                    },
                );
            });
        });
        Snapshot {
            _table: self,
            map,
            total_bytes,
        }
    }
}

impl Snapshot<'_> {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn contains(&self, ptr: Address) -> bool {
        self.map.find(ptr).is_some()
    }

    pub fn size_of(&self, ptr: Address) -> Option<Size> {
        self.map.find(ptr).map(|r| r.size)
    }

    /// Group records by stack-trace bucket, descending by total bytes
    pub fn entries(&mut self) -> Vec<LeakEntry> {
        let mut groups: AHashMap<usize, (u64, u64)> = AHashMap::new();
        self.map.iterate(|_, rec| {
            let g = groups.entry(rec.bucket as usize).or_insert((0, 0));
            g.0 += 1;
            g.1 += rec.size as u64;
        });
        let mut entries: Vec<LeakEntry> = groups
            .into_iter()
            .map(|(bucket, (count, bytes))| {
                let bucket = bucket as *mut Bucket;
                let (stack, stack_hash) =
                    unsafe { ((&*bucket).stack().to_vec(), (&*bucket).hash()) };
                LeakEntry {
                    count,
                    bytes,
                    stack_hash,
                    stack,
                    symbols: Vec::new(),
                }
            })
            .collect();
        entries.sort_by(|a, b| b.bytes.cmp(&a.bytes).then(b.count.cmp(&a.count)));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_independent_of_later_mutation() {
        let table = AllocationTable::new();
        table.record(0x6000_0000, 10, &[0xa]);
        table.record(0x6000_0100, 20, &[0xb]);
        let snap = table.snapshot();
        table.record_free(0x6000_0000);
        table.record(0x6000_0200, 30, &[0xc]);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.total_bytes(), 30);
        assert!(snap.contains(0x6000_0000));
        assert!(!snap.contains(0x6000_0200));
    }

    #[test]
    fn non_live_snapshot_applies_base_and_liveness() {
        let table = AllocationTable::new();
        table.record(0x6000_0000, 10, &[0xa]); // in base
        let base = table.snapshot();
        table.record(0x6000_0100, 20, &[0xb]); // will be live
        table.record(0x6000_0200, 30, &[0xc]); // leaked
        table.mark_live(0x6000_0100);
        let diff = table.non_live_snapshot(Some(&base));
        assert_eq!(diff.len(), 1);
        assert!(diff.contains(0x6000_0200));
        assert_eq!(diff.total_bytes(), 30);
        // without a base, everything not live shows up
        let all = table.non_live_snapshot(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all.total_bytes(), 40);
    }

    #[test]
    fn entries_group_and_sort_by_bytes() {
        let table = AllocationTable::new();
        table.record(0x6000_0000, 10, &[0xa, 0xb]);
        table.record(0x6000_0100, 10, &[0xa, 0xb]);
        table.record(0x6000_0200, 100, &[0xc]);
        let mut snap = table.non_live_snapshot(None);
        let entries = snap.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].bytes, 100);
        assert_eq!(entries[0].stack, vec![0xc]);
        assert_eq!(entries[1].count, 2);
        assert_eq!(entries[1].bytes, 20);
    }
}
