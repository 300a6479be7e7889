//! Segment tables: per-type coalesced half-open ranges used by the router to
//! decide reachability for a `(local_addr, remote_addr, len)` triple.
//!
//! Grounded in `original_source/src/hixl/common/segment.h` (`Segment`) and
//! `original_source/src/llm_datadist/adxl/segment_table.h`.

use crate::memory::MemType;
use std::collections::HashMap;

/// A coalesced set of `[start, end)` ranges for one memory type.
#[derive(Debug, Default, Clone)]
pub struct Segment {
    ranges: Vec<(u64, u64)>,
}

impl Segment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `[start, end)`, merging with any adjacent or overlapping
    /// range so the set stays coalesced and sorted.
    pub fn add_range(&mut self, start: u64, end: u64) {
        let idx = self.ranges.partition_point(|&(s, _)| s <= start);
        self.ranges.insert(idx, (start, end));
        self.coalesce();
    }

    /// Removes `[start, end)`, splitting any range that only partially
    /// overlaps it.
    pub fn remove_range(&mut self, start: u64, end: u64) {
        let mut result = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            if e <= start || s >= end {
                result.push((s, e));
                continue;
            }
            if s < start {
                result.push((s, start));
            }
            if e > end {
                result.push((end, e));
            }
        }
        self.ranges = result;
    }

    /// Whether `[addr, addr+len)` is fully contained within one coalesced
    /// range.
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        let end = addr + len;
        let idx = match self.ranges.binary_search_by(|&(s, _)| s.cmp(&addr)) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        };
        idx.map(|i| {
            let (s, e) = self.ranges[i];
            s <= addr && end <= e
        })
        .unwrap_or(false)
    }

    fn coalesce(&mut self) {
        self.ranges.sort_unstable_by_key(|&(s, _)| s);
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            match merged.last_mut() {
                Some(last) if s <= last.1 => {
                    last.1 = last.1.max(e);
                }
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;
    }
}

/// A segment table indexed by memory type, as maintained per-peer by the
/// client for both local and remote reachability (§4.5, step 6).
#[derive(Debug, Default)]
pub struct SegmentTable {
    by_type: HashMap<MemType, Segment>,
}

impl SegmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mem_type: MemType, start: u64, end: u64) {
        self.by_type.entry(mem_type).or_default().add_range(start, end);
    }

    pub fn remove(&mut self, mem_type: MemType, start: u64, end: u64) {
        if let Some(segment) = self.by_type.get_mut(&mem_type) {
            segment.remove_range(start, end);
        }
    }

    pub fn mem_type_of(&self, addr: u64, len: u64) -> Option<MemType> {
        [MemType::Host, MemType::Device]
            .into_iter()
            .find(|ty| self.by_type.get(ty).is_some_and(|s| s.contains(addr, len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_adjacent_ranges() {
        let mut seg = Segment::new();
        seg.add_range(0, 100);
        seg.add_range(100, 200);
        assert!(seg.contains(50, 100));
        assert_eq!(seg.ranges, vec![(0, 200)]);
    }

    #[test]
    fn remove_splits_a_range() {
        let mut seg = Segment::new();
        seg.add_range(0, 300);
        seg.remove_range(100, 200);
        assert!(seg.contains(0, 100));
        assert!(!seg.contains(50, 100));
        assert!(seg.contains(200, 100));
    }

    #[test]
    fn segment_table_routes_by_type() {
        let mut table = SegmentTable::new();
        table.add(MemType::Host, 0x1000, 0x2000);
        table.add(MemType::Device, 0x5000, 0x6000);
        assert_eq!(table.mem_type_of(0x1000, 0x10), Some(MemType::Host));
        assert_eq!(table.mem_type_of(0x5000, 0x10), Some(MemType::Device));
        assert_eq!(table.mem_type_of(0x9000, 0x10), None);
    }
}
