use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chap_allocation_finders::AllocationFinder;

use crate::finder_id::FinderId;
use crate::record::{AllocationRecord, RecordFlags};

/// Accumulates finder output into address-ordered, wrapper-aware records.
/// `open` is the stack of still-open (not yet fully passed) records,
/// outermost first; an incoming candidate whose limit falls at or before
/// the top of that stack is nested inside it.
struct Merger {
    records: Vec<AllocationRecord>,
    open: Vec<usize>,
}

impl Merger {
    fn new() -> Self {
        Self { records: Vec::new(), open: Vec::new() }
    }

    fn consume(&mut self, address: u64, size: u64, is_used: bool, finder: FinderId) {
        let limit = address + size;
        while let Some(&top) = self.open.last() {
            if self.records[top].limit() <= address {
                self.open.pop();
            } else {
                break;
            }
        }

        let mut flags = if is_used { RecordFlags::USED } else { RecordFlags::empty() };
        if let Some(&top) = self.open.last() {
            if limit <= self.records[top].limit() {
                flags |= RecordFlags::WRAPPED;
                let idx = self.records.len();
                self.records.push(AllocationRecord::new(address, size, flags, finder));
                let mut outer_flags = self.records[top].flags();
                outer_flags.insert(RecordFlags::WRAPPER);
                self.records[top].set_flags(outer_flags);
                self.open.push(idx);
                return;
            }
        }

        let idx = self.records.len();
        self.records.push(AllocationRecord::new(address, size, flags, finder));
        self.open.push(idx);
    }
}

/// Total order used to pick the next candidate across finders: ascending
/// address, ties broken toward the larger size so that, at a shared
/// address, the larger allocation is consumed first and the smaller is
/// correctly recognized as nested inside it.
fn candidate_order(a_addr: u64, a_size: u64, b_addr: u64, b_size: u64) -> Ordering {
    a_addr.cmp(&b_addr).then_with(|| b_size.cmp(&a_size))
}

fn merge_single(mut finder: Box<dyn AllocationFinder + '_>, id: FinderId) -> Vec<AllocationRecord> {
    let mut merger = Merger::new();
    while !finder.finished() {
        merger.consume(finder.next_address(), finder.next_size(), finder.next_is_used(), id);
        finder.advance();
    }
    merger.records
}

fn merge_pair(mut a: (FinderId, Box<dyn AllocationFinder + '_>), mut b: (FinderId, Box<dyn AllocationFinder + '_>)) -> Vec<AllocationRecord> {
    let mut merger = Merger::new();
    loop {
        match (a.1.finished(), b.1.finished()) {
            (true, true) => break,
            (true, false) => {
                merger.consume(b.1.next_address(), b.1.next_size(), b.1.next_is_used(), b.0);
                b.1.advance();
            }
            (false, true) => {
                merger.consume(a.1.next_address(), a.1.next_size(), a.1.next_is_used(), a.0);
                a.1.advance();
            }
            (false, false) => {
                if candidate_order(a.1.next_address(), a.1.next_size(), b.1.next_address(), b.1.next_size()) != Ordering::Greater {
                    merger.consume(a.1.next_address(), a.1.next_size(), a.1.next_is_used(), a.0);
                    a.1.advance();
                } else {
                    merger.consume(b.1.next_address(), b.1.next_size(), b.1.next_is_used(), b.0);
                    b.1.advance();
                }
            }
        }
    }
    merger.records
}

struct HeapEntry {
    address: u64,
    size: u64,
    slot: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.size == other.size
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert candidate_order so the
        // logically-smallest candidate (by address, then larger size) is
        // the one that compares greatest and therefore pops first.
        candidate_order(other.address, other.size, self.address, self.size)
    }
}

fn merge_many(mut finders: Vec<(FinderId, Box<dyn AllocationFinder + '_>)>) -> Vec<AllocationRecord> {
    let mut merger = Merger::new();
    let mut heap = BinaryHeap::with_capacity(finders.len());
    for (slot, (_, finder)) in finders.iter().enumerate() {
        if !finder.finished() {
            heap.push(HeapEntry { address: finder.next_address(), size: finder.next_size(), slot });
        }
    }

    let mut last_slot: Option<usize> = None;
    while let Some(top) = heap.pop() {
        let (id, finder) = &mut finders[top.slot];
        merger.consume(finder.next_address(), finder.next_size(), finder.next_is_used(), *id);
        finder.advance();
        last_slot = Some(top.slot);
        if !finder.finished() {
            // Fast path: a finder whose own next report is still the
            // smallest overall (the common case of one finder dominating
            // a run) gets re-pushed and immediately re-popped by the next
            // iteration without disturbing the rest of the heap's shape
            // any more than a single sift would.
            heap.push(HeapEntry { address: finder.next_address(), size: finder.next_size(), slot: top.slot });
        }
    }
    let _ = last_slot;
    merger.records
}

/// Merges every active finder's strictly-ascending allocation stream into
/// one address-ordered, wrapper-aware record vector, using the selection
/// strategy appropriate to how many finders are still producing: direct
/// consumption for one, pairwise interleave for two, a min-heap for more.
#[must_use]
pub fn merge_allocations<'a>(finders: Vec<(FinderId, Box<dyn AllocationFinder + 'a>)>) -> Vec<AllocationRecord> {
    let mut active: Vec<(FinderId, Box<dyn AllocationFinder + 'a>)> = finders.into_iter().filter(|(_, f)| !f.finished()).collect();
    match active.len() {
        0 => Vec::new(),
        1 => {
            let (id, finder) = active.pop().expect("checked len == 1");
            merge_single(finder, id)
        }
        2 => {
            let b = active.pop().expect("checked len == 2");
            let a = active.pop().expect("checked len == 2");
            merge_pair(a, b)
        }
        _ => merge_many(active),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecFinder {
        items: Vec<(u64, u64, bool)>,
        index: usize,
    }

    impl AllocationFinder for VecFinder {
        fn finished(&self) -> bool {
            self.index >= self.items.len()
        }
        fn next_address(&self) -> u64 {
            self.items[self.index].0
        }
        fn next_size(&self) -> u64 {
            self.items[self.index].1
        }
        fn next_is_used(&self) -> bool {
            self.items[self.index].2
        }
        fn advance(&mut self) {
            self.index += 1;
        }
        fn min_request_size(&self, size: u64) -> u64 {
            size
        }
    }

    fn finder(items: &[(u64, u64, bool)]) -> Box<dyn AllocationFinder> {
        Box::new(VecFinder { items: items.to_vec(), index: 0 })
    }

    #[test]
    fn single_finder_produces_plain_records() {
        let finders = vec![(FinderId::new(0), finder(&[(0x1000, 0x20, true), (0x1030, 0x10, false)]))];
        let records = merge_allocations(finders);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].address, 0x1000);
        assert!(records[0].is_used());
        assert!(!records[0].is_wrapper());
        assert!(!records[1].is_used());
    }

    #[test]
    fn nested_wrapper_is_marked_on_both_sides() {
        // Finder A reports (0x2000, 0x1000); finder B reports
        // (0x2020, 0x100), which lies strictly inside A's span.
        let finders = vec![
            (FinderId::new(0), finder(&[(0x2000, 0x1000, true)])),
            (FinderId::new(1), finder(&[(0x2020, 0x100, true)])),
        ];
        let records = merge_allocations(finders);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].address, 0x2000);
        assert!(records[0].is_wrapper());
        assert!(!records[0].is_wrapped());
        assert_eq!(records[1].address, 0x2020);
        assert!(records[1].is_wrapped());
        assert!(!records[1].is_wrapper());
    }

    #[test]
    fn three_way_merge_preserves_global_address_order() {
        let finders = vec![
            (FinderId::new(0), finder(&[(0x1000, 0x10, true), (0x4000, 0x10, true)])),
            (FinderId::new(1), finder(&[(0x2000, 0x10, true)])),
            (FinderId::new(2), finder(&[(0x3000, 0x10, true)])),
        ];
        let records = merge_allocations(finders);
        let addresses: Vec<u64> = records.iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![0x1000, 0x2000, 0x3000, 0x4000]);
    }

    #[test]
    fn larger_same_address_allocation_wins_over_smaller() {
        let finders = vec![
            (FinderId::new(0), finder(&[(0x5000, 0x10, true)])),
            (FinderId::new(1), finder(&[(0x5000, 0x40, true)])),
        ];
        let records = merge_allocations(finders);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].size(), 0x40);
        assert!(records[0].is_wrapper());
        assert_eq!(records[1].size(), 0x10);
        assert!(records[1].is_wrapped());
    }
}
