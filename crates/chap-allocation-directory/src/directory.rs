use std::collections::BTreeSet;

use chap_allocation_finders::AllocationFinder;
use chap_diagnostics::{DiagnosticEvent, DiagnosticSink, Subsystem};

use crate::finder_id::FinderId;
use crate::merge::merge_allocations;
use crate::record::{AllocationRecord, RecordFlags};

/// The directory's one-way lifecycle: no finder may be added, and no new
/// allocation may appear, once boundaries are resolved; no used/free
/// status may change once free status is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryState {
    Unresolved,
    BoundariesResolved,
    FreeStatusFinalized,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("cannot add a finder after allocation boundaries are resolved")]
    BoundariesAlreadyResolved,
    #[error("operation requires allocation boundaries to be resolved first")]
    BoundariesNotYetResolved,
    #[error("free status has already been finalized")]
    FreeStatusAlreadyFinalized,
}

/// An append-only, address-ordered vector of allocation records built by
/// merging every registered finder, plus a secondary per-depth index of
/// wrapper allocations used to resolve point-in-allocation queries that
/// fall inside a wrapper but outside every entry the primary binary
/// search can see directly.
pub struct AllocationDirectory<'a> {
    state: DirectoryState,
    pending: Vec<(FinderId, Box<dyn AllocationFinder + 'a>)>,
    next_finder_id: u16,
    records: Vec<AllocationRecord>,
    wrappers: Vec<Vec<usize>>,
    boundaries_resolved_callbacks: Vec<Box<dyn FnMut(&[AllocationRecord]) + 'a>>,
}

impl<'a> Default for AllocationDirectory<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> AllocationDirectory<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DirectoryState::Unresolved,
            pending: Vec::new(),
            next_finder_id: 0,
            records: Vec::new(),
            wrappers: Vec::new(),
            boundaries_resolved_callbacks: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> DirectoryState {
        self.state
    }

    /// Registers a finder and returns the `FinderId` its records will
    /// carry. Fails once boundaries are resolved.
    pub fn add_finder(&mut self, finder: Box<dyn AllocationFinder + 'a>) -> Result<FinderId, DirectoryError> {
        if self.state != DirectoryState::Unresolved {
            return Err(DirectoryError::BoundariesAlreadyResolved);
        }
        let id = FinderId::new(self.next_finder_id.min(u16::from(FinderId::MAX)) as u8);
        self.next_finder_id += 1;
        self.pending.push((id, finder));
        Ok(id)
    }

    /// Registers a callback invoked once, with the finalized record
    /// vector, at the moment boundaries resolve.
    pub fn on_boundaries_resolved(&mut self, callback: impl FnMut(&[AllocationRecord]) + 'a) {
        self.boundaries_resolved_callbacks.push(Box::new(callback));
    }

    /// Drains every registered finder via the multi-way merge (§4.5),
    /// builds the wrapper-depth index, fires boundaries-resolved
    /// callbacks, and transitions the directory out of `Unresolved`.
    pub fn resolve_boundaries(&mut self) -> Result<(), DirectoryError> {
        if self.state != DirectoryState::Unresolved {
            return Err(DirectoryError::BoundariesAlreadyResolved);
        }
        let pending = std::mem::take(&mut self.pending);
        self.records = merge_allocations(pending);
        self.wrappers = build_wrapper_index(&self.records);
        self.state = DirectoryState::BoundariesResolved;
        for callback in &mut self.boundaries_resolved_callbacks {
            callback(&self.records);
        }
        Ok(())
    }

    /// Clears the `USED` flag on every record whose address is in
    /// `now_free` (as discovered by the fast-bin fixer or a DLL
    /// corruption check), then finalizes free status. May only run once,
    /// after boundaries are resolved.
    pub fn finalize_free_status(&mut self, now_free: &BTreeSet<u64>, sink: &dyn DiagnosticSink) -> Result<(), DirectoryError> {
        match self.state {
            DirectoryState::Unresolved => return Err(DirectoryError::BoundariesNotYetResolved),
            DirectoryState::FreeStatusFinalized => return Err(DirectoryError::FreeStatusAlreadyFinalized),
            DirectoryState::BoundariesResolved => {}
        }
        for &address in now_free {
            match self.allocation_index_of(address) {
                Some(idx) if self.records[idx].address == address => {
                    let mut flags = self.records[idx].flags();
                    flags.remove(RecordFlags::USED);
                    self.records[idx].set_flags(flags);
                }
                _ => {
                    sink.report(DiagnosticEvent::at(Subsystem::Merge, address, "free-status update does not match a known allocation"));
                }
            }
        }
        self.state = DirectoryState::FreeStatusFinalized;
        Ok(())
    }

    #[must_use]
    pub fn records(&self) -> &[AllocationRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Resolves an address to the innermost allocation (wrapper or leaf)
    /// that contains it: a direct binary search of the primary vector,
    /// falling back to the wrapper-depth index, outermost first, for
    /// addresses that fall in a wrapper's span but outside any entry the
    /// primary search can see.
    #[must_use]
    pub fn allocation_index_of(&self, address: u64) -> Option<usize> {
        if let Some(idx) = direct_containing(&self.records, address) {
            return Some(idx);
        }
        for depth in &self.wrappers {
            if let Some(idx) = wrapper_depth_containing(&self.records, depth, address) {
                return Some(idx);
            }
        }
        None
    }
}

fn floor_index_in_records(records: &[AllocationRecord], address: u64) -> Option<usize> {
    match records.binary_search_by(|r| r.address.cmp(&address)) {
        Ok(i) => Some(i),
        Err(0) => None,
        Err(i) => Some(i - 1),
    }
}

fn direct_containing(records: &[AllocationRecord], address: u64) -> Option<usize> {
    let idx = floor_index_in_records(records, address)?;
    if records[idx].contains(address) {
        Some(idx)
    } else {
        None
    }
}

/// `depth_indices` holds record indices in ascending-address order (they
/// were appended to a wrapper-depth bucket in address-scan order during
/// `build_wrapper_index`).
fn wrapper_depth_containing(records: &[AllocationRecord], depth_indices: &[usize], address: u64) -> Option<usize> {
    let pos = depth_indices.partition_point(|&i| records[i].address <= address);
    if pos == 0 {
        return None;
    }
    let idx = depth_indices[pos - 1];
    if records[idx].contains(address) {
        Some(idx)
    } else {
        None
    }
}

fn build_wrapper_index(records: &[AllocationRecord]) -> Vec<Vec<usize>> {
    let mut wrappers: Vec<Vec<usize>> = Vec::new();
    let mut open: Vec<(usize, u64)> = Vec::new();
    for (idx, record) in records.iter().enumerate() {
        while let Some(&(_, limit)) = open.last() {
            if limit <= record.address {
                open.pop();
            } else {
                break;
            }
        }
        if record.is_wrapper() {
            let depth = open.len();
            if wrappers.len() <= depth {
                wrappers.resize_with(depth + 1, Vec::new);
            }
            wrappers[depth].push(idx);
            open.push((idx, record.limit()));
        }
    }
    wrappers
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
    fn nested_lookup_resolves_inner_and_outer() {
        let mut dir = AllocationDirectory::new();
        dir.add_finder(finder(&[(0x2000, 0x1000, true)])).unwrap();
        dir.add_finder(finder(&[(0x2020, 0x100, true)])).unwrap();
        dir.resolve_boundaries().unwrap();

        assert_eq!(dir.len(), 2);
        assert_eq!(dir.allocation_index_of(0x2030), Some(1));
        assert_eq!(dir.allocation_index_of(0x2800), Some(0));
    }

    #[test]
    fn cannot_add_finder_after_boundaries_resolved() {
        let mut dir = AllocationDirectory::new();
        dir.add_finder(finder(&[(0x1000, 0x10, true)])).unwrap();
        dir.resolve_boundaries().unwrap();
        assert_eq!(dir.add_finder(finder(&[(0x2000, 0x10, true)])), Err(DirectoryError::BoundariesAlreadyResolved));
    }

    #[test]
    fn finalize_free_status_clears_used_flag() {
        let mut dir = AllocationDirectory::new();
        dir.add_finder(finder(&[(0x1000, 0x10, true)])).unwrap();
        dir.resolve_boundaries().unwrap();
        let sink = chap_diagnostics::CollectingDiagnosticSink::new();
        let now_free: BTreeSet<u64> = [0x1000].into_iter().collect();
        dir.finalize_free_status(&now_free, &sink).unwrap();
        assert!(!dir.records()[0].is_used());
        assert_eq!(dir.finalize_free_status(&now_free, &sink), Err(DirectoryError::FreeStatusAlreadyFinalized));
    }
}
