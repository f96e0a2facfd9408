use chap_address_map::AddressMap;
use chap_allocator_finder::{read_chunk_header, ChunkHeader, IS_MMAPPED};
use chap_diagnostics::{AnalysisConfig, PointerWidth};
use chap_vm_partition::{PermissionClass, VmPartition};

use crate::finder_trait::AllocationFinder;

/// Scans the remaining unclaimed writable ranges for page-aligned chunks
/// whose first word is zero and whose second word's low 12 bits equal
/// `IS_MMAPPED` exactly, with size at least `min_mmapped_allocation_size`.
/// The caller claims each recognized chunk's span from the partition as
/// it advances past it (see `current_span`).
pub struct MmappedFinder<'a> {
    map: &'a AddressMap,
    width: PointerWidth,
    min_size: u64,
    candidates: Vec<(u64, u64)>,
    index: usize,
    current: Option<ChunkHeader>,
}

impl<'a> MmappedFinder<'a> {
    #[must_use]
    pub fn new(map: &'a AddressMap, width: PointerWidth, partition: &VmPartition, config: &AnalysisConfig) -> Self {
        let candidates: Vec<(u64, u64)> =
            partition.unclaimed(PermissionClass::Writable).iter().map(|(base, size, _)| (base, size)).collect();
        let mut finder = Self { map, width, min_size: config.min_mmapped_allocation_size, candidates, index: 0, current: None };
        finder.load_current();
        finder
    }

    fn load_current(&mut self) {
        while self.index < self.candidates.len() {
            let (base, size) = self.candidates[self.index];
            if let Some(header) = self.scan_range(base, size) {
                self.current = Some(header);
                return;
            }
            self.index += 1;
        }
        self.current = None;
    }

    fn scan_range(&self, base: u64, size: u64) -> Option<ChunkHeader> {
        let page = 0x1000u64;
        const PAGE_FLAG_BITS: u64 = 0xfff;
        let limit = base + size;
        let mut addr = base.div_ceil(page) * page;
        while addr + 2 * self.width.size_of_ptr() <= limit {
            if self.map.read_word(addr) == Some(0) {
                if let Some(header) = read_chunk_header(self.map, addr, self.width) {
                    let size_field_raw = self.map.read_word(addr + self.width.size_of_ptr()).unwrap_or(0);
                    let is_mmapped = size_field_raw & PAGE_FLAG_BITS == IS_MMAPPED;
                    if is_mmapped && header.size() >= self.min_size {
                        return Some(header);
                    }
                }
            }
            addr += page;
        }
        None
    }

    /// The `[base, base+size)` span occupied by the chunk currently at the
    /// front of this finder, for the caller to claim before advancing.
    #[must_use]
    pub fn current_span(&self) -> Option<(u64, u64)> {
        self.current.map(|h| (h.chunk_base, h.size()))
    }
}

impl<'a> AllocationFinder for MmappedFinder<'a> {
    fn finished(&self) -> bool {
        self.current.is_none()
    }

    fn next_address(&self) -> u64 {
        self.current.expect("finished() must be checked before next_address()").user_address(self.width)
    }

    fn next_size(&self) -> u64 {
        self.current.expect("finished() must be checked before next_size()").usable_size(self.width)
    }

    fn next_is_used(&self) -> bool {
        true
    }

    fn advance(&mut self) {
        let header = self.current.expect("finished() must be checked before advance()");
        let (base, size) = self.candidates[self.index];
        let limit = base + size;
        let next_base = header.chunk_base + header.size();
        self.candidates[self.index] = (next_base, limit.saturating_sub(next_base));
        self.load_current();
    }

    fn min_request_size(&self, size: u64) -> u64 {
        size.saturating_sub(0xfff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chap_address_map::{Range, RangeFlags};

    fn range(base: u64, size: u64, bytes: Vec<u8>) -> Range {
        Range::new(base, size, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE | RangeFlags::IS_WRITABLE, Some(bytes))
    }

    #[test]
    fn finds_mmapped_chunk_at_page_boundary() {
        let base = 0x7f0000000000u64;
        let mut bytes = vec![0u8; 0x1000];
        // chunk header at page start: prev_size=0, size=0x1000|IS_MMAPPED(0x2)
        bytes[8..16].copy_from_slice(&(0x1000u64 | 0x2).to_le_bytes());
        let map = AddressMap::new(vec![range(base, 0x1000, bytes)], PointerWidth::Bits64).unwrap();
        let partition = VmPartition::new(&map);
        let config = AnalysisConfig::for_pointer_width(PointerWidth::Bits64);

        let finder = MmappedFinder::new(&map, PointerWidth::Bits64, &partition, &config);
        assert!(!finder.finished());
        assert_eq!(finder.next_size(), 0x1000 - 8);
    }
}
