use chap_address_map::AddressMap;
use chap_allocator_finder::{read_chunk_header, ArenaOffsets, ChunkHeader, Heap};
use chap_diagnostics::PointerWidth;

use crate::corruption_skipper::skip_corruption;
use crate::finder_trait::AllocationFinder;

/// Walks one detected heap's chunks in address order, skipping the heap
/// header and — for the first heap of a non-main arena — the arena struct
/// that follows it. Used/free status comes from the *next* chunk's
/// `PREV_INUSE` bit, so the finder always looks one chunk ahead.
pub struct HeapFinder<'a> {
    map: &'a AddressMap,
    width: PointerWidth,
    top: Option<u64>,
    cursor: u64,
    limit: u64,
    current: Option<(ChunkHeader, bool)>,
    repair_limit: u64,
}

impl<'a> HeapFinder<'a> {
    #[must_use]
    pub fn new(map: &'a AddressMap, width: PointerWidth, heap: &Heap, offsets: &ArenaOffsets, is_first_heap_of_non_main_arena: bool, top: Option<u64>) -> Self {
        let ptr = width.size_of_ptr();
        let mut cursor = heap.base + 4 * ptr;
        if is_first_heap_of_non_main_arena {
            cursor += offsets.struct_size_estimate(width);
        }
        let limit = heap.limit();
        let mut finder = Self { map, width, top, cursor, limit, current: None, repair_limit: limit };
        finder.load_current();
        finder
    }

    fn load_current(&mut self) {
        loop {
            if self.cursor >= self.limit {
                self.current = None;
                return;
            }
            if Some(self.cursor) == self.top {
                self.current = None;
                return;
            }
            let Some(header) = read_chunk_header(self.map, self.cursor, self.width) else {
                self.current = None;
                return;
            };
            if header.size() == 0 || header.is_mmapped() || header.next_chunk_base() > self.limit {
                let resume = skip_corruption(self.map, self.width, self.cursor, self.repair_limit);
                if resume == 0 || resume <= self.cursor {
                    self.current = None;
                    return;
                }
                self.cursor = resume;
                continue;
            }
            let next_base = header.next_chunk_base();
            let used = if Some(next_base) == self.top {
                true
            } else {
                match read_chunk_header(self.map, next_base, self.width) {
                    Some(next_header) => next_header.prev_inuse(),
                    None => true,
                }
            };
            self.current = Some((header, used));
            return;
        }
    }
}

impl<'a> AllocationFinder for HeapFinder<'a> {
    fn finished(&self) -> bool {
        self.current.is_none()
    }

    fn next_address(&self) -> u64 {
        let (header, _) = self.current.expect("finished() must be checked before next_address()");
        header.user_address(self.width)
    }

    fn next_size(&self) -> u64 {
        let (header, _) = self.current.expect("finished() must be checked before next_size()");
        header.usable_size(self.width)
    }

    fn next_is_used(&self) -> bool {
        let (_, used) = self.current.expect("finished() must be checked before next_is_used()");
        used
    }

    fn advance(&mut self) {
        let (header, _) = self.current.expect("finished() must be checked before advance()");
        self.cursor = header.next_chunk_base();
        self.load_current();
    }

    fn min_request_size(&self, size: u64) -> u64 {
        size.saturating_sub(0x1f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chap_address_map::{Range, RangeFlags};

    fn words_range(base: u64, words: &[u64]) -> Range {
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        Range::new(base, bytes.len() as u64, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE | RangeFlags::IS_WRITABLE, Some(bytes))
    }

    #[test]
    fn walks_two_chunks_and_derives_used_status() {
        let heap_base = 0x7f0000000000u64;
        // heap header (4 words), then chunk at +0x20 size 0x20 (used, since
        // next chunk's PREV_INUSE is set), then chunk at +0x40 with
        // PREV_INUSE set meaning the first chunk is in use.
        let words = [
            0, 0, 0x1000, 0x1000, // heap_info
            0, 0x21, // chunk 1: prev_size=0, size=0x20|PREV_INUSE
            0, 0x21, // chunk 2: prev_size=0, size=0x20|PREV_INUSE -> chunk1 used
        ];
        let map = AddressMap::new(vec![words_range(heap_base, &words)], PointerWidth::Bits64).unwrap();
        let heap = Heap { base: heap_base, cur_size: 0x40, prev_heap: 0, arena_address: Some(heap_base + 0x20), missing_or_unfilled_header: false };
        let offsets = ArenaOffsets::default();
        let mut finder = HeapFinder::new(&map, PointerWidth::Bits64, &heap, &offsets, false, None);

        assert!(!finder.finished());
        assert_eq!(finder.next_address(), heap_base + 0x20 + 0x10);
        assert_eq!(finder.next_size(), 0x18);
        assert!(finder.next_is_used());
        finder.advance();
        assert!(finder.finished());
    }
}
