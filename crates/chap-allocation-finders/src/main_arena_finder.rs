use chap_address_map::AddressMap;
use chap_allocator_finder::{read_chunk_header, ChunkHeader};
use chap_diagnostics::PointerWidth;

use crate::corruption_skipper::skip_corruption;
use crate::finder_trait::AllocationFinder;

/// Walks one claimed main-arena page run with the same chunk-walking
/// discipline as [`crate::heap_finder::HeapFinder`], but with the
/// stricter "this chunk belongs to the main arena" flag check applied by
/// [`chap_allocator_finder::is_plausible_main_arena_chunk`] on every step
/// rather than only at corruption-recovery points.
pub struct MainArenaFinder<'a> {
    map: &'a AddressMap,
    width: PointerWidth,
    top: Option<u64>,
    cursor: u64,
    limit: u64,
    current: Option<(ChunkHeader, bool)>,
}

impl<'a> MainArenaFinder<'a> {
    #[must_use]
    pub fn new(map: &'a AddressMap, width: PointerWidth, run_base: u64, run_limit: u64, top: Option<u64>) -> Self {
        let mut finder = Self { map, width, top, cursor: run_base, limit: run_limit, current: None };
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
            if header.size() == 0
                || header.is_mmapped()
                || header.non_main_arena()
                || header.next_chunk_base() > self.limit
            {
                let resume = skip_corruption(self.map, self.width, self.cursor, self.limit);
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

impl<'a> AllocationFinder for MainArenaFinder<'a> {
    fn finished(&self) -> bool {
        self.current.is_none()
    }

    fn next_address(&self) -> u64 {
        self.current.expect("finished() must be checked before next_address()").0.user_address(self.width)
    }

    fn next_size(&self) -> u64 {
        self.current.expect("finished() must be checked before next_size()").0.usable_size(self.width)
    }

    fn next_is_used(&self) -> bool {
        self.current.expect("finished() must be checked before next_is_used()").1
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

    #[test]
    fn parses_single_chunk_in_page_run() {
        let base = 0x7f0000000000u64;
        let words = [0u64, 0x21];
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let range = Range::new(base, bytes.len() as u64, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE | RangeFlags::IS_WRITABLE, Some(bytes));
        let map = AddressMap::new(vec![range], PointerWidth::Bits64).unwrap();

        let finder = MainArenaFinder::new(&map, PointerWidth::Bits64, base, base + 32, None);
        assert!(!finder.finished());
        assert_eq!(finder.next_size(), 0x18);
    }

    #[test]
    fn top_chunk_is_not_reported() {
        // Three chunks at 0x1000, 0x1020, 0x1050 with sizes 0x20, 0x30,
        // 0xfb0; the last is top and must not be emitted as an allocation.
        let base = 0x1000u64;
        let mut bytes = vec![0u8; 0x1000];
        bytes[8..16].copy_from_slice(&0x20u64.to_le_bytes());
        bytes[0x28..0x30].copy_from_slice(&0x31u64.to_le_bytes());
        bytes[0x58..0x60].copy_from_slice(&0xfb0u64.to_le_bytes());
        let range = Range::new(base, bytes.len() as u64, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE | RangeFlags::IS_WRITABLE, Some(bytes));
        let map = AddressMap::new(vec![range], PointerWidth::Bits64).unwrap();

        let mut finder = MainArenaFinder::new(&map, PointerWidth::Bits64, base, base + 0x1000, Some(0x1050));
        assert_eq!(finder.next_address(), 0x1010);
        assert_eq!(finder.next_size(), 0x18);
        finder.advance();
        assert_eq!(finder.next_address(), 0x1030);
        assert_eq!(finder.next_size(), 0x28);
        finder.advance();
        assert!(finder.finished());
    }
}
