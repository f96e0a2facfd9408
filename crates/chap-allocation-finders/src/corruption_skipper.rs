use chap_address_map::AddressMap;
use chap_allocator_finder::{is_plausible_main_arena_chunk, read_chunk_header};
use chap_diagnostics::PointerWidth;

/// Find a resumption point after a corruption at `corruption` (`C`), no
/// further than `repair_limit` (`L`): the earliest plausible chunk start
/// in `(C, L]` reached by walking forward from `corruption` a pointer-size
/// at a time and testing each candidate as a libc chunk header whose
/// implied end does not exceed `L`. Returns 0 if nothing plausible turns
/// up, per the "report, don't fail" policy — callers treat that as "end
/// this heap".
#[must_use]
pub fn skip_corruption(map: &AddressMap, width: PointerWidth, corruption: u64, repair_limit: u64) -> u64 {
    let ptr = width.size_of_ptr();
    let mut candidate = corruption + ptr;
    while candidate <= repair_limit {
        if let Some(header) = read_chunk_header(map, candidate, width) {
            if is_plausible_main_arena_chunk(header, width) && header.next_chunk_base() <= repair_limit {
                return candidate;
            }
        }
        candidate += ptr;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chap_address_map::{Range, RangeFlags};

    #[test]
    fn finds_next_plausible_chunk_after_garbage() {
        let base = 0x7f0000000000u64;
        // garbage word at base, then a plausible chunk header at base+8.
        let words = [0xdead_beefu64, 0, 0x10];
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let range = Range::new(base, bytes.len() as u64, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE | RangeFlags::IS_WRITABLE, Some(bytes));
        let map = AddressMap::new(vec![range], PointerWidth::Bits64).unwrap();

        let resume = skip_corruption(&map, PointerWidth::Bits64, base, base + 24);
        assert_eq!(resume, base + 8);
    }

    #[test]
    fn returns_zero_when_nothing_plausible() {
        let base = 0x7f0000000000u64;
        let map = AddressMap::new(vec![], PointerWidth::Bits64).unwrap();
        assert_eq!(skip_corruption(&map, PointerWidth::Bits64, base, base + 0x1000), 0);
    }
}
