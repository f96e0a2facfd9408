use std::collections::BTreeMap;

use chap_address_map::AddressMap;
use chap_diagnostics::PointerWidth;

use crate::chunk::{self, SIZE_MASK};

/// Largest chunk size glibc will ever place on a fast bin (the classic
/// 64-bit default; used only as a plausibility bound during offset voting,
/// never to reject a real fast-bin chunk during traversal).
const MAX_FASTBIN_CHUNK_SIZE: u64 = 0x420;

/// Byte offsets of the fields of interest inside an opaque `malloc_state`-
/// shaped structure, derived by voting across every known arena rather
/// than assumed from a particular glibc version's struct layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaOffsets {
    pub top: Option<u64>,
    pub next: Option<u64>,
    pub first_free_list: Option<u64>,
    pub last_free_list: Option<u64>,
    pub fast_bin_start: Option<u64>,
}

impl ArenaOffsets {
    #[must_use]
    pub fn is_fully_derived(&self) -> bool {
        self.top.is_some() && self.next.is_some()
    }

    /// A conservative upper bound on the size of the opaque `malloc_state`
    /// structure: one pointer-size past the highest derived field offset,
    /// rounded up to chunk alignment. Used to skip past a non-main arena's
    /// struct when walking the chunks of its first heap, since this crate
    /// never derives (or needs) the struct's true `sizeof`.
    #[must_use]
    pub fn struct_size_estimate(&self, width: PointerWidth) -> u64 {
        let highest =
            [self.top, self.next, self.first_free_list, self.last_free_list, self.fast_bin_start].into_iter().flatten().max().unwrap_or(0);
        let raw = highest + width.size_of_ptr();
        let align = width.chunk_alignment();
        raw.div_ceil(align) * align
    }
}

/// Upper bound, in bytes, of the candidate-offset search window. Wide
/// enough to cover glibc's `malloc_state` (fastbins, top, last_remainder,
/// 127 bin head pairs, binmap, next, next_free, attached_threads,
/// system_mem, max_system_mem) with headroom for layout drift across
/// glibc versions.
const SEARCH_WINDOW: u64 = 0x900;

fn candidate_offsets(width: PointerWidth) -> impl Iterator<Item = u64> {
    let step = width.size_of_ptr();
    (0..SEARCH_WINDOW).step_by(step as usize)
}

fn winning_candidate(votes: BTreeMap<u64, usize>) -> Option<u64> {
    votes.into_iter().max_by_key(|&(offset, count)| (count, std::cmp::Reverse(offset))).map(|(offset, _)| offset)
}

/// *top*: read candidate word X; the size field one pointer past X, masked
/// to a glibc chunk size, added back to X, must land on a page boundary.
#[must_use]
pub fn derive_top_offset(arenas: &[u64], map: &AddressMap, width: PointerWidth) -> Option<u64> {
    let mut votes = BTreeMap::new();
    for &arena in arenas {
        for offset in candidate_offsets(width) {
            let Some(top) = map.read_word(arena + offset) else { continue };
            if top == 0 || !width.is_aligned(top) {
                continue;
            }
            let Some(size_field) = map.read_word(top + width.size_of_ptr()) else { continue };
            let size = size_field & SIZE_MASK;
            if size != 0 && top.wrapping_add(size) % 0x1000 == 0 {
                *votes.entry(offset).or_insert(0) += 1;
            }
        }
    }
    winning_candidate(votes)
}

/// *next*: non-zero, pointer-aligned, and lands on another (or the same)
/// known arena address.
#[must_use]
pub fn derive_next_offset(arenas: &[u64], map: &AddressMap, width: PointerWidth) -> Option<u64> {
    let mut votes = BTreeMap::new();
    for &arena in arenas {
        for offset in candidate_offsets(width) {
            let Some(next) = map.read_word(arena + offset) else { continue };
            if next != 0 && width.is_aligned(next) && arenas.contains(&next) {
                *votes.entry(offset).or_insert(0) += 1;
            }
        }
    }
    winning_candidate(votes)
}

/// A free-list head field (first or last bin): either empty
/// (`next==self && prev==self`) or a consistent two-way link.
fn derive_free_list_offset(arenas: &[u64], map: &AddressMap, width: PointerWidth, exclude: Option<u64>) -> Option<u64> {
    let mut votes = BTreeMap::new();
    for &arena in arenas {
        for offset in candidate_offsets(width) {
            if exclude == Some(offset) {
                continue;
            }
            let addr = arena + offset;
            let Some(head) = crate::chunk::read_free_list_head(map, addr, width) else { continue };
            if head.is_consistent(addr, map, width) {
                *votes.entry(offset).or_insert(0) += 1;
            }
        }
    }
    winning_candidate(votes)
}

/// *fast-bin start*: a fast-bin head slot is plausible if it is null
/// (empty bin) or points to a small, non-mmapped chunk.
fn derive_fast_bin_offset(arenas: &[u64], map: &AddressMap, width: PointerWidth) -> Option<u64> {
    let mut votes = BTreeMap::new();
    for &arena in arenas {
        for offset in candidate_offsets(width) {
            let Some(head) = map.read_word(arena + offset) else { continue };
            let plausible = head == 0
                || (width.is_aligned(head)
                    && chunk::read_chunk_header(map, head, width)
                        .is_some_and(|h| !h.is_mmapped() && h.size() != 0 && h.size() <= MAX_FASTBIN_CHUNK_SIZE));
            if plausible {
                *votes.entry(offset).or_insert(0) += 1;
            }
        }
    }
    winning_candidate(votes)
}

#[must_use]
pub fn derive_offsets(arenas: &[u64], map: &AddressMap, width: PointerWidth) -> ArenaOffsets {
    let top = derive_top_offset(arenas, map, width);
    let next = derive_next_offset(arenas, map, width);
    let first_free_list = derive_free_list_offset(arenas, map, width, None);
    let last_free_list = derive_free_list_offset(arenas, map, width, first_free_list);
    let fast_bin_start = derive_fast_bin_offset(arenas, map, width);
    ArenaOffsets { top, next, first_free_list, last_free_list, fast_bin_start }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chap_address_map::{Range, RangeFlags};

    fn map_with_words_at(entries: &[(u64, u64)]) -> AddressMap {
        let mut ranges = Vec::new();
        for &(base, word) in entries {
            ranges.push(Range::new(base, 8, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE | RangeFlags::IS_WRITABLE, Some(word.to_le_bytes().to_vec())));
        }
        AddressMap::new(ranges, PointerWidth::Bits64).unwrap()
    }

    #[test]
    fn next_offset_wins_on_self_pointing_arena() {
        let arena = 0x7f0000400000u64;
        let offset = 0x880u64;
        let map = map_with_words_at(&[(arena + offset, arena)]);
        assert_eq!(derive_next_offset(&[arena], &map, PointerWidth::Bits64), Some(offset));
    }

    #[test]
    fn top_offset_wins_when_page_aligned_size_lands() {
        let arena = 0x7f0000400000u64;
        let top_offset = 0x40u64;
        let top = 0x7f0000500000u64;
        // size field one word past `top`; chunk size 0x1000 makes top+size page-aligned.
        let map = map_with_words_at(&[(arena + top_offset, top), (top + 8, 0x1000)]);
        assert_eq!(derive_top_offset(&[arena], &map, PointerWidth::Bits64), Some(top_offset));
    }
}
