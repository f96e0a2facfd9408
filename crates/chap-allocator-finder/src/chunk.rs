use chap_address_map::AddressMap;
use chap_diagnostics::PointerWidth;

/// glibc's low three chunk-size flag bits, per the malloc ABI.
pub const PREV_INUSE: u64 = 0x1;
pub const IS_MMAPPED: u64 = 0x2;
pub const NON_MAIN_ARENA: u64 = 0x4;
pub const SIZE_MASK: u64 = !0x7;

/// The header of one libc chunk: the `size` word (prev_size precedes it
/// but is only meaningful when the previous chunk is free, so it is not
/// modeled here). `chunk_base` is the address of the `prev_size` field,
/// i.e. two pointer-sizes before the user data address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_base: u64,
    size_field: u64,
}

impl ChunkHeader {
    #[must_use]
    pub fn size(self) -> u64 {
        self.size_field & SIZE_MASK
    }

    #[must_use]
    pub fn prev_inuse(self) -> bool {
        self.size_field & PREV_INUSE != 0
    }

    #[must_use]
    pub fn is_mmapped(self) -> bool {
        self.size_field & IS_MMAPPED != 0
    }

    #[must_use]
    pub fn non_main_arena(self) -> bool {
        self.size_field & NON_MAIN_ARENA != 0
    }

    /// The address handed back to the allocation's caller.
    #[must_use]
    pub fn user_address(self, width: PointerWidth) -> u64 {
        self.chunk_base + width.chunk_alignment()
    }

    /// The number of bytes usable by the caller: one pointer-size of
    /// overhead, not two, since the final word of this chunk's nominal
    /// size doubles as the next chunk's `prev_size` field whenever this
    /// chunk is in use.
    #[must_use]
    pub fn usable_size(self, width: PointerWidth) -> u64 {
        self.size().saturating_sub(width.size_of_ptr())
    }

    #[must_use]
    pub fn next_chunk_base(self) -> u64 {
        self.chunk_base + self.size()
    }
}

/// Read the chunk header at `chunk_base`. Returns `None` if the size word
/// itself isn't mapped; does not otherwise validate the chunk.
#[must_use]
pub fn read_chunk_header(map: &AddressMap, chunk_base: u64, width: PointerWidth) -> Option<ChunkHeader> {
    let size_field = map.read_word(chunk_base + width.size_of_ptr())?;
    Some(ChunkHeader { chunk_base, size_field })
}

/// A chunk header is consistent with an ordinary main-arena allocation:
/// not mmapped, not owned by a secondary arena, and aligned to twice the
/// pointer size (glibc's minimum chunk alignment).
#[must_use]
pub fn is_plausible_main_arena_chunk(header: ChunkHeader, width: PointerWidth) -> bool {
    !header.is_mmapped() && !header.non_main_arena() && header.size() % width.chunk_alignment() == 0 && header.size() != 0
}

/// One slot of a doubly-linked free list: `(next, prev)`, each a pointer
/// sized word, `next` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeListHead {
    pub next: u64,
    pub prev: u64,
}

#[must_use]
pub fn read_free_list_head(map: &AddressMap, address: u64, width: PointerWidth) -> Option<FreeListHead> {
    let next = map.read_word(address)?;
    let prev = map.read_word(address + width.size_of_ptr())?;
    Some(FreeListHead { next, prev })
}

impl FreeListHead {
    /// Empty: both fields point back to this head. Non-empty: the chain on
    /// either side closes correctly (`next.prev == self && prev.next ==
    /// self`). `self_addr` is this head's own address.
    #[must_use]
    pub fn is_consistent(self, self_addr: u64, map: &AddressMap, width: PointerWidth) -> bool {
        if self.next == self_addr && self.prev == self_addr {
            return true;
        }
        if self.next == 0 || self.prev == 0 {
            return false;
        }
        let next_prev = map.read_word(self.next + width.size_of_ptr());
        let prev_next = map.read_word(self.prev);
        next_prev == Some(self_addr) && prev_next == Some(self_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chap_address_map::{AddressMap, Range, RangeFlags};

    fn map_with_words(base: u64, words: &[u64]) -> AddressMap {
        let mut bytes = Vec::with_capacity(words.len() * 8);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let size = bytes.len() as u64;
        let range = Range::new(base, size, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE | RangeFlags::IS_WRITABLE, Some(bytes));
        AddressMap::new(vec![range], PointerWidth::Bits64).unwrap()
    }

    #[test]
    fn usable_size_and_user_address_match_three_chunk_run() {
        // chunk at 0x1000: prev_size=0, size=0x21 (PREV_INUSE set)
        let map = map_with_words(0x1000, &[0, 0x21]);
        let header = read_chunk_header(&map, 0x1000, PointerWidth::Bits64).unwrap();
        assert_eq!(header.size(), 0x20);
        assert!(header.prev_inuse());
        assert_eq!(header.user_address(PointerWidth::Bits64), 0x1010);
        assert_eq!(header.usable_size(PointerWidth::Bits64), 0x18);
        assert_eq!(header.next_chunk_base(), 0x1020);
    }

    #[test]
    fn mmapped_and_non_main_arena_chunks_are_not_plausible_main_arena() {
        let map = map_with_words(0x1000, &[0, 0x20 | IS_MMAPPED]);
        let header = read_chunk_header(&map, 0x1000, PointerWidth::Bits64).unwrap();
        assert!(!is_plausible_main_arena_chunk(header, PointerWidth::Bits64));

        let map = map_with_words(0x1000, &[0, 0x20 | NON_MAIN_ARENA]);
        let header = read_chunk_header(&map, 0x1000, PointerWidth::Bits64).unwrap();
        assert!(!is_plausible_main_arena_chunk(header, PointerWidth::Bits64));
    }

    #[test]
    fn empty_free_list_head_is_self_consistent() {
        let map = map_with_words(0x2000, &[0x2000, 0x2000]);
        let head = read_free_list_head(&map, 0x2000, PointerWidth::Bits64).unwrap();
        assert!(head.is_consistent(0x2000, &map, PointerWidth::Bits64));
    }
}
