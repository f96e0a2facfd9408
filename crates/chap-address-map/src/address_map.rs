use chap_diagnostics::{NotMapped, PointerWidth};

use crate::range::Range;

/// A finite, ordered sequence of non-overlapping ranges covering whatever
/// part of a process's virtual address space was captured. Immutable after
/// construction: built once from the core's program headers (and any
/// supplementary `/proc/<pid>/maps`-style metadata) and then queried for
/// the rest of the analysis.
#[derive(Debug, Clone)]
pub struct AddressMap {
    ranges: Vec<Range>,
    pointer_width: PointerWidth,
}

impl AddressMap {
    /// Build a map from an unordered set of ranges. Ranges must already be
    /// disjoint; overlapping input indicates a malformed core and is
    /// rejected with `None` rather than silently dropping data.
    #[must_use]
    pub fn new(mut ranges: Vec<Range>, pointer_width: PointerWidth) -> Option<Self> {
        ranges.sort_by_key(|r| r.base);
        for pair in ranges.windows(2) {
            if pair[0].limit() > pair[1].base {
                return None;
            }
        }
        Some(Self { ranges, pointer_width })
    }

    #[must_use]
    pub fn pointer_width(&self) -> PointerWidth {
        self.pointer_width
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The range containing `address`, if any, found in O(log n).
    #[must_use]
    pub fn find(&self, address: u64) -> Option<&Range> {
        match self.ranges.binary_search_by(|r| {
            if address < r.base {
                std::cmp::Ordering::Greater
            } else if address >= r.limit() {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        }) {
            Ok(idx) => Some(&self.ranges[idx]),
            Err(_) => None,
        }
    }

    #[must_use]
    pub fn is_mapped(&self, address: u64) -> bool {
        self.find(address).is_some_and(Range::is_mapped)
    }

    /// Ranges in ascending address order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Range> {
        self.ranges.iter()
    }

    /// Read `len` bytes at `address`. `None` if any byte of the request
    /// falls outside a captured range — the common case when scanning
    /// allocation contents for plausible outgoing references, where an
    /// unmapped target just means "not a pointer".
    #[must_use]
    pub fn read_bytes(&self, address: u64, len: u64) -> Option<&[u8]> {
        self.find(address).and_then(|r| r.read_bytes(address, len))
    }

    /// Read a pointer-sized little-endian word at `address`.
    #[must_use]
    pub fn read_word(&self, address: u64) -> Option<u64> {
        let size = self.pointer_width.size_of_ptr();
        let bytes = self.read_bytes(address, size)?;
        Some(match self.pointer_width {
            PointerWidth::Bits64 => u64::from_le_bytes(bytes.try_into().unwrap()),
            PointerWidth::Bits32 => u32::from_le_bytes(bytes.try_into().unwrap()) as u64,
        })
    }

    /// Read a pointer-sized word, surfacing the typed `NotMapped` condition
    /// instead of collapsing a miss to `None`, for callers that want to
    /// report the offending address rather than silently treat it as "not
    /// a pointer".
    pub fn try_read_word(&self, address: u64) -> Result<u64, NotMapped> {
        self.read_word(address).ok_or(NotMapped(address))
    }

    #[must_use]
    pub fn read_u32(&self, address: u64) -> Option<u32> {
        let bytes = self.read_bytes(address, 4)?;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    #[must_use]
    pub fn read_u64(&self, address: u64) -> Option<u64> {
        let bytes = self.read_bytes(address, 8)?;
        Some(u64::from_le_bytes(bytes.try_into().unwrap()))
    }
}
