use bitflags::bitflags;

use crate::finder_id::FinderId;

bitflags! {
    /// The flag bits packed alongside an allocation's size. `THREAD_CACHED`
    /// implies not `USED`; `WRAPPER` and `WRAPPED` are set by the merge
    /// (§4.5) as nesting is discovered, never by a finder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u64 {
        const USED = 1 << 0;
        const THREAD_CACHED = 1 << 1;
        const WRAPPER = 1 << 2;
        const WRAPPED = 1 << 3;
    }
}

const SIZE_BITS: u32 = 52;
const SIZE_MASK: u64 = (1 << SIZE_BITS) - 1;
const FLAGS_SHIFT: u32 = SIZE_BITS;
const FLAGS_MASK: u64 = 0xf << FLAGS_SHIFT;
const FINDER_SHIFT: u32 = SIZE_BITS + 4;
const FINDER_MASK: u64 = 0xff << FINDER_SHIFT;

/// One allocation: its address plus a packed word carrying byte size,
/// status flags, and the producing finder's identity. The packing mirrors
/// the source's cache-motivated layout; every caller goes through the
/// accessor methods rather than the raw word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub address: u64,
    size_and_bits: u64,
}

impl AllocationRecord {
    #[must_use]
    pub fn new(address: u64, size: u64, flags: RecordFlags, finder: FinderId) -> Self {
        debug_assert!(size <= SIZE_MASK, "allocation size exceeds the packed record's bit budget");
        let packed = (size & SIZE_MASK) | ((flags.bits() << FLAGS_SHIFT) & FLAGS_MASK) | ((u64::from(finder.value()) << FINDER_SHIFT) & FINDER_MASK);
        Self { address, size_and_bits: packed }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size_and_bits & SIZE_MASK
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.address + self.size()
    }

    #[must_use]
    pub fn flags(&self) -> RecordFlags {
        RecordFlags::from_bits_truncate((self.size_and_bits & FLAGS_MASK) >> FLAGS_SHIFT)
    }

    pub fn set_flags(&mut self, flags: RecordFlags) {
        self.size_and_bits = (self.size_and_bits & !FLAGS_MASK) | ((flags.bits() << FLAGS_SHIFT) & FLAGS_MASK);
    }

    #[must_use]
    pub fn finder(&self) -> FinderId {
        FinderId::new(((self.size_and_bits & FINDER_MASK) >> FINDER_SHIFT) as u8)
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        self.flags().contains(RecordFlags::USED)
    }

    #[must_use]
    pub fn is_wrapper(&self) -> bool {
        self.flags().contains(RecordFlags::WRAPPER)
    }

    #[must_use]
    pub fn is_wrapped(&self) -> bool {
        self.flags().contains(RecordFlags::WRAPPED)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.limit()
    }
}
