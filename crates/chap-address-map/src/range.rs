use bitflags::bitflags;

bitflags! {
    /// Permission and mapping-status bits for a single range of the
    /// captured address space. `HAS_KNOWN_PERMISSIONS` distinguishes a
    /// range whose read/write/execute bits came from the core's own
    /// mapping metadata from one synthesized for a region (e.g. an
    /// anonymous heap segment) where permissions had to be assumed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct RangeFlags: u8 {
        const IS_READABLE          = 1 << 0;
        const IS_WRITABLE          = 1 << 1;
        const IS_EXECUTABLE        = 1 << 2;
        const HAS_KNOWN_PERMISSIONS = 1 << 3;
        const IS_MAPPED            = 1 << 4;
    }
}

/// One contiguous, non-overlapping span of the captured address space.
/// `image` holds the captured bytes when the range was backed by the core
/// file; `None` means the range is known to be mapped (e.g. from `/proc`
/// metadata supplied separately) but its contents were not captured.
#[derive(Debug, Clone)]
pub struct Range {
    pub base: u64,
    pub size: u64,
    pub flags: RangeFlags,
    pub image: Option<Vec<u8>>,
}

impl Range {
    #[must_use]
    pub fn new(base: u64, size: u64, flags: RangeFlags, image: Option<Vec<u8>>) -> Self {
        Self { base, size, flags, image }
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.base + self.size
    }

    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.limit()
    }

    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.flags.contains(RangeFlags::IS_READABLE)
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.flags.contains(RangeFlags::IS_WRITABLE)
    }

    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.flags.contains(RangeFlags::IS_EXECUTABLE)
    }

    #[must_use]
    pub fn has_known_permissions(&self) -> bool {
        self.flags.contains(RangeFlags::HAS_KNOWN_PERMISSIONS)
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.flags.contains(RangeFlags::IS_MAPPED)
    }

    /// Read `len` bytes starting at `address`, which must fall entirely
    /// within this range and within any captured image.
    #[must_use]
    pub fn read_bytes(&self, address: u64, len: u64) -> Option<&[u8]> {
        if address < self.base || address + len > self.limit() {
            return None;
        }
        let image = self.image.as_ref()?;
        let offset = (address - self.base) as usize;
        let len = len as usize;
        image.get(offset..offset + len)
    }
}
