use std::path::PathBuf;

use chap_address_map::RangeFlags;

/// One range of the address space backed by a plain file mapping that
/// isn't itself a loaded module (e.g. a memory-mapped data file). Carries
/// enough to tie the range back to its file and offset, which the heap
/// finders use to tell a genuine anonymous heap mapping from a mapped file
/// that merely looks heap-shaped.
#[derive(Debug, Clone)]
pub struct FileMappedRange {
    pub base: u64,
    pub limit: u64,
    pub file_path: PathBuf,
    pub offset_in_file: u64,
    pub flags: RangeFlags,
}

impl FileMappedRange {
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.limit
    }
}

/// What the analysis engine consumes from the host environment to learn
/// about non-module file mappings: an iterable of `(base, limit, file_path,
/// offset_in_file, flags)`.
pub trait FileMappedRangeDirectoryProvider {
    fn file_mapped_ranges(&self) -> impl Iterator<Item = FileMappedRange>;
}

#[derive(Debug, Default)]
pub struct FileMappedRangeDirectory {
    ranges: Vec<FileMappedRange>,
}

impl FileMappedRangeDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_provider(provider: &impl FileMappedRangeDirectoryProvider) -> Self {
        let mut ranges: Vec<_> = provider.file_mapped_ranges().collect();
        ranges.sort_by_key(|r| r.base);
        Self { ranges }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[must_use]
    pub fn find(&self, address: u64) -> Option<&FileMappedRange> {
        let idx = self.ranges.partition_point(|r| r.limit <= address);
        self.ranges.get(idx).filter(|r| r.contains(address))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileMappedRange> {
        self.ranges.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmr(base: u64, limit: u64) -> FileMappedRange {
        FileMappedRange { base, limit, file_path: PathBuf::from("/data/file.bin"), offset_in_file: 0, flags: RangeFlags::IS_MAPPED }
    }

    #[test]
    fn find_locates_containing_range() {
        let dir = FileMappedRangeDirectory { ranges: vec![fmr(0x1000, 0x2000), fmr(0x3000, 0x4000)] };
        assert!(dir.find(0x1500).is_some());
        assert!(dir.find(0x2500).is_none());
        assert!(dir.find(0x3500).is_some());
    }
}
