use chap_address_map::AddressMap;
use chap_diagnostics::PointerWidth;

/// An allocation's bytes, presented as one contiguous slice regardless of
/// how the underlying address map backs them.
#[derive(Debug, Clone, Copy)]
pub enum ContiguousImage<'a> {
    /// The allocation fit entirely in one backed range; these bytes alias
    /// the original image.
    Aliased(&'a [u8]),
    /// The allocation spanned multiple ranges or had a gap; these bytes
    /// were copied (and any unbacked sub-range zero-filled) into the
    /// builder's scratch buffer.
    Scratch(&'a [u8]),
}

impl<'a> ContiguousImage<'a> {
    #[must_use]
    pub fn bytes(&self) -> &'a [u8] {
        match *self {
            Self::Aliased(b) | Self::Scratch(b) => b,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// Reads a pointer-sized little-endian word at the given byte offset,
    /// or `None` if it would run past the image.
    #[must_use]
    pub fn read_word(&self, offset: usize, width: PointerWidth) -> Option<u64> {
        let size = width.size_of_ptr() as usize;
        let slice = self.bytes().get(offset..offset + size)?;
        Some(match width {
            PointerWidth::Bits64 => u64::from_le_bytes(slice.try_into().ok()?),
            PointerWidth::Bits32 => u32::from_le_bytes(slice.try_into().ok()?) as u64,
        })
    }
}

/// Builds [`ContiguousImage`]s against one reusable scratch buffer sized
/// once to the largest allocation the caller expects to present, so the
/// tagger runner's per-allocation hot loop (§4.7) does not allocate.
pub struct ContiguousImageBuilder {
    scratch: Vec<u8>,
}

impl ContiguousImageBuilder {
    #[must_use]
    pub fn new(max_allocation_size: u64, width: PointerWidth) -> Self {
        let capacity = max_allocation_size + 2 * width.size_of_ptr();
        Self { scratch: vec![0u8; capacity as usize] }
    }

    /// Presents `size` bytes starting at `address`. Aliases the address
    /// map's own backing when the whole span is captured in one range;
    /// otherwise copies what is captured into the scratch buffer and
    /// zero-fills the rest.
    pub fn build<'a>(&'a mut self, map: &'a AddressMap, address: u64, size: u64) -> ContiguousImage<'a> {
        if let Some(bytes) = map.read_bytes(address, size) {
            return ContiguousImage::Aliased(bytes);
        }

        let len = size as usize;
        assert!(len <= self.scratch.len(), "allocation size exceeds the contiguous-image scratch capacity");
        self.scratch[..len].fill(0);

        let mut offset = 0u64;
        while offset < size {
            let addr = address + offset;
            match map.find(addr) {
                Some(range) => {
                    let avail = (range.limit() - addr).min(size - offset);
                    if let Some(bytes) = range.read_bytes(addr, avail) {
                        let start = offset as usize;
                        self.scratch[start..start + avail as usize].copy_from_slice(bytes);
                    }
                    offset += avail;
                }
                None => {
                    let next_base = map.iter().map(|r| r.base).find(|&base| base > addr);
                    let step = match next_base {
                        Some(base) => (base - addr).min(size - offset),
                        None => size - offset,
                    };
                    offset += step;
                }
            }
        }
        ContiguousImage::Scratch(&self.scratch[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chap_address_map::{Range, RangeFlags};

    #[test]
    fn single_range_aliases_without_copy() {
        let bytes = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let range = Range::new(0x1000, 8, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE, Some(bytes));
        let map = AddressMap::new(vec![range], PointerWidth::Bits64).unwrap();
        let mut builder = ContiguousImageBuilder::new(0x100, PointerWidth::Bits64);

        let image = builder.build(&map, 0x1000, 8);
        assert!(matches!(image, ContiguousImage::Aliased(_)));
        assert_eq!(image.bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn gap_between_ranges_is_zero_filled() {
        let first = Range::new(0x1000, 4, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE, Some(vec![0xaa; 4]));
        let second = Range::new(0x1010, 4, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE, Some(vec![0xbb; 4]));
        let map = AddressMap::new(vec![first, second], PointerWidth::Bits64).unwrap();
        let mut builder = ContiguousImageBuilder::new(0x100, PointerWidth::Bits64);

        // span [0x1000, 0x1014): 4 backed bytes, a 12-byte gap, then 4
        // more backed bytes.
        let image = builder.build(&map, 0x1000, 0x14);
        assert!(matches!(image, ContiguousImage::Scratch(_)));
        let bytes = image.bytes();
        assert_eq!(&bytes[0..4], &[0xaa; 4]);
        assert_eq!(&bytes[4..0x10], &[0u8; 12]);
        assert_eq!(&bytes[0x10..0x14], &[0xbb; 4]);
    }
}
