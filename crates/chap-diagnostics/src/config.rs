use crate::PointerWidth;

/// Tunable knobs for the allocator-reconstruction heuristics. Every
/// constant spec'd in the allocator infrastructure finder and allocation
/// finders (default max-heap-size, minimum free-list run length, minimum
/// page-run chunk count, ...) lives here instead of being a literal, so a
/// host analyzing a non-default allocator build can override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisConfig {
    /// Heaps (secondary-arena page-aligned regions) are aligned to, and
    /// sized at most, this many bytes. Starts at the allocator's default
    /// and is halved/doubled during infrastructure-finder resolution if the
    /// observed arenas are inconsistent with it.
    pub max_heap_size: u64,
    /// Lower bound `max_heap_size` may be corrected down to.
    pub min_max_heap_size: u64,
    /// Minimum number of consecutive empty/valid doubly-linked free-list
    /// headers required to recognize the main-arena's free-list run.
    pub min_main_arena_freelist_run: usize,
    /// Minimum number of consecutive libc chunks required to accept a
    /// main-arena page run (unless it ends exactly on a page boundary).
    pub min_main_arena_page_run_chunks: usize,
    /// Minimum number of consecutive libc chunks required to retain a heap
    /// whose arena pointer did not validate, as "missing-or-unfilled
    /// header" rather than discarding it.
    pub min_recoverable_heap_run_chunks: usize,
    /// Minimum size, in bytes, of a recognized `mmap`ped allocation.
    pub min_mmapped_allocation_size: u64,
    /// Number of fast-bin head slots laid out contiguously from the
    /// derived fast-bin-start offset (glibc's `NFASTBINS`).
    pub fast_bin_count: usize,
    /// Fraction (numerator over 2, i.e. "more than half") of a fast-bin
    /// list's links that must agree on being mangled before the
    /// `link xor (link_address >> 12)` unmasking is applied to the whole
    /// list.
    pub fast_bin_mangling_vote_threshold: usize,
}

impl AnalysisConfig {
    #[must_use]
    pub fn for_pointer_width(width: PointerWidth) -> Self {
        let max_heap_size = match width {
            PointerWidth::Bits64 => 0x0040_0000, // 4 MiB
            PointerWidth::Bits32 => 0x0010_0000, // 1 MiB
        };
        Self {
            max_heap_size,
            min_max_heap_size: 0x0001_0000,
            min_main_arena_freelist_run: 120,
            min_main_arena_page_run_chunks: 20,
            min_recoverable_heap_run_chunks: 10,
            min_mmapped_allocation_size: 0x1000,
            fast_bin_count: 10,
            fast_bin_mangling_vote_threshold: 2,
        }
    }

    /// Halve `max_heap_size`, saturating at `min_max_heap_size`. Used when
    /// the derived arena set implies a heap-aligned address that is not a
    /// multiple of the current `max_heap_size`.
    pub fn halve_max_heap_size(&mut self) -> bool {
        if self.max_heap_size <= self.min_max_heap_size {
            return false;
        }
        self.max_heap_size = (self.max_heap_size / 2).max(self.min_max_heap_size);
        true
    }

    /// Double `max_heap_size`. Used, rarely, when the implied heap size
    /// exceeds the current bound.
    pub fn double_max_heap_size(&mut self) {
        self.max_heap_size = self.max_heap_size.saturating_mul(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg64 = AnalysisConfig::for_pointer_width(PointerWidth::Bits64);
        assert_eq!(cfg64.max_heap_size, 4 * 1024 * 1024);
        let cfg32 = AnalysisConfig::for_pointer_width(PointerWidth::Bits32);
        assert_eq!(cfg32.max_heap_size, 1024 * 1024);
    }

    #[test]
    fn halving_stops_at_floor() {
        let mut cfg = AnalysisConfig::for_pointer_width(PointerWidth::Bits64);
        cfg.max_heap_size = 0x20000;
        assert!(cfg.halve_max_heap_size());
        assert_eq!(cfg.max_heap_size, 0x10000);
        assert!(!cfg.halve_max_heap_size());
        assert_eq!(cfg.max_heap_size, 0x10000);
    }
}
