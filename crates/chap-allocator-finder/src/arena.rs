/// One discovered `malloc_state` arena. The main arena is a static
/// variable inside libc's data segment; every other arena lives at a fixed
/// offset inside the first heap of its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arena {
    pub address: u64,
    pub is_main: bool,
}

/// One discovered heap: a page-aligned, `max_heap_size`-bounded secondary-
/// arena region, or the main arena's own page-run territory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heap {
    pub base: u64,
    pub cur_size: u64,
    pub prev_heap: u64,
    /// `None` once a `malloc_state` pointer could not be validated against
    /// any known arena; such a heap survives post-derivation maintenance
    /// only if its first chunks parse as a plausible libc run.
    pub arena_address: Option<u64>,
    pub missing_or_unfilled_header: bool,
}

impl Heap {
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.base + self.cur_size
    }
}
