use chap_address_map::RangeMapper;

/// The metadata attached to one registered `[base, limit)` range: its
/// stack-type label (e.g. `"main thread stack"`, `"pthread guard
/// region"`) and, for an actual stack (not a guard region), whichever of
/// stack-top, stack-base, and owning thread index were known.
#[derive(Debug, Clone, PartialEq)]
pub struct StackRecord {
    pub label: &'static str,
    pub stack_top: Option<u64>,
    pub stack_base: Option<u64>,
    pub thread_index: Option<usize>,
}

impl StackRecord {
    #[must_use]
    pub fn stack(label: &'static str, stack_top: Option<u64>, stack_base: Option<u64>, thread_index: Option<usize>) -> Self {
        Self { label, stack_top, stack_base, thread_index }
    }

    #[must_use]
    pub fn guard_region(label: &'static str) -> Self {
        Self { label, stack_top: None, stack_base: None, thread_index: None }
    }
}

/// A disjoint set of `[base, limit)` ranges, each either a live stack or a
/// guard region claimed alongside it, queryable by containing address
/// (§4.9). Guard regions are registered as their own range with their own
/// label rather than folded into the adjoining stack's record, mirroring
/// how a real guard page carries no valid stack content of its own.
pub struct StackRegistry {
    ranges: RangeMapper<StackRecord>,
}

impl Default for StackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { ranges: RangeMapper::new() }
    }

    /// Registers `[base, base+size)` under `record`. Returns `false` on
    /// overlap with an already-registered range, leaving the registry
    /// unchanged.
    pub fn register(&mut self, base: u64, size: u64, record: StackRecord) -> bool {
        self.ranges.insert_range(base, size, record)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Visits every registered range in ascending address order.
    pub fn visit_stacks(&self, mut visitor: impl FnMut(u64, u64, &StackRecord)) {
        for (base, size, record) in self.ranges.iter() {
            visitor(base, size, record);
        }
    }

    /// Visits the range containing `address`, if any; returns whether one
    /// was found.
    pub fn visit_stack_at(&self, address: u64, mut visitor: impl FnMut(u64, u64, &StackRecord)) -> bool {
        match self.ranges.find(address) {
            Some((base, size, record)) => {
                visitor(base, size, record);
                true
            }
            None => false,
        }
    }
}
