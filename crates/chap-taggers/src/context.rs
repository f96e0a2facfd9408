use chap_address_map::AddressMap;
use chap_allocation_directory::AllocationDirectory;
use chap_contiguous_image::ContiguousImage;
use chap_diagnostics::PointerWidth;
use chap_reference_graph::{EdgePredicate, ReferenceGraph};
use chap_tag_holder::{TagHolder, TagIndex};

/// The four increasing-cost phases a tagger is tried at, in order, within
/// one allocation and one pass (§4.7). `WeakCheck` is reserved for
/// taggers willing to accept a weakly-confirmed match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    QuickInitialCheck,
    MediumCheck,
    SlowCheck,
    WeakCheck,
}

pub const PHASES: [Phase; 4] = [Phase::QuickInitialCheck, Phase::MediumCheck, Phase::SlowCheck, Phase::WeakCheck];

/// Pass 1 examines each used allocation's own contents; pass 2 examines
/// an allocation's contents to tag the *targets* of its outgoing
/// pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    TagFromAllocations,
    TagFromReferenced,
}

/// Everything a tagger needs to examine one allocation at one phase: its
/// contiguous image, the resolved target allocation index of every
/// pointer-aligned word in it (`no_target()` when the word isn't a
/// pointer into a known allocation), and mutable access to the shared tag
/// holder and tainted/favored edge predicates.
pub struct TaggerContext<'a, 'd> {
    pub allocation: usize,
    pub phase: Phase,
    pub image: ContiguousImage<'a>,
    pub word_targets: &'a [usize],
    pub width: PointerWidth,
    pub directory: &'a AllocationDirectory<'d>,
    pub graph: &'a ReferenceGraph,
    pub tag_holder: &'a mut TagHolder,
    pub tainted: &'a mut EdgePredicate,
    pub favored: &'a mut EdgePredicate,
    /// Raw address-space access for taggers that need to read a field of
    /// an allocation other than the one currently being examined (e.g. a
    /// red-black tree node's sentinel header).
    pub map: &'a AddressMap,
}

impl<'a, 'd> TaggerContext<'a, 'd> {
    #[must_use]
    pub fn no_target(&self) -> usize {
        self.directory.len()
    }

    #[must_use]
    pub fn read_word(&self, offset: usize) -> Option<u64> {
        self.image.read_word(offset, self.width)
    }

    /// Tags `self.allocation` with `tag`, honoring the strong/weak
    /// precedence and favored/taint cleanup rules in `TagHolder`.
    pub fn tag_self(&mut self, tag: TagIndex) -> bool {
        self.tag_holder.tag_allocation(self.allocation, tag, self.graph, self.tainted, self.favored)
    }

    /// As [`tag_self`](Self::tag_self), for a pass-2 tagger acting on one
    /// of its outgoing targets rather than on itself.
    pub fn tag_other(&mut self, allocation: usize, tag: TagIndex) -> bool {
        self.tag_holder.tag_allocation(allocation, tag, self.graph, self.tainted, self.favored)
    }

    /// Marks the outgoing edge from `self.allocation` to `target` as the
    /// canonical ("favored") reference discovered this pass.
    pub fn mark_favored(&mut self, target: usize) {
        self.mark_favored_edge(self.allocation, target);
    }

    /// As [`mark_favored`](Self::mark_favored), for an edge not rooted at
    /// `self.allocation` (e.g. a tree-traversal tagger favoring
    /// parent-to-child edges along the whole structure it just tagged).
    pub fn mark_favored_edge(&mut self, source: usize, target: usize) {
        self.favored.set(self.graph, source as u32, target as u32, true);
    }
}
