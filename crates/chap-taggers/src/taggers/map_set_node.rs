use chap_address_map::AddressMap;
use chap_allocation_directory::AllocationDirectory;
use chap_diagnostics::PointerWidth;
use chap_tag_holder::{TagHolder, TagHolderError, TagIndex};

use crate::context::{Phase, TaggerContext};
use crate::tagger::Tagger;

const MIN_NODE_SIZE_IN_WORDS: u64 = 5;
const PARENT_WORD: u64 = 1;
const LEFT_CHILD_WORD: u64 = 2;
const RIGHT_CHILD_WORD: u64 = 3;
const ROOT_IN_HEADER: u64 = 1;
const FIRST_NODE_IN_HEADER: u64 = 2;
const LAST_NODE_IN_HEADER: u64 = 3;
const SIZE_IN_HEADER: u64 = 4;

/// Recognizes the root of a red-black tree backing a `std::map`/`std::set`:
/// a `(color, parent, left, right)` node whose `parent` names a sentinel
/// header allocation with its own `(color, root, first, last, size)`
/// fields, where the header's `root` points back here and its `first`/
/// `last` pointers agree with whether this node has a left/right child.
/// On a match the whole tree is walked from here; every node visited is
/// tagged and the header-to-root and parent-to-child edges along the walk
/// are marked favored.
pub struct MapSetNodeTagger {
    tag: TagIndex,
}

impl MapSetNodeTagger {
    pub fn new(tag_holder: &mut TagHolder) -> Result<Self, TagHolderError> {
        Ok(Self { tag: tag_holder.register("map-set-node", true, true)? })
    }
}

/// The sentinel header fields a root candidate's tree walk is checked
/// against, read once up front.
struct RootCandidate {
    header_address: u64,
    first_node: u64,
    last_node: u64,
    size: u64,
}

fn probe_root(ctx: &TaggerContext, address: u64) -> Option<RootCandidate> {
    if ctx.word_targets.len() < MIN_NODE_SIZE_IN_WORDS as usize {
        return None;
    }
    let ptr = ctx.width.size_of_ptr();
    let color = ctx.read_word(0)?;
    if color & 0xfe != 0 {
        return None;
    }
    let header_address = ctx.read_word((PARENT_WORD * ptr) as usize)?;
    if header_address == 0 || !ctx.width.is_aligned(header_address) {
        return None;
    }
    let left_child = ctx.read_word((LEFT_CHILD_WORD * ptr) as usize)?;
    if !ctx.width.is_aligned(left_child) {
        return None;
    }
    let right_child = ctx.read_word((RIGHT_CHILD_WORD * ptr) as usize)?;
    if !ctx.width.is_aligned(right_child) {
        return None;
    }

    let map = ctx.map;
    let header_color = map.read_word(header_address)?;
    if header_color & 0xfe != 0 {
        return None;
    }
    if map.read_word(header_address + ROOT_IN_HEADER * ptr)? != address {
        return None;
    }
    let first_node = map.read_word(header_address + FIRST_NODE_IN_HEADER * ptr)?;
    if first_node == 0 || !ctx.width.is_aligned(first_node) {
        return None;
    }
    let last_node = map.read_word(header_address + LAST_NODE_IN_HEADER * ptr)?;
    if last_node == 0 || !ctx.width.is_aligned(last_node) {
        return None;
    }
    if (left_child == 0) != (first_node == address) {
        return None;
    }
    if (right_child == 0) != (last_node == address) {
        return None;
    }
    let size = map.read_word(header_address + SIZE_IN_HEADER * ptr)?;
    if size == 0 {
        return None;
    }
    if map.read_word(first_node + LEFT_CHILD_WORD * ptr)? != 0 {
        return None;
    }
    if map.read_word(last_node + RIGHT_CHILD_WORD * ptr)? != 0 {
        return None;
    }
    Some(RootCandidate { header_address, first_node, last_node, size })
}

/// Accumulated traversal state, threaded through the mutually recursive
/// `check_node`/`check_child` walk so every visited node's `(index,
/// parent_index)` pair is available afterwards for tagging even before
/// the walk is known to have fully succeeded.
struct Walk {
    visited: Vec<(usize, Option<usize>)>,
    first_seen: bool,
    last_seen: bool,
    num_visited: u64,
}

#[allow(clippy::too_many_arguments)]
fn check_node(
    directory: &AllocationDirectory,
    map: &AddressMap,
    width: PointerWidth,
    node: u64,
    node_index: usize,
    parent: u64,
    parent_index: Option<usize>,
    root: &RootCandidate,
    walk: &mut Walk,
    depth: usize,
    max_depth: usize,
) -> bool {
    if node == root.first_node {
        walk.first_seen = true;
    }
    if node == root.last_node {
        walk.last_seen = true;
    }
    if depth >= max_depth {
        return false;
    }
    walk.num_visited += 1;
    if walk.num_visited > root.size {
        return false;
    }
    let Some(record) = directory.records().get(node_index) else { return false };
    if record.size() < MIN_NODE_SIZE_IN_WORDS * width.size_of_ptr() {
        return false;
    }
    if record.address != node {
        return false;
    }
    let ptr = width.size_of_ptr();
    if map.read_word(node + PARENT_WORD * ptr) != Some(parent) {
        return false;
    }
    let Some(color) = map.read_word(node) else { return false };
    if color & 0xfe != 0 {
        return false;
    }
    walk.visited.push((node_index, parent_index));

    let left = map.read_word(node + LEFT_CHILD_WORD * ptr).unwrap_or(0);
    let right = map.read_word(node + RIGHT_CHILD_WORD * ptr).unwrap_or(0);
    check_child(directory, map, width, node, node_index, left, root, walk, depth + 1, max_depth)
        && check_child(directory, map, width, node, node_index, right, root, walk, depth + 1, max_depth)
}

#[allow(clippy::too_many_arguments)]
fn check_child(
    directory: &AllocationDirectory,
    map: &AddressMap,
    width: PointerWidth,
    parent: u64,
    parent_index: usize,
    child: u64,
    root: &RootCandidate,
    walk: &mut Walk,
    depth: usize,
    max_depth: usize,
) -> bool {
    if child == 0 {
        return true;
    }
    if !width.is_aligned(child) {
        return false;
    }
    let Some(child_index) = directory.allocation_index_of(child) else { return false };
    check_node(directory, map, width, child, child_index, parent, Some(parent_index), root, walk, depth, max_depth)
}

impl Tagger for MapSetNodeTagger {
    fn tag_from_allocation(&self, ctx: &mut TaggerContext) -> bool {
        if ctx.phase != Phase::MediumCheck {
            return false;
        }
        let current = ctx.tag_holder.tag_of(ctx.allocation);
        if ctx.tag_holder.descriptor(current).is_some_and(|d| d.is_strong) {
            // Already reached as a descendant of a tree rooted elsewhere.
            return true;
        }
        let address = ctx.directory.records()[ctx.allocation].address;
        let Some(root) = probe_root(ctx, address) else { return false };

        let header_index = ctx.directory.allocation_index_of(root.header_address);
        let max_depth = ctx.width.size_of_ptr() as usize * 16;
        let mut walk = Walk { visited: Vec::new(), first_seen: false, last_seen: false, num_visited: 0 };
        let complete = check_node(ctx.directory, ctx.map, ctx.width, address, ctx.allocation, root.header_address, header_index, &root, &mut walk, 0, max_depth);

        if complete && walk.num_visited == root.size && walk.first_seen && walk.last_seen {
            for (node_index, parent_index) in &walk.visited {
                ctx.tag_other(*node_index, self.tag);
                if let Some(parent_index) = parent_index {
                    ctx.mark_favored_edge(*parent_index, *node_index);
                }
            }
        }
        // Whether or not the walk confirmed a full tree, this allocation
        // looked enough like a tree root that no other tagger should
        // reconsider it this pass.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chap_address_map::{Range, RangeFlags};
    use chap_allocation_finders::AllocationFinder;
    use chap_reference_graph::{EdgePredicate, ReferenceGraphBuilder};

    struct VecFinder {
        items: Vec<(u64, u64, bool)>,
        index: usize,
    }

    impl AllocationFinder for VecFinder {
        fn finished(&self) -> bool {
            self.index >= self.items.len()
        }
        fn next_address(&self) -> u64 {
            self.items[self.index].0
        }
        fn next_size(&self) -> u64 {
            self.items[self.index].1
        }
        fn next_is_used(&self) -> bool {
            self.items[self.index].2
        }
        fn advance(&mut self) {
            self.index += 1;
        }
        fn min_request_size(&self, size: u64) -> u64 {
            size
        }
    }

    fn node_bytes(color: u64, parent: u64, left: u64, right: u64) -> Vec<u8> {
        let mut bytes = Vec::new();
        for word in [color, parent, left, right, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    fn header_bytes(color: u64, root: u64, first: u64, last: u64, size: u64) -> Vec<u8> {
        let mut bytes = Vec::new();
        for word in [color, root, first, last, size] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// A 3-node tree: root at 0x2000 with left child 0x3000 (the first
    /// node) and right child 0x4000 (the last node), header at 0x1000.
    #[test]
    fn tags_a_three_node_tree_and_favors_header_and_parent_edges() {
        let header = 0x1000u64;
        let root = 0x2000u64;
        let left = 0x3000u64;
        let right = 0x4000u64;

        let mut dir = AllocationDirectory::new();
        dir.add_finder(Box::new(VecFinder { items: vec![(header, 0x28, true)], index: 0 })).unwrap();
        dir.add_finder(Box::new(VecFinder { items: vec![(root, 0x28, true)], index: 0 })).unwrap();
        dir.add_finder(Box::new(VecFinder { items: vec![(left, 0x28, true)], index: 0 })).unwrap();
        dir.add_finder(Box::new(VecFinder { items: vec![(right, 0x28, true)], index: 0 })).unwrap();
        dir.resolve_boundaries().unwrap();

        let map = AddressMap::new(
            vec![
                Range::new(header, 0x28, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE, Some(header_bytes(0, root, left, right, 3))),
                Range::new(root, 0x28, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE, Some(node_bytes(0, header, left, right))),
                Range::new(left, 0x28, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE, Some(node_bytes(1, root, 0, 0))),
                Range::new(right, 0x28, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE, Some(node_bytes(1, root, 0, 0))),
            ],
            PointerWidth::Bits64,
        )
        .unwrap();

        let root_index = dir.allocation_index_of(root).unwrap();
        let left_index = dir.allocation_index_of(left).unwrap();
        let right_index = dir.allocation_index_of(right).unwrap();
        let header_index = dir.allocation_index_of(header).unwrap();

        let mut images = chap_contiguous_image::ContiguousImageBuilder::new(0x28, PointerWidth::Bits64);
        let mut graph_builder = ReferenceGraphBuilder::new(dir.len());
        graph_builder.scan_allocations(&dir, &map, &mut images, PointerWidth::Bits64);
        let graph = graph_builder.finish();

        let mut tag_holder = TagHolder::new(dir.len());
        let mut tainted = EdgePredicate::new(&graph);
        let mut favored = EdgePredicate::new(&graph);

        let mut runner = crate::runner::TaggerRunner::new();
        runner.register(Box::new(MapSetNodeTagger::new(&mut tag_holder).unwrap()));
        runner.run(&dir, &graph, &mut tag_holder, &mut tainted, &mut favored, &map, PointerWidth::Bits64);

        assert!(!tag_holder.tag_of(root_index).is_untagged());
        assert!(!tag_holder.tag_of(left_index).is_untagged());
        assert!(!tag_holder.tag_of(right_index).is_untagged());

        assert!(favored.for_outgoing(graph.outgoing_edge_of(header_index as u32, root_index as u32).unwrap()));
        assert!(favored.for_outgoing(graph.outgoing_edge_of(root_index as u32, left_index as u32).unwrap()));
        assert!(favored.for_outgoing(graph.outgoing_edge_of(root_index as u32, right_index as u32).unwrap()));
    }

    /// A node whose parent field names an allocation that does not itself
    /// look like a sentinel header (its own "color" word is out of range)
    /// must not be mistaken for a tree root.
    #[test]
    fn rejects_a_root_candidate_with_a_malformed_header() {
        let header = 0x1000u64;
        let root = 0x2000u64;

        let mut dir = AllocationDirectory::new();
        dir.add_finder(Box::new(VecFinder { items: vec![(header, 0x28, true)], index: 0 })).unwrap();
        dir.add_finder(Box::new(VecFinder { items: vec![(root, 0x28, true)], index: 0 })).unwrap();
        dir.resolve_boundaries().unwrap();

        let map = AddressMap::new(
            vec![
                Range::new(header, 0x28, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE, Some(header_bytes(5, root, root, root, 1))),
                Range::new(root, 0x28, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE, Some(node_bytes(0, header, 0, 0))),
            ],
            PointerWidth::Bits64,
        )
        .unwrap();

        let root_index = dir.allocation_index_of(root).unwrap();

        let mut images = chap_contiguous_image::ContiguousImageBuilder::new(0x28, PointerWidth::Bits64);
        let mut graph_builder = ReferenceGraphBuilder::new(dir.len());
        graph_builder.scan_allocations(&dir, &map, &mut images, PointerWidth::Bits64);
        let graph = graph_builder.finish();

        let mut tag_holder = TagHolder::new(dir.len());
        let mut tainted = EdgePredicate::new(&graph);
        let mut favored = EdgePredicate::new(&graph);

        let mut runner = crate::runner::TaggerRunner::new();
        runner.register(Box::new(MapSetNodeTagger::new(&mut tag_holder).unwrap()));
        runner.run(&dir, &graph, &mut tag_holder, &mut tainted, &mut favored, &map, PointerWidth::Bits64);

        assert!(tag_holder.tag_of(root_index).is_untagged());
    }
}
