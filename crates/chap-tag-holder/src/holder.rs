use chap_reference_graph::{EdgePredicate, ReferenceGraph};

use crate::tag_index::TagIndex;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum TagHolderError {
    #[error("tag capacity exhausted: more than 255 tags registered")]
    CapacityExhausted,
}

/// A registered tagger's identity: its display name and the two
/// precedence flags that govern `tag_allocation` (§4.7).
#[derive(Debug, Clone, Copy)]
pub struct TagDescriptor {
    pub name: &'static str,
    pub is_strong: bool,
    pub supports_favored_references: bool,
}

/// The per-allocation tag assignment, plus the registry of tag
/// descriptors every tag index names. `0` (`TagIndex::UNTAGGED`) never
/// has a descriptor.
pub struct TagHolder {
    descriptors: Vec<TagDescriptor>,
    tags: Vec<TagIndex>,
}

impl TagHolder {
    #[must_use]
    pub fn new(num_allocations: usize) -> Self {
        Self { descriptors: Vec::new(), tags: vec![TagIndex::UNTAGGED; num_allocations] }
    }

    /// Registers a new tagger, returning the small monotonically
    /// assigned index it should pass to `tag_allocation`. Fatal once 255
    /// tags are already registered (§7).
    pub fn register(&mut self, name: &'static str, is_strong: bool, supports_favored_references: bool) -> Result<TagIndex, TagHolderError> {
        if self.descriptors.len() >= 255 {
            return Err(TagHolderError::CapacityExhausted);
        }
        self.descriptors.push(TagDescriptor { name, is_strong, supports_favored_references });
        Ok(TagIndex::new(self.descriptors.len() as u8))
    }

    #[must_use]
    pub fn descriptor(&self, tag: TagIndex) -> Option<&TagDescriptor> {
        if tag.is_untagged() {
            return None;
        }
        self.descriptors.get(tag.value() as usize - 1)
    }

    #[must_use]
    pub fn tag_of(&self, allocation: usize) -> TagIndex {
        self.tags[allocation]
    }

    #[must_use]
    pub fn num_allocations(&self) -> usize {
        self.tags.len()
    }

    /// Assigns `tag` to `allocation`. A no-op that reports success when
    /// `allocation` already carries `tag`. Refuses (returns `false`,
    /// leaving the existing tag in place) when the current tag is strong
    /// and `tag` is not. On a genuine replacement, clears the
    /// allocation's favored-incoming edges and outgoing taint bits before
    /// installing the new tag, per §4.7.
    pub fn tag_allocation(&mut self, allocation: usize, tag: TagIndex, graph: &ReferenceGraph, tainted: &mut EdgePredicate, favored: &mut EdgePredicate) -> bool {
        let current = self.tags[allocation];
        if current == tag {
            return true;
        }
        if !current.is_untagged() {
            let current_is_strong = self.descriptor(current).is_some_and(|d| d.is_strong);
            let new_is_strong = self.descriptor(tag).is_some_and(|d| d.is_strong);
            if current_is_strong && !new_is_strong {
                return false;
            }
        }
        tainted.clear_outgoing(graph, allocation);
        favored.clear_incoming(graph, allocation);
        self.tags[allocation] = tag;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chap_reference_graph::ReferenceGraphBuilder;

    fn single_edge_graph() -> ReferenceGraph {
        let mut builder = ReferenceGraphBuilder::new(2);
        builder.add_edge(0, 1);
        builder.finish()
    }

    #[test]
    fn register_assigns_monotonic_indices_starting_at_one() {
        let mut holder = TagHolder::new(1);
        let first = holder.register("cow-string", true, false).unwrap();
        let second = holder.register("deque-block", false, true).unwrap();
        assert_eq!(first.value(), 1);
        assert_eq!(second.value(), 2);
    }

    #[test]
    fn strong_tag_resists_overwrite_by_weak_tag() {
        let graph = single_edge_graph();
        let mut tainted = EdgePredicate::new(&graph);
        let mut favored = EdgePredicate::new(&graph);
        let mut holder = TagHolder::new(2);
        let strong = holder.register("strong-tag", true, false).unwrap();
        let weak = holder.register("weak-tag", false, false).unwrap();

        assert!(holder.tag_allocation(0, strong, &graph, &mut tainted, &mut favored));
        assert!(!holder.tag_allocation(0, weak, &graph, &mut tainted, &mut favored));
        assert_eq!(holder.tag_of(0), strong);
    }

    #[test]
    fn replacement_clears_own_outgoing_taint_and_own_incoming_favored() {
        let graph = single_edge_graph();
        let mut tainted = EdgePredicate::new(&graph);
        let mut favored = EdgePredicate::new(&graph);
        // allocation 0's outgoing edge to 1 is tainted; that same edge,
        // viewed from allocation 1's incoming side, is favored.
        tainted.set(&graph, 0, 1, true);
        favored.set(&graph, 0, 1, true);

        let mut holder = TagHolder::new(2);
        let first = holder.register("first-tag", false, true).unwrap();
        let second = holder.register("second-tag", false, true).unwrap();

        // retagging allocation 0 clears its own outgoing taint bit, but
        // not allocation 1's incoming favored mark.
        assert!(holder.tag_allocation(0, first, &graph, &mut tainted, &mut favored));
        assert!(holder.tag_allocation(0, second, &graph, &mut tainted, &mut favored));
        assert!(!tainted.for_outgoing(graph.outgoing_edge_of(0, 1).unwrap()));
        assert!(favored.for_incoming(graph.incoming_edge_of(0, 1).unwrap()));

        // retagging allocation 1 clears its own incoming favored mark.
        assert!(holder.tag_allocation(1, first, &graph, &mut tainted, &mut favored));
        assert!(holder.tag_allocation(1, second, &graph, &mut tainted, &mut favored));
        assert!(!favored.for_incoming(graph.incoming_edge_of(0, 1).unwrap()));
        assert_eq!(holder.tag_of(0), second);
        assert_eq!(holder.tag_of(1), second);
    }

    #[test]
    fn same_tag_reapplied_is_a_no_op() {
        let graph = single_edge_graph();
        let mut tainted = EdgePredicate::new(&graph);
        let mut favored = EdgePredicate::new(&graph);
        let mut holder = TagHolder::new(2);
        let tag = holder.register("some-tag", false, false).unwrap();
        assert!(holder.tag_allocation(0, tag, &graph, &mut tainted, &mut favored));
        assert!(holder.tag_allocation(0, tag, &graph, &mut tainted, &mut favored));
        assert_eq!(holder.tag_of(0), tag);
    }
}
