use chap_tag_holder::{TagHolder, TagHolderError, TagIndex};

use crate::context::{Phase, TaggerContext};
use crate::tagger::Tagger;

/// Recognizes a `std::list` node by next/prev symmetry: its first two
/// words point at two other allocations, and each of those allocations
/// has, in turn, some outgoing word pointing back here. A full ring
/// closure would additionally confirm the whole cycle; this is the
/// cheap, local approximation appropriate to `QuickInitialCheck`.
pub struct ListNodeTagger {
    tag: TagIndex,
}

impl ListNodeTagger {
    pub fn new(tag_holder: &mut TagHolder) -> Result<Self, TagHolderError> {
        Ok(Self { tag: tag_holder.register("list-node", false, true)? })
    }
}

impl Tagger for ListNodeTagger {
    fn tag_from_allocation(&self, ctx: &mut TaggerContext) -> bool {
        if ctx.phase != Phase::QuickInitialCheck || ctx.word_targets.len() < 2 {
            return false;
        }
        let sentinel = ctx.no_target();
        let next = ctx.word_targets[0];
        let prev = ctx.word_targets[1];
        if next == sentinel || prev == sentinel {
            return false;
        }
        let next_points_back = ctx.graph.outgoing_edge_of(next as u32, ctx.allocation as u32).is_some();
        let prev_points_back = ctx.graph.outgoing_edge_of(prev as u32, ctx.allocation as u32).is_some();
        if next_points_back && prev_points_back {
            ctx.tag_self(self.tag)
        } else {
            false
        }
    }
}
