use chap_tag_holder::{TagHolder, TagHolderError, TagIndex};

use crate::context::{Phase, TaggerContext};
use crate::tagger::Tagger;

/// Recognizes a `std::deque`'s 10-word header (buckets, max_entries,
/// `start{cur,first,last,node}`, `finish{cur,first,last,node}`) and, on
/// a match, tags the two block allocations its `start`/`finish` node
/// pointers name.
pub struct DequeTagger {
    map_tag: TagIndex,
    block_tag: TagIndex,
}

const START_NODE_WORD: usize = 5;
const FINISH_NODE_WORD: usize = 9;
const MAX_ENTRIES_WORD: usize = 1;

impl DequeTagger {
    pub fn new(tag_holder: &mut TagHolder) -> Result<Self, TagHolderError> {
        let map_tag = tag_holder.register("deque-map", false, true)?;
        let block_tag = tag_holder.register("deque-block", false, false)?;
        Ok(Self { map_tag, block_tag })
    }

    fn looks_like_deque_map(&self, ctx: &TaggerContext) -> bool {
        let ptr = ctx.width.size_of_ptr() as usize;
        if ctx.image.len() < 10 * ptr || ctx.word_targets.len() < 10 {
            return false;
        }
        let Some(max_entries) = ctx.read_word(MAX_ENTRIES_WORD * ptr) else { return false };
        if max_entries == 0 || max_entries > 1_000_000 {
            return false;
        }
        let sentinel = ctx.no_target();
        ctx.word_targets[START_NODE_WORD] != sentinel && ctx.word_targets[FINISH_NODE_WORD] != sentinel
    }
}

impl Tagger for DequeTagger {
    fn tag_from_allocation(&self, ctx: &mut TaggerContext) -> bool {
        if ctx.phase != Phase::MediumCheck || !self.looks_like_deque_map(ctx) {
            return false;
        }
        ctx.tag_self(self.map_tag)
    }

    fn tag_from_referenced(&self, ctx: &mut TaggerContext) -> bool {
        if ctx.phase != Phase::MediumCheck || !self.looks_like_deque_map(ctx) {
            return false;
        }
        let start_node = ctx.word_targets[START_NODE_WORD];
        let finish_node = ctx.word_targets[FINISH_NODE_WORD];
        let tagged_start = ctx.tag_other(start_node, self.block_tag);
        ctx.mark_favored(start_node);
        let tagged_finish = ctx.tag_other(finish_node, self.block_tag);
        ctx.mark_favored(finish_node);
        tagged_start || tagged_finish
    }
}
