use chap_tag_holder::{TagHolder, TagHolderError, TagIndex};

use crate::context::{Phase, TaggerContext};
use crate::tagger::Tagger;

/// Recognizes a `libstdc++` copy-on-write long-string body: a
/// `[length, capacity, refcount]` header followed by `capacity + 1` bytes
/// of character data ending in an embedded NUL at `length`.
pub struct CowStringTagger {
    tag: TagIndex,
}

const HEADER_WORDS: usize = 3;

impl CowStringTagger {
    pub fn new(tag_holder: &mut TagHolder) -> Result<Self, TagHolderError> {
        Ok(Self { tag: tag_holder.register("cow-string-body", false, false)? })
    }
}

impl Tagger for CowStringTagger {
    fn tag_from_allocation(&self, ctx: &mut TaggerContext) -> bool {
        if ctx.phase != Phase::QuickInitialCheck {
            return false;
        }
        let ptr = ctx.width.size_of_ptr() as usize;
        let header = HEADER_WORDS * ptr;
        if ctx.image.len() <= header {
            return false;
        }
        let Some(length) = ctx.read_word(0) else { return false };
        let Some(capacity) = ctx.read_word(ptr) else { return false };
        if length > capacity {
            return false;
        }
        let body_len = (ctx.image.len() - header) as u64;
        if capacity + 1 > body_len {
            return false;
        }
        let nul_offset = header + length as usize;
        if ctx.image.bytes().get(nul_offset) != Some(&0) {
            return false;
        }
        ctx.tag_self(self.tag)
    }
}
