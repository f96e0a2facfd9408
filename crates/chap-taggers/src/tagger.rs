use crate::context::TaggerContext;

/// A signature check for one kind of allocation. A tagger registers its
/// tag index(es) with the `TagHolder` at construction (see each tagger's
/// `new`) and keeps them as fields; the runner never assigns or tracks
/// tag indices on a tagger's behalf.
///
/// Returning `true` from either method means "done with this allocation
/// this pass" (§4.7) — the runner stops trying further taggers and
/// phases for the allocation. Both methods default to "never matches" so
/// a tagger only needs to implement the pass it participates in.
pub trait Tagger {
    fn tag_from_allocation(&self, _ctx: &mut TaggerContext) -> bool {
        false
    }

    fn tag_from_referenced(&self, _ctx: &mut TaggerContext) -> bool {
        false
    }
}
