use std::collections::BTreeSet;

use chap_address_map::AddressMap;
use chap_allocator_finder::ArenaOffsets;
use chap_diagnostics::{AnalysisConfig, DiagnosticEvent, DiagnosticSink, PointerWidth, Subsystem};

/// glibc's safe-linking unmask: `ptr = mangled xor (pos >> 12)`, where
/// `pos` is the address of the slot holding the link. Applying it twice
/// with the same `pos` is the identity, so mangled and unmangled
/// populations can be told apart by which interpretation resolves to
/// addresses already known to be allocations.
fn unmask(mangled: u64, pos: u64) -> u64 {
    mangled ^ (pos >> 12)
}

/// Walks one fast-bin head's chain under one mangling assumption, each
/// step treating the link as the base of the next chunk and recomputing
/// its user address. Stops at a null link (normal end), a link that does
/// not land on a known allocation (either corruption or the wrong
/// mangling assumption), or after visiting more links than there are
/// known allocations in the whole snapshot (a cycle).
fn walk_chain(map: &AddressMap, width: PointerWidth, head_addr: u64, mangled: bool, known: &BTreeSet<u64>, total_cap: usize) -> (Vec<u64>, bool) {
    let chunk_alignment = width.chunk_alignment();
    let mut pos = head_addr;
    let mut freed = Vec::new();
    loop {
        let Some(raw) = map.read_word(pos) else { break };
        if raw == 0 {
            break;
        }
        if freed.len() > total_cap {
            return (freed, true);
        }
        let chunk_base = if mangled { unmask(raw, pos) } else { raw };
        let user_addr = chunk_base.wrapping_add(chunk_alignment);
        if !known.contains(&user_addr) {
            break;
        }
        freed.push(user_addr);
        pos = user_addr;
    }
    (freed, false)
}

/// After chunk boundaries are known, walks every arena's fast-bin lists
/// and returns the set of allocation addresses that are actually free
/// (glibc leaves fast-bin chunks marked `PREV_INUSE` in their neighbor,
/// so the chunk-boundary scan alone reports them used). Reports a
/// diagnostic per arena/bin where a cycle is detected rather than
/// looping forever.
#[must_use]
pub fn fix_fast_bin_free_status(
    map: &AddressMap,
    width: PointerWidth,
    arenas: &[u64],
    offsets: &ArenaOffsets,
    config: &AnalysisConfig,
    known_allocations: &BTreeSet<u64>,
    sink: &dyn DiagnosticSink,
) -> BTreeSet<u64> {
    let Some(fast_bin_start) = offsets.fast_bin_start else {
        sink.report(DiagnosticEvent::new(Subsystem::FastBinFixer, "fast-bin start offset not derived, skipping free-status fixup"));
        return BTreeSet::new();
    };
    let ptr = width.size_of_ptr();
    let total_cap = known_allocations.len();

    let mut heads = Vec::new();
    for &arena in arenas {
        for idx in 0..config.fast_bin_count {
            heads.push(arena + fast_bin_start + idx as u64 * ptr);
        }
    }

    let unmangled: Vec<(Vec<u64>, bool)> = heads.iter().map(|&head| walk_chain(map, width, head, false, known_allocations, total_cap)).collect();
    let mangled: Vec<(Vec<u64>, bool)> = heads.iter().map(|&head| walk_chain(map, width, head, true, known_allocations, total_cap)).collect();

    let unmangled_votes: usize = unmangled.iter().map(|(freed, _)| freed.len()).sum();
    let mangled_votes: usize = mangled.iter().map(|(freed, _)| freed.len()).sum();

    let use_mangled = mangled_votes >= unmangled_votes + config.fast_bin_mangling_vote_threshold;
    let chosen = if use_mangled { &mangled } else { &unmangled };

    let mut freed_set = BTreeSet::new();
    for (head, (freed, cycle)) in heads.iter().zip(chosen.iter()) {
        if *cycle {
            sink.report(DiagnosticEvent::at(Subsystem::FastBinFixer, *head, "fast-bin list cycle detected, truncating walk"));
        }
        freed_set.extend(freed.iter().copied());
    }
    freed_set
}
