use std::collections::BTreeSet;

use chap_address_map::AddressMap;
use chap_allocator_finder::{read_chunk_header, read_free_list_head, Arena, ArenaOffsets, Heap};
use chap_diagnostics::{DiagnosticEvent, DiagnosticSink, PointerWidth, Subsystem};

fn node_in_arena_heaps(chunk_base: u64, arena: &Arena, heaps: &[Heap]) -> bool {
    if arena.is_main {
        return true;
    }
    heaps.iter().any(|h| h.arena_address == Some(arena.address) && chunk_base >= h.base && chunk_base < h.base + h.cur_size)
}

fn validate_node(map: &AddressMap, width: PointerWidth, node: u64, expected_prev: u64, arena: &Arena, heaps: &[Heap], known: &BTreeSet<u64>, sink: &dyn DiagnosticSink) {
    if !known.contains(&node) {
        sink.report(DiagnosticEvent::at(Subsystem::DoublyLinkedListChecker, node, "free-list node does not match a known allocation"));
    }
    let chunk_base = node.wrapping_sub(width.chunk_alignment());
    let Some(header) = read_chunk_header(map, chunk_base, width) else {
        sink.report(DiagnosticEvent::at(Subsystem::DoublyLinkedListChecker, node, "free-list node's chunk header is unreadable"));
        return;
    };
    if header.prev_inuse() {
        sink.report(DiagnosticEvent::at(Subsystem::DoublyLinkedListChecker, node, "free-list node's PREV_INUSE bit is set"));
    }
    if !node_in_arena_heaps(chunk_base, arena, heaps) {
        sink.report(DiagnosticEvent::at(Subsystem::DoublyLinkedListChecker, node, "free-list node does not lie within its arena's heap(s)"));
    }
    match read_free_list_head(map, node, width) {
        Some(head) if head.prev != expected_prev => {
            sink.report(DiagnosticEvent::at(Subsystem::DoublyLinkedListChecker, node, "free-list node's back pointer does not match the previous node"));
        }
        None => {
            sink.report(DiagnosticEvent::at(Subsystem::DoublyLinkedListChecker, node, "free-list node's link fields are unreadable"));
        }
        _ => {}
    }
    let trailing = map.read_word(chunk_base + header.size());
    if trailing != Some(header.size()) {
        sink.report(DiagnosticEvent::at(Subsystem::DoublyLinkedListChecker, node, "trailing prev_size field does not match this chunk's size"));
    }
}

fn check_list(map: &AddressMap, width: PointerWidth, arena: &Arena, head_addr: u64, heaps: &[Heap], known: &BTreeSet<u64>, cap: usize, sink: &dyn DiagnosticSink) {
    let Some(head) = read_free_list_head(map, head_addr, width) else { return };
    if head.next == head_addr && head.prev == head_addr {
        return;
    }
    let mut prev_node = head_addr;
    let mut node = head.next;
    let mut visited = 0usize;
    while node != head_addr && node != 0 {
        if visited > cap {
            sink.report(DiagnosticEvent::at(Subsystem::DoublyLinkedListChecker, node, "free-list cycle detected, stopping walk"));
            return;
        }
        visited += 1;
        validate_node(map, width, node, prev_node, arena, heaps, known, sink);
        let Some(this_head) = read_free_list_head(map, node, width) else { return };
        prev_node = node;
        node = this_head.next;
    }
}

/// Walks the free lists at every derived free-list-head offset of every
/// arena, reporting (never failing on) any node that fails one of the
/// consistency checks: it matches a known allocation, its chunk header's
/// `PREV_INUSE` bit is clear, it lies within its arena's heap(s), its back
/// pointer matches the node walked from, and the trailing `prev_size`
/// field written by its successor equals its own size.
pub fn check_doubly_linked_lists(
    map: &AddressMap,
    width: PointerWidth,
    arenas: &[Arena],
    offsets: &ArenaOffsets,
    heaps: &[Heap],
    known_allocations: &BTreeSet<u64>,
    sink: &dyn DiagnosticSink,
) {
    let bin_offsets: Vec<u64> = [offsets.first_free_list, offsets.last_free_list].into_iter().flatten().collect();
    let cap = known_allocations.len() + 1;
    for arena in arenas {
        for &bin_offset in &bin_offsets {
            check_list(map, width, arena, arena.address + bin_offset, heaps, known_allocations, cap, sink);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chap_address_map::{Range, RangeFlags};
    use chap_diagnostics::CollectingDiagnosticSink;

    fn words_range(base: u64, words: &[u64]) -> Range {
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        Range::new(base, bytes.len() as u64, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE | RangeFlags::IS_WRITABLE, Some(bytes))
    }

    #[test]
    fn empty_list_reports_nothing() {
        let arena_addr = 0x7f0000400000u64;
        let bin_offset = 0x50u64;
        let head_addr = arena_addr + bin_offset;
        let map = AddressMap::new(vec![words_range(head_addr, &[head_addr, head_addr])], PointerWidth::Bits64).unwrap();

        let mut offsets = ArenaOffsets::default();
        offsets.first_free_list = Some(bin_offset);
        let arena = Arena { address: arena_addr, is_main: true };
        let sink = CollectingDiagnosticSink::new();

        check_doubly_linked_lists(&map, PointerWidth::Bits64, &[arena], &offsets, &[], &BTreeSet::new(), &sink);
        assert!(sink.is_empty());
    }

    #[test]
    fn single_well_formed_node_reports_nothing() {
        let arena_addr = 0x7f0000400000u64;
        let bin_offset = 0x50u64;
        let head_addr = arena_addr + bin_offset;

        let chunk_base = 0x7f0010000000u64;
        let node = chunk_base + 16; // user address / fd-bk slot
        let next_chunk = chunk_base + 0x20;

        // head points at node both ways (single-element list); node's
        // fd/bk both point back to head; chunk header size 0x20, not
        // PREV_INUSE; trailing prev_size at next_chunk equals 0x20.
        let ranges = vec![
            words_range(head_addr, &[node, node]),
            words_range(chunk_base, &[0, 0x20]),
            words_range(node, &[head_addr, head_addr]),
            words_range(next_chunk, &[0x20]),
        ];
        let map = AddressMap::new(ranges, PointerWidth::Bits64).unwrap();

        let mut offsets = ArenaOffsets::default();
        offsets.first_free_list = Some(bin_offset);
        let arena = Arena { address: arena_addr, is_main: true };
        let known: BTreeSet<u64> = [node].into_iter().collect();
        let sink = CollectingDiagnosticSink::new();

        check_doubly_linked_lists(&map, PointerWidth::Bits64, &[arena], &offsets, &[], &known, &sink);
        assert!(sink.is_empty(), "unexpected diagnostics: {:?}", sink.events());
    }
}
