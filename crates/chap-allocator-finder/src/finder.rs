use chap_address_map::AddressMap;
use chap_diagnostics::{AnalysisConfig, DiagnosticEvent, DiagnosticSink, PointerWidth, Subsystem};
use chap_module_directory::ModuleDirectory;
use chap_vm_partition::VmPartition;

use crate::arena::{Arena, Heap};
use crate::chunk::{self, is_plausible_main_arena_chunk, read_chunk_header};
use crate::offsets::{self, ArenaOffsets};

/// The result of resolving a dump's allocator infrastructure: every
/// discovered arena, every discovered heap, the derived `malloc_state`
/// field offsets, and the `max_heap_size` the scan converged on.
#[derive(Debug, Clone)]
pub struct InfrastructureResolution {
    pub arenas: Vec<Arena>,
    pub heaps: Vec<Heap>,
    pub offsets: ArenaOffsets,
    pub max_heap_size: u64,
}

impl InfrastructureResolution {
    #[must_use]
    pub fn main_arena_address(&self) -> Option<u64> {
        self.arenas.iter().find(|a| a.is_main).map(|a| a.address)
    }
}

pub struct InfrastructureFinder<'a> {
    map: &'a AddressMap,
    width: PointerWidth,
}

impl<'a> InfrastructureFinder<'a> {
    #[must_use]
    pub fn new(map: &'a AddressMap, width: PointerWidth) -> Self {
        Self { map, width }
    }

    /// Run the full discovery pipeline: heap-and-arena candidate scan,
    /// main-arena discovery, offset derivation by voting, max-heap-size
    /// correction, main-arena page-run discovery (claimed from
    /// `partition`), and post-derivation maintenance.
    pub fn resolve(
        &self,
        config: &mut AnalysisConfig,
        partition: &mut VmPartition,
        modules: Option<&ModuleDirectory>,
        sink: &dyn DiagnosticSink,
    ) -> InfrastructureResolution {
        let (mut heaps, mut non_main_arenas) = self.scan_candidates(config.max_heap_size);

        // Max-heap-size correction: if the scan found nothing at all, the
        // configured H may not match this build; probe downward through
        // powers of two until something turns up or we hit the floor.
        while heaps.is_empty() && non_main_arenas.is_empty() && config.halve_max_heap_size() {
            sink.report(DiagnosticEvent::new(
                Subsystem::InfrastructureFinder,
                format!("no heaps found at max_heap_size=0x{:x}, halving", config.max_heap_size * 2),
            ));
            let (h, a) = self.scan_candidates(config.max_heap_size);
            heaps = h;
            non_main_arenas = a;
        }
        // A heap whose own reported size exceeds H contradicts the bound; widen.
        if heaps.iter().any(|h| h.cur_size > config.max_heap_size) {
            config.double_max_heap_size();
        }

        let main_arena = self.discover_main_arena(modules, config, sink);

        let mut arena_addresses: Vec<u64> = non_main_arenas.clone();
        if let Some(main) = main_arena {
            arena_addresses.push(main);
        }

        let offsets = offsets::derive_offsets(&arena_addresses, self.map, self.width);
        if !offsets.is_fully_derived() {
            sink.report(DiagnosticEvent::new(
                Subsystem::InfrastructureFinder,
                "could not derive all malloc_state field offsets; degraded analysis".to_string(),
            ));
        }

        self.validate_heap_arena_pointers(&mut heaps, &arena_addresses, config, sink);

        if offsets.is_fully_derived() {
            self.discover_main_arena_page_runs(main_arena, config, partition, sink);
        }

        let mut arenas: Vec<Arena> =
            non_main_arenas.iter().map(|&address| Arena { address, is_main: false }).collect();
        if let Some(main) = main_arena {
            arenas.push(Arena { address: main, is_main: true });
        }

        InfrastructureResolution { arenas, heaps, offsets, max_heap_size: config.max_heap_size }
    }

    /// Heap-and-arena candidate scan: walk every writable range, testing
    /// every `max_heap_size`-aligned address as a candidate heap start.
    fn scan_candidates(&self, max_heap_size: u64) -> (Vec<Heap>, Vec<u64>) {
        let mut heaps = Vec::new();
        let mut arenas = Vec::new();
        let ptr = self.width.size_of_ptr();

        for range in self.map.iter() {
            if !range.is_writable() || !range.is_mapped() {
                continue;
            }
            let first_candidate = range.base.div_ceil(max_heap_size) * max_heap_size;
            let mut candidate = first_candidate;
            while candidate < range.limit() {
                if let Some(heap) = self.test_heap_candidate(candidate, max_heap_size, ptr) {
                    if let Some(arena_address) = heap.arena_address {
                        if arena_address == heap.base + 4 * ptr {
                            arenas.push(arena_address);
                        }
                    }
                    heaps.push(heap);
                }
                candidate += max_heap_size;
            }
        }
        (heaps, arenas)
    }

    fn test_heap_candidate(&self, base: u64, max_heap_size: u64, ptr: u64) -> Option<Heap> {
        let arena_ptr = self.map.read_word(base)?;
        let prev_heap = self.map.read_word(base + ptr)?;
        let cur_size = self.map.read_word(base + 2 * ptr)?;
        let max_size = self.map.read_word(base + 3 * ptr)?;

        if arena_ptr % max_heap_size != 4 * ptr {
            return None;
        }
        if prev_heap % max_heap_size != 0 {
            return None;
        }
        if cur_size == 0 || cur_size % 0x1000 != 0 {
            return None;
        }
        if max_size == 0 || max_size % 0x1000 != 0 {
            return None;
        }
        let arena_in_this_heap = arena_ptr >= base && arena_ptr < base + cur_size;
        if (prev_heap == 0) != arena_in_this_heap {
            return None;
        }

        Some(Heap { base, cur_size, prev_heap, arena_address: Some(arena_ptr), missing_or_unfilled_header: false })
    }

    /// Main-arena discovery: the main arena is a static variable inside
    /// libc's data segment rather than something reachable from a heap
    /// header, so it is located by its own structural signature — a run of
    /// consecutive, internally-consistent free-list head slots followed by
    /// a field that checks out as `top` — rather than by chasing pointers
    /// from an already-known arena (the ordinary arenas' `next` chain is
    /// only resolvable once at least one arena's layout, including the
    /// main one, is already known, so it can't bootstrap this search).
    fn discover_main_arena(
        &self,
        modules: Option<&ModuleDirectory>,
        config: &AnalysisConfig,
        sink: &dyn DiagnosticSink,
    ) -> Option<u64> {
        let run = self.scan_free_list_run(modules, config)?;
        sink.report(DiagnosticEvent::at(Subsystem::InfrastructureFinder, run, "main arena located via free-list run scan"));
        Some(run)
    }

    /// Scan for a run of `min_main_arena_freelist_run` consecutive
    /// plausible free-list head slots followed by a plausible `top` field;
    /// the main arena's address is the run's base minus the fixed offset
    /// of the free-list array within `malloc_state` (mutex, flags,
    /// `have_fastchunks`, the ten fastbin heads, `top`, `last_remainder`).
    fn scan_free_list_run(&self, modules: Option<&ModuleDirectory>, config: &AnalysisConfig) -> Option<u64> {
        const BINS_OFFSET_WORDS: u64 = 15;
        let ptr = self.width.size_of_ptr();
        let bins_offset = BINS_OFFSET_WORDS * ptr;

        let ranges: Vec<(u64, u64)> = match modules {
            Some(dir) => dir
                .iter()
                .flat_map(|m| m.ranges.iter())
                .filter(|r| r.is_writable())
                .map(|r| (r.base, r.limit()))
                .collect(),
            None => self.map.iter().filter(|r| r.is_writable()).map(|r| (r.base, r.limit())).collect(),
        };

        for (base, limit) in ranges {
            let mut addr = base;
            let mut run_start = None;
            let mut run_len = 0usize;
            while addr + 2 * ptr <= limit {
                match chunk::read_free_list_head(self.map, addr, self.width) {
                    Some(head) if head.is_consistent(addr, self.map, self.width) => {
                        if run_start.is_none() {
                            run_start = Some(addr);
                        }
                        run_len += 1;
                    }
                    _ => {
                        run_start = None;
                        run_len = 0;
                    }
                }
                if run_len >= config.min_main_arena_freelist_run {
                    if let Some(start) = run_start {
                        let arena_address = start.wrapping_sub(bins_offset);
                        if offsets::derive_top_offset(&[arena_address], self.map, self.width).is_some() {
                            return Some(arena_address);
                        }
                    }
                }
                addr += 2 * ptr;
            }
        }
        None
    }

    fn discover_main_arena_page_runs(
        &self,
        main_arena: Option<u64>,
        config: &AnalysisConfig,
        partition: &mut VmPartition,
        sink: &dyn DiagnosticSink,
    ) {
        if main_arena.is_none() {
            return;
        }
        let candidates: Vec<(u64, u64)> =
            partition.unclaimed_writable_with_image().iter().map(|(base, size, ())| (base, size)).collect();

        for (base, size) in candidates {
            let limit = base + size;
            let mut addr = base;
            let mut run_start = addr;
            let mut run_len = 0usize;
            while addr < limit {
                let Some(header) = read_chunk_header(self.map, addr, self.width) else { break };
                if header.size() == 0 {
                    break;
                }
                if is_plausible_main_arena_chunk(header, self.width) {
                    if run_len == 0 {
                        run_start = addr;
                    }
                    run_len += 1;
                } else {
                    if run_len >= config.min_main_arena_page_run_chunks || addr % 0x1000 == 0 {
                        self.claim_run(partition, run_start, addr, sink);
                    }
                    run_len = 0;
                }
                addr = header.next_chunk_base();
            }
            if run_len >= config.min_main_arena_page_run_chunks || addr % 0x1000 == 0 {
                self.claim_run(partition, run_start, addr, sink);
            }
        }
    }

    fn claim_run(&self, partition: &mut VmPartition, start: u64, end: u64, sink: &dyn DiagnosticSink) {
        if end <= start {
            return;
        }
        if !partition.claim_range(self.map, start, end - start, "main-arena-page-run", false) {
            sink.report(DiagnosticEvent::at(
                Subsystem::InfrastructureFinder,
                start,
                "main-arena page run overlaps a prior claim",
            ));
        }
    }

    /// Post-derivation maintenance: a heap whose `malloc_state` pointer
    /// didn't validate against any known arena might just be an
    /// incompletely-dumped secondary heap. Keep it, flagged, if its first
    /// chunks still parse as a plausible libc run of useful length;
    /// otherwise discard it.
    fn validate_heap_arena_pointers(
        &self,
        heaps: &mut Vec<Heap>,
        known_arenas: &[u64],
        config: &AnalysisConfig,
        sink: &dyn DiagnosticSink,
    ) {
        heaps.retain_mut(|heap| {
            let Some(arena) = heap.arena_address else { return true };
            if known_arenas.contains(&arena) {
                return true;
            }
            let run_len = self.count_leading_chunk_run(heap.base + 4 * self.width.size_of_ptr(), heap.limit());
            if run_len >= config.min_recoverable_heap_run_chunks {
                heap.arena_address = None;
                heap.missing_or_unfilled_header = true;
                sink.report(DiagnosticEvent::at(
                    Subsystem::InfrastructureFinder,
                    heap.base,
                    "heap arena pointer did not validate; retaining as missing-or-unfilled header",
                ));
                true
            } else {
                sink.report(DiagnosticEvent::at(Subsystem::InfrastructureFinder, heap.base, "discarding heap with unrecoverable arena pointer"));
                false
            }
        });
    }

    fn count_leading_chunk_run(&self, start: u64, limit: u64) -> usize {
        let mut addr = start;
        let mut count = 0usize;
        while addr < limit {
            let Some(header) = read_chunk_header(self.map, addr, self.width) else { break };
            if !is_plausible_main_arena_chunk(header, self.width) && !header.non_main_arena() {
                break;
            }
            count += 1;
            addr = header.next_chunk_base();
        }
        count
    }
}
