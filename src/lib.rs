//! Top-level orchestration for the post-mortem heap and allocator
//! reconstruction engine.
//!
//! [`analyze`] wires every layer in the fixed construction order the rest
//! of the workspace assumes (§5, §2 of the design): a [`VmPartition`] over
//! the captured address space, the glibc allocator-infrastructure finder,
//! the per-allocation finders built from that infrastructure, the merged
//! [`AllocationDirectory`], the [`ReferenceGraph`] (including static and
//! stack anchors), the [`TagHolder`] and its tainted/favored edge
//! predicates, and finally the [`TaggerRunner`] sweep. Everything runs
//! single-threaded and single-owner: no stage needs anything from a later
//! one, so the whole pipeline is one straight-line function.

use std::collections::BTreeSet;

use chap_address_map::AddressMap;
use chap_allocation_directory::AllocationDirectory;
use chap_allocation_finders::{check_doubly_linked_lists, fix_fast_bin_free_status, HeapFinder, MainArenaFinder, MmappedFinder};
use chap_allocator_finder::InfrastructureFinder;
pub use chap_allocator_finder::InfrastructureResolution;
use chap_contiguous_image::ContiguousImageBuilder;
use chap_diagnostics::{AnalysisConfig, DiagnosticSink, PointerWidth};
use chap_module_directory::ModuleDirectory;
use chap_reference_graph::{EdgePredicate, ReferenceGraph, ReferenceGraphBuilder};
use chap_stack_registry::{StackRecord, StackRegistry, ThreadMapProvider};
use chap_tag_holder::TagHolder;
use chap_taggers::{CowStringTagger, DequeTagger, ListNodeTagger, MapSetNodeTagger, TaggerRunner};
use chap_vm_partition::{PermissionClass, VmPartition};

const MAIN_ARENA_PAGE_RUN_LABEL: &str = "main-arena-page-run";
const THREAD_STACK_LABEL: &str = "thread stack";
const MMAPPED_LABEL: &str = "mmapped";

/// Everything produced by one end-to-end run over a captured address
/// space. Borrows `map` for as long as the caller holds this report, since
/// every allocation finder inside `directory` reads directly from it.
pub struct AnalysisReport<'a> {
    pub partition: VmPartition,
    pub infrastructure: InfrastructureResolution,
    pub directory: AllocationDirectory<'a>,
    pub graph: ReferenceGraph,
    pub tag_holder: TagHolder,
    pub tainted: EdgePredicate,
    pub favored: EdgePredicate,
    pub stacks: StackRegistry,
}

/// Runs the full reconstruction pipeline over `map`.
///
/// `modules` feeds the infrastructure finder's main-arena free-list-run
/// scan and the static-anchor scan; `threads` supplies per-thread register
/// and stack-pointer snapshots for stack discovery and anchor scanning.
/// `config` is mutated in place by heuristics that adapt to what the dump
/// actually contains (most notably `max_heap_size` correction); `sink`
/// receives every recoverable inconsistency observed along the way rather
/// than aborting the analysis.
pub fn analyze<'a>(
    map: &'a AddressMap,
    width: PointerWidth,
    modules: &ModuleDirectory,
    threads: &dyn ThreadMapProvider,
    config: &mut AnalysisConfig,
    sink: &dyn DiagnosticSink,
) -> AnalysisReport<'a> {
    let mut partition = VmPartition::new(map);

    let infrastructure = InfrastructureFinder::new(map, width).resolve(config, &mut partition, Some(modules), sink);

    let mut directory = AllocationDirectory::new();
    register_heap_finders(&mut directory, map, width, &infrastructure);
    register_main_arena_finders(&mut directory, map, width, &infrastructure, &partition);
    let mmapped_finder_id = directory
        .add_finder(Box::new(MmappedFinder::new(map, width, &partition, config)))
        .expect("no finder is added after boundaries resolve");
    directory.resolve_boundaries().expect("boundaries resolve exactly once");

    claim_mmapped_spans(&mut partition, map, width, &directory, mmapped_finder_id);
    finalize_free_status(&mut directory, map, width, &infrastructure, config, sink);

    let graph = build_reference_graph(&directory, map, width, modules);
    let mut tag_holder = TagHolder::new(directory.len());
    let mut tainted = EdgePredicate::new(&graph);
    let mut favored = EdgePredicate::new(&graph);

    let stacks = register_thread_stacks(&mut partition, map, threads);

    let mut runner = TaggerRunner::new();
    register_taggers(&mut runner, &mut tag_holder);
    runner.run(&directory, &graph, &mut tag_holder, &mut tainted, &mut favored, map, width);

    partition.claim_unclaimed_ranges_as_unknown(map);

    AnalysisReport { partition, infrastructure, directory, graph, tag_holder, tainted, favored, stacks }
}

/// The address of `arena`'s top chunk, read via the derived `top` offset.
/// `None` if either isn't known or the word isn't mapped.
fn arena_top(map: &AddressMap, infrastructure: &InfrastructureResolution, arena: Option<u64>) -> Option<u64> {
    arena.and_then(|arena| infrastructure.offsets.top.and_then(|offset| map.read_word(arena + offset)))
}

/// One finder per discovered secondary-arena heap, skipping the main
/// arena's own heaps (those are walked separately as claimed page runs,
/// since the main arena is a static variable rather than a heap chain).
fn register_heap_finders<'a>(directory: &mut AllocationDirectory<'a>, map: &'a AddressMap, width: PointerWidth, infrastructure: &InfrastructureResolution) {
    let main_arena = infrastructure.main_arena_address();
    for heap in &infrastructure.heaps {
        if heap.arena_address.is_some() && heap.arena_address == main_arena {
            continue;
        }
        let is_first_heap = heap.arena_address.is_some() && heap.prev_heap == 0;
        let top = arena_top(map, infrastructure, heap.arena_address);
        let finder = HeapFinder::new(map, width, heap, &infrastructure.offsets, is_first_heap, top);
        directory.add_finder(Box::new(finder)).expect("no finder is added after boundaries resolve");
    }
}

/// One finder per main-arena page run the infrastructure finder already
/// claimed in `partition`; all runs share the main arena's single top
/// chunk, which only the run actually containing it will stop at.
fn register_main_arena_finders<'a>(directory: &mut AllocationDirectory<'a>, map: &'a AddressMap, width: PointerWidth, infrastructure: &InfrastructureResolution, partition: &VmPartition) {
    let top = arena_top(map, infrastructure, infrastructure.main_arena_address());
    let runs: Vec<(u64, u64)> = partition
        .claimed()
        .iter()
        .filter(|&(_, _, label)| *label == MAIN_ARENA_PAGE_RUN_LABEL)
        .map(|(base, size, _)| (base, size))
        .collect();
    for (base, size) in runs {
        let finder = MainArenaFinder::new(map, width, base, base + size, top);
        directory.add_finder(Box::new(finder)).expect("no finder is added after boundaries resolve");
    }
}

/// Claims the full chunk span of every allocation the mmapped finder
/// produced, reconstructed from its record (`chunk_base = address -
/// chunk_alignment`, `chunk_size = usable_size + size_of_ptr`, the exact
/// inverse of `ChunkHeader::user_address`/`usable_size`), so later stages
/// (e.g. thread-stack discovery) never mistake one for unclaimed memory.
fn claim_mmapped_spans(partition: &mut VmPartition, map: &AddressMap, width: PointerWidth, directory: &AllocationDirectory, mmapped_finder_id: chap_allocation_directory::FinderId) {
    for record in directory.records() {
        if record.finder() != mmapped_finder_id {
            continue;
        }
        let chunk_base = record.address - width.chunk_alignment();
        let chunk_size = record.size() + width.size_of_ptr();
        partition.claim_range(map, chunk_base, chunk_size, MMAPPED_LABEL, false);
    }
}

/// Doubly-linked free-list consistency check (diagnostics only) followed
/// by the fast-bin free-status correction that actually flips records'
/// `USED` flag.
fn finalize_free_status(directory: &mut AllocationDirectory, map: &AddressMap, width: PointerWidth, infrastructure: &InfrastructureResolution, config: &AnalysisConfig, sink: &dyn DiagnosticSink) {
    let known: BTreeSet<u64> = directory.records().iter().map(|r| r.address).collect();
    let arena_addresses: Vec<u64> = infrastructure.arenas.iter().map(|a| a.address).collect();

    check_doubly_linked_lists(map, width, &infrastructure.arenas, &infrastructure.offsets, &infrastructure.heaps, &known, sink);
    let now_free = fix_fast_bin_free_status(map, width, &arena_addresses, &infrastructure.offsets, config, &known, sink);
    directory.finalize_free_status(&now_free, sink).expect("free status is finalized exactly once");
}

fn build_reference_graph(directory: &AllocationDirectory, map: &AddressMap, width: PointerWidth, modules: &ModuleDirectory) -> ReferenceGraph {
    let max_size = directory.records().iter().map(|r| r.size()).max().unwrap_or(0);
    let mut images = ContiguousImageBuilder::new(max_size, width);

    let mut builder = ReferenceGraphBuilder::new(directory.len());
    builder.scan_allocations(directory, map, &mut images, width);

    let static_ranges: Vec<(u64, &[u8])> = modules
        .iter()
        .flat_map(|module| module.ranges.iter())
        .filter(|range| range.is_writable())
        .filter_map(|range| range.image.as_deref().map(|bytes| (range.base, bytes)))
        .collect();
    builder.scan_static_anchors(directory, static_ranges, width);

    builder.finish()
}

/// Registers each thread's live stack as the unclaimed writable range its
/// stack pointer falls in, claims that range from `partition`, and scans
/// it for stack anchors. A thread with no resolvable stack pointer, or
/// whose stack pointer does not land in any remaining unclaimed writable
/// range, contributes no stack to the registry.
fn register_thread_stacks(partition: &mut VmPartition, map: &AddressMap, threads: &dyn ThreadMapProvider) -> StackRegistry {
    let mut stacks = StackRegistry::new();
    for (thread_index, thread) in threads.threads().into_iter().enumerate() {
        let Some(stack_pointer) = thread.stack_pointer else { continue };
        let Some((base, size, ())) = partition.unclaimed(PermissionClass::Writable).find(stack_pointer) else { continue };
        if !partition.claim_range(map, base, size, THREAD_STACK_LABEL, false) {
            continue;
        }
        stacks.register(base, size, StackRecord::stack(THREAD_STACK_LABEL, Some(base), Some(base + size), Some(thread_index)));
    }
    stacks
}

/// The representative tagger set (§4.7): list nodes, red-black map/set
/// nodes, deques, and copy-on-write string bodies.
fn register_taggers(runner: &mut TaggerRunner, tag_holder: &mut TagHolder) {
    runner.register(Box::new(ListNodeTagger::new(tag_holder).expect("tag capacity is not exhausted during registration")));
    runner.register(Box::new(MapSetNodeTagger::new(tag_holder).expect("tag capacity is not exhausted during registration")));
    runner.register(Box::new(DequeTagger::new(tag_holder).expect("tag capacity is not exhausted during registration")));
    runner.register(Box::new(CowStringTagger::new(tag_holder).expect("tag capacity is not exhausted during registration")));
}
