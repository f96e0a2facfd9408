use chap_address_map::AddressMap;
use chap_allocation_directory::AllocationDirectory;
use chap_contiguous_image::{ContiguousImage, ContiguousImageBuilder};
use chap_diagnostics::PointerWidth;
use chap_reference_graph::{EdgePredicate, ReferenceGraph};
use chap_tag_holder::TagHolder;

use crate::context::{Pass, TaggerContext, PHASES};
use crate::tagger::Tagger;

/// Holds every registered tagger and drives the two-pass, four-phase
/// sweep over an allocation directory described in §4.7. Construction
/// order (register every tagger, then `run` once) mirrors the rest of the
/// core's single-pass, single-owner lifecycle (§5).
#[derive(Default)]
pub struct TaggerRunner {
    taggers: Vec<Box<dyn Tagger>>,
}

impl TaggerRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tagger: Box<dyn Tagger>) {
        self.taggers.push(tagger);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        directory: &AllocationDirectory,
        graph: &ReferenceGraph,
        tag_holder: &mut TagHolder,
        tainted: &mut EdgePredicate,
        favored: &mut EdgePredicate,
        map: &AddressMap,
        width: PointerWidth,
    ) {
        let max_size = directory.records().iter().map(|r| r.size()).max().unwrap_or(0);
        let mut images = ContiguousImageBuilder::new(max_size, width);
        for pass in [Pass::TagFromAllocations, Pass::TagFromReferenced] {
            for index in 0..directory.len() {
                if !directory.records()[index].is_used() {
                    continue;
                }
                self.run_allocation(index, pass, directory, graph, tag_holder, tainted, favored, map, width, &mut images);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_allocation(
        &self,
        index: usize,
        pass: Pass,
        directory: &AllocationDirectory,
        graph: &ReferenceGraph,
        tag_holder: &mut TagHolder,
        tainted: &mut EdgePredicate,
        favored: &mut EdgePredicate,
        map: &AddressMap,
        width: PointerWidth,
        images: &mut ContiguousImageBuilder,
    ) {
        let record = directory.records()[index];
        let image = images.build(map, record.address, record.size());
        let word_targets = precompute_word_targets(&image, width, directory);

        for &phase in &PHASES {
            for tagger in &self.taggers {
                let mut ctx = TaggerContext { allocation: index, phase, image, word_targets: &word_targets, width, directory, graph, tag_holder, tainted, favored, map };
                let matched = match pass {
                    Pass::TagFromAllocations => tagger.tag_from_allocation(&mut ctx),
                    Pass::TagFromReferenced => tagger.tag_from_referenced(&mut ctx),
                };
                if matched {
                    return;
                }
            }
        }
    }
}

fn precompute_word_targets(image: &ContiguousImage, width: PointerWidth, directory: &AllocationDirectory) -> Vec<usize> {
    let ptr = width.size_of_ptr() as usize;
    let bytes = image.bytes();
    let sentinel = directory.len();
    let mut targets = Vec::with_capacity(bytes.len() / ptr.max(1));
    let mut offset = 0usize;
    while offset + ptr <= bytes.len() {
        let target = image.read_word(offset, width).and_then(|value| directory.allocation_index_of(value)).unwrap_or(sentinel);
        targets.push(target);
        offset += ptr;
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use chap_address_map::{Range, RangeFlags};
    use chap_allocation_finders::AllocationFinder;
    use chap_reference_graph::ReferenceGraphBuilder;
    use chap_tag_holder::TagHolder;

    use crate::taggers::ListNodeTagger;

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

    fn finder(items: &[(u64, u64, bool)]) -> Box<dyn AllocationFinder> {
        Box::new(VecFinder { items: items.to_vec(), index: 0 })
    }

    #[test]
    fn list_node_tagger_tags_a_two_node_ring() {
        let mut dir = AllocationDirectory::new();
        dir.add_finder(finder(&[(0x2000, 0x10, true)])).unwrap();
        dir.add_finder(finder(&[(0x3000, 0x10, true)])).unwrap();
        dir.resolve_boundaries().unwrap();

        let mut a = 0x3000u64.to_le_bytes().to_vec();
        a.extend_from_slice(&0x3000u64.to_le_bytes());
        let mut b = 0x2000u64.to_le_bytes().to_vec();
        b.extend_from_slice(&0x2000u64.to_le_bytes());

        let map = AddressMap::new(
            vec![
                Range::new(0x2000, 0x10, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE, Some(a)),
                Range::new(0x3000, 0x10, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE, Some(b)),
            ],
            PointerWidth::Bits64,
        )
        .unwrap();

        let mut images = ContiguousImageBuilder::new(0x10, PointerWidth::Bits64);
        let mut graph_builder = ReferenceGraphBuilder::new(dir.len());
        graph_builder.scan_allocations(&dir, &map, &mut images, PointerWidth::Bits64);
        let graph = graph_builder.finish();

        let mut tag_holder = TagHolder::new(dir.len());
        let mut tainted = EdgePredicate::new(&graph);
        let mut favored = EdgePredicate::new(&graph);

        let mut runner = TaggerRunner::new();
        runner.register(Box::new(ListNodeTagger::new(&mut tag_holder).unwrap()));
        runner.run(&dir, &graph, &mut tag_holder, &mut tainted, &mut favored, &map, PointerWidth::Bits64);

        assert!(!tag_holder.tag_of(0).is_untagged());
        assert!(!tag_holder.tag_of(1).is_untagged());
    }
}
