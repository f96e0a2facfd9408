use chap_address_map::AddressMap;
use chap_allocation_directory::AllocationDirectory;
use chap_contiguous_image::ContiguousImageBuilder;
use chap_diagnostics::PointerWidth;

use crate::graph::{Edge, ReferenceGraph};

enum AnchorKind {
    Static,
    Stack,
}

/// Accumulates edges and anchors by source/target allocation, then
/// flattens into the read-only CSR form on [`finish`](Self::finish).
pub struct ReferenceGraphBuilder {
    num_allocations: usize,
    edges: Vec<Edge>,
    out_buckets: Vec<Vec<u32>>,
    in_buckets: Vec<Vec<u32>>,
    static_anchors: Vec<Vec<u64>>,
    stack_anchors: Vec<Vec<u64>>,
}

impl ReferenceGraphBuilder {
    #[must_use]
    pub fn new(num_allocations: usize) -> Self {
        Self {
            num_allocations,
            edges: Vec::new(),
            out_buckets: vec![Vec::new(); num_allocations],
            in_buckets: vec![Vec::new(); num_allocations],
            static_anchors: vec![Vec::new(); num_allocations],
            stack_anchors: vec![Vec::new(); num_allocations],
        }
    }

    pub fn add_edge(&mut self, source: u32, target: u32) {
        let edge_index = self.edges.len() as u32;
        self.edges.push(Edge { source, target });
        self.out_buckets[source as usize].push(edge_index);
        self.in_buckets[target as usize].push(edge_index);
    }

    /// Scans every allocation's bytes for pointer-aligned words landing
    /// inside another known allocation, emitting an edge for each (§4.6).
    pub fn scan_allocations(&mut self, directory: &AllocationDirectory, map: &AddressMap, images: &mut ContiguousImageBuilder, width: PointerWidth) {
        let ptr = width.size_of_ptr() as usize;
        for (index, record) in directory.records().iter().enumerate() {
            let image = images.build(map, record.address, record.size());
            let bytes = image.bytes();
            let mut offset = 0usize;
            while offset + ptr <= bytes.len() {
                if let Some(value) = image.read_word(offset, width) {
                    if let Some(target) = directory.allocation_index_of(value) {
                        self.add_edge(index as u32, target as u32);
                    }
                }
                offset += ptr;
            }
        }
    }

    /// Walks a module's writable byte ranges, recording the address of
    /// every pointer-aligned word whose value lies inside an allocation
    /// under that allocation's static-anchor list.
    pub fn scan_static_anchors<'b>(&mut self, directory: &AllocationDirectory, ranges: impl IntoIterator<Item = (u64, &'b [u8])>, width: PointerWidth) {
        self.scan_anchor_ranges(directory, ranges, width, AnchorKind::Static);
    }

    /// As [`scan_static_anchors`](Self::scan_static_anchors), but walks a
    /// registered stack's byte range and records under the stack-anchor
    /// list.
    pub fn scan_stack_anchors<'b>(&mut self, directory: &AllocationDirectory, ranges: impl IntoIterator<Item = (u64, &'b [u8])>, width: PointerWidth) {
        self.scan_anchor_ranges(directory, ranges, width, AnchorKind::Stack);
    }

    fn scan_anchor_ranges<'b>(&mut self, directory: &AllocationDirectory, ranges: impl IntoIterator<Item = (u64, &'b [u8])>, width: PointerWidth, kind: AnchorKind) {
        let ptr = width.size_of_ptr() as usize;
        for (base, bytes) in ranges {
            let mut offset = 0usize;
            while offset + ptr <= bytes.len() {
                let slice = &bytes[offset..offset + ptr];
                let value = match width {
                    PointerWidth::Bits64 => u64::from_le_bytes(slice.try_into().expect("slice length matches pointer width")),
                    PointerWidth::Bits32 => u32::from_le_bytes(slice.try_into().expect("slice length matches pointer width")) as u64,
                };
                if let Some(target) = directory.allocation_index_of(value) {
                    let word_address = base + offset as u64;
                    match kind {
                        AnchorKind::Static => self.static_anchors[target].push(word_address),
                        AnchorKind::Stack => self.stack_anchors[target].push(word_address),
                    }
                }
                offset += ptr;
            }
        }
    }

    #[must_use]
    pub fn finish(self) -> ReferenceGraph {
        let mut out_offsets = vec![0u32; self.num_allocations + 1];
        let mut in_offsets = vec![0u32; self.num_allocations + 1];
        let mut out_order = Vec::with_capacity(self.edges.len());
        let mut in_order = Vec::with_capacity(self.edges.len());
        for i in 0..self.num_allocations {
            out_offsets[i + 1] = out_offsets[i] + self.out_buckets[i].len() as u32;
            out_order.extend_from_slice(&self.out_buckets[i]);
            in_offsets[i + 1] = in_offsets[i] + self.in_buckets[i].len() as u32;
            in_order.extend_from_slice(&self.in_buckets[i]);
        }
        ReferenceGraph {
            num_allocations: self.num_allocations,
            edges: self.edges,
            out_offsets,
            out_order,
            in_offsets,
            in_order,
            static_anchors: self.static_anchors,
            stack_anchors: self.stack_anchors,
        }
    }
}
