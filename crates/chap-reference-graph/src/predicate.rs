use crate::graph::ReferenceGraph;

/// A pair of bitsets over edge positions: one keyed by position in the
/// outgoing adjacency order, one by position in the incoming adjacency
/// order. [`EdgePredicate::set`] takes `(source, target)` and flips both
/// positions for the edge they name, so a caller never has to reason about
/// the two numberings separately.
#[derive(Debug, Clone)]
pub struct EdgePredicate {
    outgoing: Vec<bool>,
    incoming: Vec<bool>,
}

impl EdgePredicate {
    #[must_use]
    pub fn new(graph: &ReferenceGraph) -> Self {
        Self { outgoing: vec![false; graph.out_order.len()], incoming: vec![false; graph.in_order.len()] }
    }

    #[must_use]
    pub fn for_outgoing(&self, edge: u32) -> bool {
        self.outgoing[edge as usize]
    }

    #[must_use]
    pub fn for_incoming(&self, edge: u32) -> bool {
        self.incoming[edge as usize]
    }

    /// Sets the predicate for the edge `(source, target)`, if it exists, in
    /// both the outgoing and incoming bitsets. A no-op on either side whose
    /// adjacency list does not contain the edge.
    pub fn set(&mut self, graph: &ReferenceGraph, source: u32, target: u32, value: bool) {
        if let Some(edge) = graph.outgoing_edge_of(source, target) {
            self.outgoing[edge as usize] = value;
        }
        if let Some(edge) = graph.incoming_edge_of(source, target) {
            self.incoming[edge as usize] = value;
        }
    }

    /// Clears every bit set on allocation `allocation`'s outgoing edges,
    /// used when a tag is replaced (§4.7) to drop its stale taint marks.
    pub fn clear_outgoing(&mut self, graph: &ReferenceGraph, allocation: usize) {
        for edge in graph.first_outgoing(allocation)..graph.past_outgoing(allocation) {
            self.outgoing[edge as usize] = false;
        }
    }

    /// Clears every bit set on allocation `allocation`'s incoming edges,
    /// used when a tag is replaced (§4.7) to drop stale favored-reference
    /// marks.
    pub fn clear_incoming(&mut self, graph: &ReferenceGraph, allocation: usize) {
        for edge in graph.first_incoming(allocation)..graph.past_incoming(allocation) {
            self.incoming[edge as usize] = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ReferenceGraphBuilder;

    fn two_node_graph() -> ReferenceGraph {
        let mut builder = ReferenceGraphBuilder::new(2);
        builder.add_edge(0, 1);
        builder.finish()
    }

    #[test]
    fn set_by_endpoints_flips_both_sides() {
        let graph = two_node_graph();
        let mut predicate = EdgePredicate::new(&graph);
        predicate.set(&graph, 0, 1, true);
        assert!(predicate.for_outgoing(graph.outgoing_edge_of(0, 1).unwrap()));
        assert!(predicate.for_incoming(graph.incoming_edge_of(0, 1).unwrap()));
    }

    #[test]
    fn clear_outgoing_only_touches_named_allocation() {
        let graph = two_node_graph();
        let mut predicate = EdgePredicate::new(&graph);
        predicate.set(&graph, 0, 1, true);
        predicate.clear_outgoing(&graph, 0);
        assert!(!predicate.for_outgoing(graph.outgoing_edge_of(0, 1).unwrap()));
        assert!(predicate.for_incoming(graph.incoming_edge_of(0, 1).unwrap()));
    }
}
