mod builder;
mod graph;
mod predicate;

pub use builder::ReferenceGraphBuilder;
pub use graph::{Edge, ReferenceGraph};
pub use predicate::EdgePredicate;
