//! Read-only access to a captured process's virtual address space, plus a
//! generic disjoint-interval container used throughout the rest of the
//! workspace for anything keyed by address range (unclaimed virtual memory,
//! module-backed file ranges, allocation directories indexed by address).

mod address_map;
mod range;
mod range_mapper;

pub use address_map::AddressMap;
pub use range::{Range, RangeFlags};
pub use range_mapper::RangeMapper;
