mod holder;
mod tag_index;

pub use holder::{TagDescriptor, TagHolder, TagHolderError};
pub use tag_index::TagIndex;
