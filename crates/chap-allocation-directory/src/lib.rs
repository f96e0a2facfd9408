mod directory;
mod finder_id;
mod merge;
mod record;

pub use directory::{AllocationDirectory, DirectoryError, DirectoryState};
pub use finder_id::FinderId;
pub use merge::merge_allocations;
pub use record::{AllocationRecord, RecordFlags};
