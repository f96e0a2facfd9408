mod corruption_skipper;
mod dll_checker;
mod fast_bin_fixer;
mod finder_trait;
mod heap_finder;
mod main_arena_finder;
mod mmapped_finder;

pub use corruption_skipper::skip_corruption;
pub use dll_checker::check_doubly_linked_lists;
pub use fast_bin_fixer::fix_fast_bin_free_status;
pub use finder_trait::AllocationFinder;
pub use heap_finder::HeapFinder;
pub use main_arena_finder::MainArenaFinder;
pub use mmapped_finder::MmappedFinder;
