//! Discovers a captured process's glibc allocator infrastructure with no
//! symbols to lean on: the set of arenas (main and secondary), the heaps
//! backing each secondary arena, and the byte offsets of the `malloc_state`
//! fields the rest of the reconstruction needs (`top`, `next`, the two
//! free-list bin heads), derived by structural voting rather than assumed
//! from a particular glibc version's layout.

mod arena;
mod chunk;
mod finder;
mod offsets;

pub use arena::{Arena, Heap};
pub use chunk::{
    is_plausible_main_arena_chunk, read_chunk_header, read_free_list_head, ChunkHeader, FreeListHead, IS_MMAPPED, NON_MAIN_ARENA, PREV_INUSE,
    SIZE_MASK,
};
pub use finder::{InfrastructureFinder, InfrastructureResolution};
pub use offsets::ArenaOffsets;
