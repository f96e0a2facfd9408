mod registry;
mod thread_map;

pub use registry::{StackRecord, StackRegistry};
pub use thread_map::{ThreadInfo, ThreadMapProvider};
