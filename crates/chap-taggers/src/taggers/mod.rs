mod cow_string;
mod deque;
mod list_node;
mod map_set_node;

pub use cow_string::CowStringTagger;
pub use deque::DequeTagger;
pub use list_node::ListNodeTagger;
pub use map_set_node::MapSetNodeTagger;
