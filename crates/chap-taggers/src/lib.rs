mod context;
mod runner;
mod tagger;
mod taggers;

pub use context::{Pass, Phase, TaggerContext, PHASES};
pub use runner::TaggerRunner;
pub use tagger::Tagger;
pub use taggers::{CowStringTagger, DequeTagger, ListNodeTagger, MapSetNodeTagger};
