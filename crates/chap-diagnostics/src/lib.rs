//! Shared error vocabulary, diagnostic reporting and tunable constants for
//! the chap-core workspace.
//!
//! Every other crate in the workspace depends on this one for the three
//! things that cut across component boundaries: how addresses are sized
//! (`PointerWidth`), how a component reports a recoverable inconsistency
//! without aborting the whole analysis (`DiagnosticSink`), and what knobs
//! the allocator heuristics are allowed to tune (`AnalysisConfig`).

mod config;
mod sink;

pub use config::AnalysisConfig;
pub use sink::{CollectingDiagnosticSink, DiagnosticEvent, DiagnosticSink, LogDiagnosticSink, Subsystem};

/// The pointer width of the captured process. Addresses are always carried
/// as `u64` regardless of width; this only affects alignment and
/// size-of-pointer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

impl PointerWidth {
    #[must_use]
    pub const fn size_of_ptr(self) -> u64 {
        match self {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }

    #[must_use]
    pub const fn chunk_alignment(self) -> u64 {
        2 * self.size_of_ptr()
    }

    #[must_use]
    pub const fn is_aligned(self, addr: u64) -> bool {
        addr % self.size_of_ptr() == 0
    }
}

/// The typed out-of-bounds-image-access condition called out in the error
/// handling design: reading a pointer-sized word whose target address is
/// not represented in the address map. Consumers either treat it as "not a
/// pointer to an allocation" or catch it locally (the corruption skipper).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("address 0x{0:x} is not mapped")]
pub struct NotMapped(pub u64);
