use std::cell::RefCell;

/// The allocator subsystem a diagnostic event originated in, used as the
/// message prefix so a consumer scanning logs can tell which part of the
/// reconstruction degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    AddressMap,
    VirtualMemoryPartition,
    ModuleDirectory,
    InfrastructureFinder,
    HeapFinder,
    MainArenaFinder,
    MmappedFinder,
    CorruptionSkipper,
    FastBinFixer,
    DoublyLinkedListChecker,
    Merge,
    Graph,
    TagHolder,
    Taggers,
    StackRegistry,
}

impl Subsystem {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Subsystem::AddressMap => "address-map",
            Subsystem::VirtualMemoryPartition => "vm-partition",
            Subsystem::ModuleDirectory => "module-directory",
            Subsystem::InfrastructureFinder => "infrastructure-finder",
            Subsystem::HeapFinder => "heap-finder",
            Subsystem::MainArenaFinder => "main-arena-finder",
            Subsystem::MmappedFinder => "mmapped-finder",
            Subsystem::CorruptionSkipper => "corruption-skipper",
            Subsystem::FastBinFixer => "fast-bin-fixer",
            Subsystem::DoublyLinkedListChecker => "dll-checker",
            Subsystem::Merge => "allocation-directory",
            Subsystem::Graph => "reference-graph",
            Subsystem::TagHolder => "tag-holder",
            Subsystem::Taggers => "taggers",
            Subsystem::StackRegistry => "stack-registry",
        }
    }
}

/// A single recoverable inconsistency observed while reconstructing the
/// heap. Snapshot inconsistencies are reported here and the computation
/// continues with best-effort partial results; only invariant violations
/// (programmer errors) are allowed to panic instead.
#[derive(Debug, Clone)]
pub struct DiagnosticEvent {
    pub subsystem: Subsystem,
    pub address: Option<u64>,
    pub message: String,
}

impl DiagnosticEvent {
    #[must_use]
    pub fn new(subsystem: Subsystem, message: impl Into<String>) -> Self {
        Self { subsystem, address: None, message: message.into() }
    }

    #[must_use]
    pub fn at(subsystem: Subsystem, address: u64, message: impl Into<String>) -> Self {
        Self { subsystem, address: Some(address), message: message.into() }
    }
}

impl std::fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            Some(addr) => write!(f, "[{}] 0x{:x}: {}", self.subsystem.label(), addr, self.message),
            None => write!(f, "[{}] {}", self.subsystem.label(), self.message),
        }
    }
}

/// Where recoverable inconsistencies go. The engine never aborts on these;
/// it degrades ("leak analysis may not be accurate") and keeps going.
pub trait DiagnosticSink {
    fn report(&self, event: DiagnosticEvent);
}

/// Default sink: forwards every event to `log::warn!`, prefixed with the
/// affected subsystem and the offending address when known.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiagnosticSink;

impl DiagnosticSink for LogDiagnosticSink {
    fn report(&self, event: DiagnosticEvent) {
        log::warn!("{event}");
    }
}

/// Test-oriented sink that accumulates events instead of logging them, so
/// assertions can inspect exactly what was reported.
#[derive(Debug, Default)]
pub struct CollectingDiagnosticSink {
    events: RefCell<Vec<DiagnosticEvent>>,
}

impl CollectingDiagnosticSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DiagnosticSink for CollectingDiagnosticSink {
    fn report(&self, event: DiagnosticEvent) {
        self.events.borrow_mut().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_accumulates_in_order() {
        let sink = CollectingDiagnosticSink::new();
        sink.report(DiagnosticEvent::new(Subsystem::HeapFinder, "first"));
        sink.report(DiagnosticEvent::at(Subsystem::HeapFinder, 0x1000, "second"));
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "first");
        assert_eq!(events[1].address, Some(0x1000));
    }

    #[test]
    fn display_includes_subsystem_and_address() {
        let event = DiagnosticEvent::at(Subsystem::CorruptionSkipper, 0x2000, "bad size field");
        assert_eq!(format!("{event}"), "[corruption-skipper] 0x2000: bad size field");
    }
}
