/// One OS thread's captured register state, as read from a core's note
/// section: every general-purpose register the platform saved, plus the
/// stack pointer when the platform exposes it directly rather than only
/// through a named register.
#[derive(Debug, Clone, Default)]
pub struct ThreadInfo {
    pub registers: Vec<u64>,
    pub stack_pointer: Option<u64>,
}

/// The runtime-supplied source of per-thread register snapshots (§6). The
/// stack finder walks each thread's stack pointer outward to locate its
/// live range; every register is itself a stack-anchor candidate.
pub trait ThreadMapProvider {
    fn threads(&self) -> Vec<ThreadInfo>;
}
