//! Tracks which bytes of the captured address space have been attributed
//! to a recognized allocator structure ("claimed") and which have not
//! ("unclaimed"), as the infrastructure finder and allocation finders work
//! through the dump.
//!
//! Ranges start out unclaimed, bucketed into four permission-derived
//! classes so a finder can cheaply scan only the bucket it cares about
//! (the heap finders only ever want the writable one). As each finder
//! recognizes a span as belonging to a heap, an mmapped allocation, module
//! text, a thread stack, and so on, it calls [`VmPartition::claim_range`]
//! to move those bytes into the claimed side under a label.

use chap_address_map::{AddressMap, RangeFlags, RangeMapper};

/// One of the four buckets unclaimed (and claimed) ranges are partitioned
/// into: writable, read+execute-only, read-only, or inaccessible (mapped
/// but none of read/write/execute, or simply not represented at all).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionClass {
    Writable,
    ReadExecuteOnly,
    ReadOnly,
    Inaccessible,
}

impl PermissionClass {
    fn classify(flags: RangeFlags) -> Self {
        let writable = flags.contains(RangeFlags::IS_WRITABLE);
        let readable = flags.contains(RangeFlags::IS_READABLE);
        let executable = flags.contains(RangeFlags::IS_EXECUTABLE);
        if writable {
            PermissionClass::Writable
        } else if readable && executable {
            PermissionClass::ReadExecuteOnly
        } else if readable {
            PermissionClass::ReadOnly
        } else {
            PermissionClass::Inaccessible
        }
    }

    const ALL: [PermissionClass; 4] = [
        PermissionClass::Writable,
        PermissionClass::ReadExecuteOnly,
        PermissionClass::ReadOnly,
        PermissionClass::Inaccessible,
    ];

    fn index(self) -> usize {
        match self {
            PermissionClass::Writable => 0,
            PermissionClass::ReadExecuteOnly => 1,
            PermissionClass::ReadOnly => 2,
            PermissionClass::Inaccessible => 3,
        }
    }
}

const UNKNOWN_LABEL: &str = "unknown";

/// The virtual-memory partition built from an [`AddressMap`].
pub struct VmPartition {
    unclaimed: [RangeMapper<()>; 4],
    unclaimed_writable_with_image: RangeMapper<()>,
    static_anchor_candidates: RangeMapper<()>,
    claimed: RangeMapper<&'static str>,
    claimed_by_class: [RangeMapper<()>; 4],
    claimed_inaccessible: RangeMapper<&'static str>,
}

impl VmPartition {
    #[must_use]
    pub fn new(address_map: &AddressMap) -> Self {
        let mut unclaimed: [RangeMapper<()>; 4] = Default::default();
        let mut unclaimed_writable_with_image = RangeMapper::new();
        let mut static_anchor_candidates = RangeMapper::new();

        for range in address_map.iter() {
            if !range.is_mapped() {
                continue;
            }
            let class = PermissionClass::classify(range.flags);
            unclaimed[class.index()].insert_range(range.base, range.size, ());

            if range.is_writable() && range.image.is_some() {
                unclaimed_writable_with_image.insert_range(range.base, range.size, ());
                static_anchor_candidates.insert_range(range.base, range.size, ());
            }
        }

        Self {
            unclaimed,
            unclaimed_writable_with_image,
            static_anchor_candidates,
            claimed: RangeMapper::new(),
            claimed_by_class: Default::default(),
            claimed_inaccessible: RangeMapper::new(),
        }
    }

    #[must_use]
    pub fn unclaimed(&self, class: PermissionClass) -> &RangeMapper<()> {
        &self.unclaimed[class.index()]
    }

    #[must_use]
    pub fn unclaimed_writable_with_image(&self) -> &RangeMapper<()> {
        &self.unclaimed_writable_with_image
    }

    #[must_use]
    pub fn static_anchor_candidates(&self) -> &RangeMapper<()> {
        &self.static_anchor_candidates
    }

    #[must_use]
    pub fn claimed(&self) -> &RangeMapper<&'static str> {
        &self.claimed
    }

    #[must_use]
    pub fn claimed_by_class(&self, class: PermissionClass) -> &RangeMapper<()> {
        &self.claimed_by_class[class.index()]
    }

    #[must_use]
    pub fn claimed_inaccessible(&self) -> &RangeMapper<&'static str> {
        &self.claimed_inaccessible
    }

    /// Attempt to claim `[base, base+size)` under `label`. Returns `false`
    /// if it overlaps an already-claimed range.
    pub fn claim_range(
        &mut self,
        address_map: &AddressMap,
        base: u64,
        size: u64,
        label: &'static str,
        is_static_anchor_candidate: bool,
    ) -> bool {
        if !self.claimed.insert_range(base, size, label) {
            return false;
        }

        let Some(original) = address_map.find(base) else {
            self.claimed_inaccessible.insert_range(base, size, label);
            return true;
        };

        let class = PermissionClass::classify(original.flags);
        self.unclaimed[class.index()].erase_range(base, size);
        self.claimed_by_class[class.index()].insert_range(base, size, ());

        if original.is_writable() {
            self.unclaimed_writable_with_image.erase_range(base, size);
            if !is_static_anchor_candidate {
                self.static_anchor_candidates.erase_range(base, size);
            }
        }
        true
    }

    /// Claim every remaining unclaimed range under the `"unknown"` label.
    pub fn claim_unclaimed_ranges_as_unknown(&mut self, address_map: &AddressMap) {
        let mut pending: Vec<(u64, u64)> = Vec::new();
        for class in PermissionClass::ALL {
            pending.extend(self.unclaimed[class.index()].iter().map(|(base, size, ())| (base, size)));
        }
        for (base, size) in pending {
            self.claim_range(address_map, base, size, UNKNOWN_LABEL, false);
        }
    }
}
