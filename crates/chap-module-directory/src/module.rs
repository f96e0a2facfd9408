use std::path::PathBuf;

use chap_address_map::Range;
use elf::endian::AnyEndian;
use elf::ElfBytes;

/// One loaded module (executable or shared library) and the ranges of the
/// address space it backs.
///
/// `load_bias`, `primary_symbol` and `has_debug_info` are best-effort
/// self-description, derived once from `file_image` when present. None of
/// them feed allocation or reference-graph analysis; they exist purely so a
/// consumer printing a module list has something more useful than a bare
/// path. Resolving an address to a symbol or source line is explicitly out
/// of scope here.
#[derive(Debug, Clone)]
pub struct Module {
    pub path: PathBuf,
    pub ranges: Vec<Range>,
    pub file_image: Option<Vec<u8>>,
    pub load_bias: Option<u64>,
    pub primary_symbol: Option<String>,
    pub has_debug_info: bool,
}

impl Module {
    #[must_use]
    pub fn new(path: PathBuf, ranges: Vec<Range>, file_image: Option<Vec<u8>>) -> Self {
        let (load_bias, primary_symbol, has_debug_info) = match file_image.as_deref() {
            Some(image) => describe(image, &ranges),
            None => (None, None, false),
        };
        Self { path, ranges, file_image, load_bias, primary_symbol, has_debug_info }
    }

    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(address))
    }

    #[must_use]
    pub fn lowest_base(&self) -> Option<u64> {
        self.ranges.iter().map(|r| r.base).min()
    }
}

fn describe(image: &[u8], ranges: &[Range]) -> (Option<u64>, Option<String>, bool) {
    let parsed = ElfBytes::<AnyEndian>::minimal_parse(image).ok();
    let load_bias = parsed.as_ref().and_then(|elf| load_bias(elf, ranges));
    let primary_symbol = parsed.as_ref().and_then(first_demangled_symbol);
    let has_debug_info = has_dwarf_sections(image);
    (load_bias, primary_symbol, has_debug_info)
}

fn load_bias(elf: &ElfBytes<AnyEndian>, ranges: &[Range]) -> Option<u64> {
    let segments = elf.segments()?;
    let first_load = segments.iter().find(|seg| seg.p_type == elf::abi::PT_LOAD)?;
    let lowest_base = ranges.iter().map(|r| r.base).min()?;
    Some(lowest_base.wrapping_sub(first_load.p_vaddr))
}

fn first_demangled_symbol(elf: &ElfBytes<AnyEndian>) -> Option<String> {
    let (symtab, strtab) = elf.symbol_table().ok().flatten()?;
    for symbol in symtab.iter() {
        if symbol.st_name == 0 {
            continue;
        }
        if let Ok(name) = strtab.get(symbol.st_name as usize) {
            if !name.is_empty() {
                return Some(rustc_demangle::demangle(name).to_string());
            }
        }
    }
    None
}

/// Best-effort DWARF presence check, entirely independent of the `elf`
/// crate parse above: `addr2line` bundles its own object-file reader, and
/// whether it can build a line-number context at all is all this needs —
/// never asked to resolve a specific address.
fn has_dwarf_sections(image: &[u8]) -> bool {
    use object::{Object, ObjectSection};

    let Ok(file) = object::File::parse(image) else {
        return false;
    };
    let endian = if file.is_little_endian() { gimli::RunTimeEndian::Little } else { gimli::RunTimeEndian::Big };

    const SECTION_IDS: &[gimli::SectionId] = &[
        gimli::SectionId::DebugAbbrev,
        gimli::SectionId::DebugAddr,
        gimli::SectionId::DebugAranges,
        gimli::SectionId::DebugCuIndex,
        gimli::SectionId::DebugFrame,
        gimli::SectionId::EhFrame,
        gimli::SectionId::EhFrameHdr,
        gimli::SectionId::DebugInfo,
        gimli::SectionId::DebugLine,
        gimli::SectionId::DebugLineStr,
        gimli::SectionId::DebugLoc,
        gimli::SectionId::DebugLocLists,
        gimli::SectionId::DebugMacinfo,
        gimli::SectionId::DebugMacro,
        gimli::SectionId::DebugPubNames,
        gimli::SectionId::DebugPubTypes,
        gimli::SectionId::DebugRanges,
        gimli::SectionId::DebugRngLists,
        gimli::SectionId::DebugStr,
        gimli::SectionId::DebugStrOffsets,
        gimli::SectionId::DebugTuIndex,
        gimli::SectionId::DebugTypes,
    ];

    let sections: std::collections::HashMap<gimli::SectionId, Vec<u8>> = SECTION_IDS
        .iter()
        .map(|&id| {
            let data = file
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .map(|data| data.into_owned())
                .unwrap_or_default();
            (id, data)
        })
        .collect();

    let load_section = |id: gimli::SectionId| -> Result<gimli::EndianSlice<'_, gimli::RunTimeEndian>, gimli::Error> {
        Ok(gimli::EndianSlice::new(sections.get(&id).map(Vec::as_slice).unwrap_or(&[]), endian))
    };
    let Ok(dwarf) = gimli::Dwarf::load(load_section) else {
        return false;
    };
    addr2line::Context::from_dwarf(dwarf).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chap_address_map::RangeFlags;

    #[test]
    fn module_without_image_has_no_enrichment() {
        let module = Module::new(
            PathBuf::from("/lib/libc.so.6"),
            vec![Range::new(0x7f0000, 0x1000, RangeFlags::IS_MAPPED | RangeFlags::IS_READABLE, None)],
            None,
        );
        assert!(module.load_bias.is_none());
        assert!(module.primary_symbol.is_none());
        assert!(!module.has_debug_info);
    }

    #[test]
    fn module_reports_containment() {
        let module = Module::new(
            PathBuf::from("/bin/prog"),
            vec![Range::new(0x400000, 0x1000, RangeFlags::IS_MAPPED | RangeFlags::IS_EXECUTABLE, None)],
            None,
        );
        assert!(module.contains(0x400500));
        assert!(!module.contains(0x500000));
        assert_eq!(module.lowest_base(), Some(0x400000));
    }

    #[test]
    fn malformed_image_is_tolerated() {
        let module = Module::new(
            PathBuf::from("/bin/garbage"),
            vec![Range::new(0x400000, 0x1000, RangeFlags::IS_MAPPED, None)],
            Some(vec![0u8; 16]),
        );
        assert!(module.load_bias.is_none());
        assert!(!module.has_debug_info);
    }
}
