use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::module::Module;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModuleDirectoryError {
    #[error("module {0} was registered twice")]
    DuplicateModule(PathBuf),
}

/// What the analysis engine consumes from the host environment to learn
/// about loaded modules: an iterable of `(module_path, ranges, optional
/// file image bytes)`, per the module directory provider interface.
pub trait ModuleDirectoryProvider {
    fn modules(&self) -> impl Iterator<Item = Module>;
}

/// The set of modules loaded into the captured process, keyed by path and
/// queryable by address. Built once, read for the rest of the analysis.
#[derive(Debug, Default)]
pub struct ModuleDirectory {
    modules: Vec<Module>,
}

impl ModuleDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_provider(provider: &impl ModuleDirectoryProvider) -> Result<Self, ModuleDirectoryError> {
        let mut directory = Self::new();
        for module in provider.modules() {
            directory.register(module)?;
        }
        Ok(directory)
    }

    pub fn register(&mut self, module: Module) -> Result<(), ModuleDirectoryError> {
        if self.modules.iter().any(|m| m.path == module.path) {
            return Err(ModuleDirectoryError::DuplicateModule(module.path));
        }
        self.modules.push(module);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    #[must_use]
    pub fn find(&self, path: &Path) -> Option<&Module> {
        self.modules.iter().find(|m| m.path == path)
    }

    /// The module whose ranges contain `address`, if any.
    #[must_use]
    pub fn module_at(&self, address: u64) -> Option<&Module> {
        self.modules.iter().find(|m| m.contains(address))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chap_address_map::{Range, RangeFlags};

    fn module(path: &str, base: u64) -> Module {
        Module::new(
            PathBuf::from(path),
            vec![Range::new(base, 0x1000, RangeFlags::IS_MAPPED | RangeFlags::IS_EXECUTABLE, None)],
            None,
        )
    }

    #[test]
    fn rejects_duplicate_registration() {
        let mut dir = ModuleDirectory::new();
        dir.register(module("/bin/a", 0x1000)).unwrap();
        assert_eq!(dir.register(module("/bin/a", 0x2000)), Err(ModuleDirectoryError::DuplicateModule(PathBuf::from("/bin/a"))));
    }

    #[test]
    fn module_at_finds_containing_module() {
        let mut dir = ModuleDirectory::new();
        dir.register(module("/bin/a", 0x1000)).unwrap();
        dir.register(module("/lib/libc.so", 0x7f0000)).unwrap();
        assert_eq!(dir.module_at(0x1500).map(|m| m.path.as_path()), Some(Path::new("/bin/a")));
        assert_eq!(dir.module_at(0x7f0500).map(|m| m.path.as_path()), Some(Path::new("/lib/libc.so")));
        assert!(dir.module_at(0x9000).is_none());
    }
}
