//! Management of individual loaded modules.

use std::fmt::{self, Debug, Display};

use bitflags::bitflags;
use tracing::debug;

use crate::addr::Addr;
use crate::debug::DebugInfo;

bitflags! {
    /// `dlopen` mode bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Export symbols to default-scope lookups made by other modules.
        const GLOBAL = 1;
        /// Never release the module's memory, regardless of refcount.
        const NODELETE = 2;
        /// Only succeed if the module is already loaded.
        const NOLOAD = 4;
    }
}

impl OpenFlags {
    /// Keep exports private to explicit lookups against this handle.
    pub const LOCAL: Self = Self::empty();
    /// Accepted for source compatibility; binding is always immediate.
    pub const LAZY: Self = Self::empty();
    /// Accepted for source compatibility; binding is always immediate.
    pub const NOW: Self = Self::empty();
}

/// Opaque, stable reference to a live module: a registry slot index tagged
/// with the slot's generation, so a handle kept past the module's
/// destruction is detectably invalid instead of aliasing the slot's next
/// occupant.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle {
    pub(crate) index: u32,
    pub(crate) gen: u32,
}

impl Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.gen)
    }
}

impl Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleHandle({}v{})", self.index, self.gen)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleState {
    Loading,
    Loaded,
    Unloading,
}

/// One exported symbol of a loaded module.
#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub addr: Addr,
    pub size: u32,
}

/// A loaded module: its storage path, its memory region, and its exports.
pub struct Module {
    pub path: String,
    pub base: Addr,
    pub size: u32,
    /// Sorted by name for lookup by binary search.
    exports: Vec<Export>,
    pub(crate) refcount: u32,
    pub(crate) global: bool,
    pub(crate) pinned: bool,
    pub(crate) state: ModuleState,
    pub(crate) debug: Box<DebugInfo>,
}

impl Module {
    pub(crate) fn new(
        path: impl ToString,
        base: Addr,
        size: u32,
        mut exports: Vec<Export>,
        flags: OpenFlags,
    ) -> Self {
        exports.sort_by(|a, b| a.name.cmp(&b.name));
        let path = path.to_string();
        let debug = DebugInfo::new(&path, base, size);
        Self {
            path,
            base,
            size,
            exports,
            refcount: 1,
            global: flags.contains(OpenFlags::GLOBAL),
            pinned: flags.contains(OpenFlags::NODELETE),
            state: ModuleState::Loading,
            debug,
        }
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    pub fn lookup_export(&self, name: &str) -> Option<&Export> {
        self.exports
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.exports[i])
    }

    pub fn contains(&self, addr: Addr) -> bool {
        addr >= self.base && addr.offset_from(self.base) < self.size
    }

    /// The export with the greatest address at or below `addr`.
    pub fn nearest_export(&self, addr: Addr) -> Option<&Export> {
        self.exports
            .iter()
            .filter(|e| e.addr <= addr)
            .max_by_key(|e| e.addr)
    }
}

impl Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("path", &self.path)
            .field("base", &self.base)
            .field("size", &self.size)
            .field("refcount", &self.refcount)
            .field("global", &self.global)
            .field("pinned", &self.pinned)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        debug!("dsolink: drop module: {:?}", self);
    }
}
