//! Symbol values and the main program's build-time export table.

use crate::addr::Addr;
use crate::module::ModuleHandle;

/// One main-program export, baked in at build time.
#[derive(Debug, Clone)]
pub struct MainSymbol {
    pub name: String,
    pub addr: Addr,
    pub size: u32,
}

impl MainSymbol {
    pub fn new(name: impl ToString, addr: Addr, size: u32) -> Self {
        Self {
            name: name.to_string(),
            addr,
            size,
        }
    }
}

/// The main program's symbol table. Immutable at runtime; consulted first
/// by every default-scope lookup.
#[derive(Debug, Default)]
pub struct MainTable {
    entries: Vec<MainSymbol>,
}

impl MainTable {
    pub fn new(mut entries: Vec<MainSymbol>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self { entries }
    }

    pub fn lookup(&self, name: &str) -> Option<&MainSymbol> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }
}

/// Where a lookup searches. Pseudo-handles are variants, not sentinel
/// values, so dispatch is explicit.
#[derive(Debug, Clone, Copy)]
pub enum LookupScope {
    /// Only the named module's own exports.
    Module(ModuleHandle),
    /// The main program table, then every GLOBAL module in load order
    /// (oldest first).
    Default,
    /// The default order, resumed strictly after the module containing
    /// `caller`. Used to find the next definition of an interposed name.
    Next { caller: Addr },
}

/// Where a resolved symbol came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolSource {
    MainProgram,
    Module(ModuleHandle),
}

/// A successfully resolved symbol.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedSymbol {
    pub addr: Addr,
    pub size: u32,
    pub source: SymbolSource,
}
