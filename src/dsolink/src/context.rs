//! Management of the loader context: the module registry, symbol
//! resolution, and the public `dl*` facade.
//!
//! A [`Context`] is an explicitly owned object, not hidden process state;
//! tests build as many independent contexts as they like. All mutation goes
//! through `&mut self`, which statically enforces the single-threaded,
//! non-reentrant discipline the console runs under: a module's own load
//! cannot re-enter `dlopen` on the same context.

use std::fmt::Display;

use tracing::{debug, trace};

use crate::addr::Addr;
use crate::arena::Arena;
use crate::debug::DebugRecord;
use crate::error::DlError;
use crate::module::{Module, ModuleHandle, ModuleState, OpenFlags};
use crate::storage::StorageEngine;
use crate::symbol::{LookupScope, MainTable, ResolvedSymbol, SymbolSource};

mod load;
mod relocate;

struct Slot {
    gen: u32,
    module: Option<Module>,
}

/// Outcome of a close, internal to the registry; the facade collapses it
/// to success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Other opens still hold the module.
    StillReferenced,
    /// Refcount reached zero but the module is marked NODELETE.
    Pinned,
    /// The module was torn down and its memory released.
    Unloaded,
}

/// Reverse-lookup result for `dladdr`.
#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub path: String,
    pub base: Addr,
    pub size: u32,
    pub symbol: Option<String>,
    pub sym_addr: Option<Addr>,
}

pub struct Context<S: StorageEngine> {
    pub(crate) storage: S,
    pub(crate) arena: Arena,
    main_table: MainTable,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    /// Live modules, oldest first. This is the default search order.
    load_order: Vec<ModuleHandle>,
    last_error: Option<String>,
}

impl<S: StorageEngine> Context<S> {
    pub fn new(storage: S, arena: Arena, main_table: MainTable) -> Self {
        Self {
            storage,
            arena,
            main_table,
            slots: Vec::new(),
            free_slots: Vec::new(),
            load_order: Vec::new(),
            last_error: None,
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Look up a module by handle, rejecting stale or unknown handles.
    pub fn module(&self, handle: ModuleHandle) -> Result<&Module, DlError> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.gen == handle.gen)
            .and_then(|slot| slot.module.as_ref())
            .ok_or(DlError::InvalidHandle)
    }

    fn module_mut(&mut self, handle: ModuleHandle) -> Result<&mut Module, DlError> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.gen == handle.gen)
            .and_then(|slot| slot.module.as_mut())
            .ok_or(DlError::InvalidHandle)
    }

    /// Live modules in load order, oldest first.
    pub fn modules(&self) -> impl Iterator<Item = (ModuleHandle, &Module)> {
        self.load_order.iter().filter_map(move |&h| {
            let slot = &self.slots[h.index as usize];
            slot.module.as_ref().map(|m| (h, m))
        })
    }

    /// Debug records of every live module, in load order.
    pub fn debug_records(&self) -> impl Iterator<Item = &DebugRecord> {
        self.modules().map(|(_, m)| m.debug.record())
    }

    pub(crate) fn find_by_path(&self, path: &str) -> Option<ModuleHandle> {
        self.modules()
            .find(|(_, m)| m.path == path)
            .map(|(h, _)| h)
    }

    pub(crate) fn module_containing(&self, addr: Addr) -> Option<ModuleHandle> {
        self.modules()
            .find(|(_, m)| m.contains(addr))
            .map(|(h, _)| h)
    }

    pub(crate) fn insert_module(&mut self, mut module: Module) -> ModuleHandle {
        module.state = ModuleState::Loaded;
        let record: *const DebugRecord = module.debug.record();
        let handle = match self.free_slots.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.module = Some(module);
                ModuleHandle {
                    index,
                    gen: slot.gen,
                }
            }
            None => {
                self.slots.push(Slot {
                    gen: 0,
                    module: Some(module),
                });
                ModuleHandle {
                    index: self.slots.len() as u32 - 1,
                    gen: 0,
                }
            }
        };
        self.load_order.push(handle);
        crate::debug::dsolink_module_attached(record);
        handle
    }

    /// Resolve `name` under the given scope. See [`LookupScope`] for the
    /// search policies; default-order ties go to the oldest GLOBAL module.
    pub fn resolve(&self, scope: LookupScope, name: &str) -> Result<ResolvedSymbol, DlError> {
        let found = match scope {
            LookupScope::Module(handle) => {
                let module = self.module(handle)?;
                module.lookup_export(name).map(|e| ResolvedSymbol {
                    addr: e.addr,
                    size: e.size,
                    source: SymbolSource::Module(handle),
                })
            }
            LookupScope::Default => self.search_order(name, None, true),
            LookupScope::Next { caller } => {
                // A caller outside every module belongs to the main
                // program's search position: everything after it.
                let own = self.module_containing(caller);
                trace!("next-scope lookup for {} from {} (own: {:?})", name, caller, own);
                self.search_order(name, own, false)
            }
        };
        found.ok_or_else(|| DlError::SymbolNotFound {
            name: name.to_string(),
        })
    }

    /// Walk the default search order: main program table, then GLOBAL
    /// modules oldest first. With `resume_after` set, matching starts at
    /// the entry following that module; `include_main` is false for such
    /// resumed searches.
    fn search_order(
        &self,
        name: &str,
        resume_after: Option<ModuleHandle>,
        include_main: bool,
    ) -> Option<ResolvedSymbol> {
        if include_main {
            if let Some(sym) = self.main_table.lookup(name) {
                return Some(ResolvedSymbol {
                    addr: sym.addr,
                    size: sym.size,
                    source: SymbolSource::MainProgram,
                });
            }
        }
        let mut skipping = resume_after.is_some();
        for (handle, module) in self.modules() {
            if skipping {
                if Some(handle) == resume_after {
                    skipping = false;
                }
                continue;
            }
            if !module.global {
                continue;
            }
            if let Some(e) = module.lookup_export(name) {
                return Some(ResolvedSymbol {
                    addr: e.addr,
                    size: e.size,
                    source: SymbolSource::Module(handle),
                });
            }
        }
        trace!("no match for {} in default search order", name);
        None
    }

    /// Resolve a symbol to its address.
    pub fn lookup(&self, scope: LookupScope, name: &str) -> Result<Addr, DlError> {
        self.resolve(scope, name).map(|sym| sym.addr)
    }

    /// Drop one reference to a module, unloading it if that was the last
    /// one and the module is not pinned.
    pub fn close(&mut self, handle: ModuleHandle) -> Result<CloseDisposition, DlError> {
        let module = self.module_mut(handle)?;
        module.refcount = module.refcount.saturating_sub(1);
        if module.refcount > 0 {
            debug!("{}: closed (refcount {})", module, module.refcount);
            return Ok(CloseDisposition::StillReferenced);
        }
        if module.pinned {
            debug!("{}: refcount zero but pinned, keeping", module);
            return Ok(CloseDisposition::Pinned);
        }
        module.state = ModuleState::Unloading;
        let base = module.base;
        let record: *const DebugRecord = module.debug.record();
        crate::debug::dsolink_module_detached(record);
        debug!("{}: unloading from {}", module, base);

        let slot = &mut self.slots[handle.index as usize];
        slot.module = None;
        slot.gen += 1;
        self.free_slots.push(handle.index);
        self.load_order.retain(|&h| h != handle);
        self.arena.release(base);
        Ok(CloseDisposition::Unloaded)
    }

    /// Find the module containing `addr` and its nearest preceding export.
    pub fn addr_info(&self, addr: Addr) -> Result<AddrInfo, DlError> {
        let handle = self
            .module_containing(addr)
            .ok_or(DlError::AddressNotFound { addr })?;
        let module = self.module(handle)?;
        // An export with a known size only claims addresses inside it; a
        // zero size claims everything up to the next export.
        let export = module.nearest_export(addr).filter(|e| {
            e.size == 0 || addr.offset_from(e.addr) < e.size
        });
        Ok(AddrInfo {
            path: module.path.clone(),
            base: module.base,
            size: module.size,
            symbol: export.map(|e| e.name.clone()),
            sym_addr: export.map(|e| e.addr),
        })
    }

    // The dl* facade: a thin wrapper over the worker methods above that
    // maintains the last-error string. Each call overwrites the state
    // (set on failure, cleared on success) and `dlerror` drains it.

    pub fn dlopen(&mut self, path: &str, flags: OpenFlags) -> Option<ModuleHandle> {
        let result = self.open(path, flags);
        self.settle(result)
    }

    pub fn dlsym(&mut self, scope: LookupScope, name: &str) -> Option<Addr> {
        let result = self.lookup(scope, name);
        self.settle(result)
    }

    pub fn dlclose(&mut self, handle: ModuleHandle) -> bool {
        let result = self.close(handle);
        self.settle(result).is_some()
    }

    pub fn dladdr(&mut self, addr: Addr) -> Option<AddrInfo> {
        let result = self.addr_info(addr);
        self.settle(result)
    }

    /// The last error message, cleared on read.
    pub fn dlerror(&mut self) -> Option<String> {
        self.last_error.take()
    }

    fn settle<T>(&mut self, result: Result<T, DlError>) -> Option<T> {
        match result {
            Ok(value) => {
                self.last_error = None;
                Some(value)
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                None
            }
        }
    }
}

impl<S: StorageEngine> Display for Context<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Context({} modules loaded)", self.load_order.len())
    }
}
