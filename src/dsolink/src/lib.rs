//! Runtime loading and linking of relocatable modules on a fixed-memory
//! console. Modules are read from block storage as `MOD1` images, placed in
//! a physical memory arena, patched in place against the main program's
//! symbol table and other live modules, and tracked behind the
//! `dlopen`/`dlsym`/`dlclose`/`dladdr`/`dlerror` facade on [`Context`].

pub mod addr;
pub mod arena;
pub mod context;
pub mod debug;
pub mod error;
pub mod image;
pub mod module;
pub mod storage;
pub mod symbol;

pub use addr::Addr;
pub use context::{AddrInfo, CloseDisposition, Context};
pub use error::DlError;
pub use module::{ModuleHandle, OpenFlags};
pub use storage::{ImageStream, RamStorage, StorageEngine};
pub use symbol::{LookupScope, MainSymbol, MainTable};
