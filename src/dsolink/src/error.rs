//! Definitions for errors for the module loader.

use miette::Diagnostic;
use thiserror::Error;

use crate::addr::Addr;

/// Every way a loader operation can fail. The `Display` rendering of a
/// variant is exactly the message later returned by `dlerror`.
#[derive(Debug, Error, Diagnostic)]
pub enum DlError {
    #[error("module not found: {path}")]
    NotFound { path: String },
    #[error("invalid module image: {reason}")]
    InvalidImage { reason: String },
    #[error("truncated module image: wanted {wanted} bytes, got {got}")]
    TruncatedImage { wanted: usize, got: usize },
    #[error("unsupported relocation kind {kind}")]
    UnsupportedRelocation { kind: u16 },
    #[error("unresolved symbol '{name}' while linking {module}")]
    UnresolvedSymbol { name: String, module: String },
    #[error("out of module memory: no free range fits {size} bytes (align {align})")]
    OutOfMemory { size: u32, align: u32 },
    #[error("symbol not found: {name}")]
    SymbolNotFound { name: String },
    #[error("invalid module handle")]
    InvalidHandle,
    #[error("no loaded module contains address {addr}")]
    AddressNotFound { addr: Addr },
    #[error("module not loaded: {path}")]
    NotLoaded { path: String },
}

impl DlError {
    pub(crate) fn invalid(reason: impl ToString) -> Self {
        Self::InvalidImage {
            reason: reason.to_string(),
        }
    }
}
