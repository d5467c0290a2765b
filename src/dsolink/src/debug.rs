//! Introspection surface for an external debugger.
//!
//! Each live module owns a [`DebugRecord`] with a stable `#[repr(C)]`
//! layout, and the loader funnels every registration and removal through
//! the `dsolink_module_attached`/`dsolink_module_detached` hooks below. A
//! debugger scripted to break on those symbols can read the record and
//! load or unload the matching symbol file, keyed on the module's source
//! path and load base.

use std::ffi::CString;
use std::os::raw::c_char;

/// The externally inspected part. Field order and types are part of the
/// debugger contract; do not reorder.
#[repr(C)]
#[derive(Debug)]
pub struct DebugRecord {
    /// NUL-terminated source path of the module image.
    pub path: *const c_char,
    /// Device address the module is loaded at.
    pub base: u32,
    /// Size of the module's region in bytes.
    pub size: u32,
}

/// Owns the record and the path storage it points into. Boxed by the
/// module so the record's address stays stable for the module's lifetime.
pub struct DebugInfo {
    _path: CString,
    record: DebugRecord,
}

impl DebugInfo {
    pub(crate) fn new(path: &str, base: crate::addr::Addr, size: u32) -> Box<Self> {
        // Storage paths never contain interior NULs; strip any that appear
        // so the record always carries a valid C string.
        let path = CString::new(path.replace('\0', "")).unwrap_or_default();
        let mut info = Box::new(Self {
            record: DebugRecord {
                path: std::ptr::null(),
                base: base.raw(),
                size,
            },
            _path: path,
        });
        info.record.path = info._path.as_ptr();
        info
    }

    pub fn record(&self) -> &DebugRecord {
        &self.record
    }
}

/// Breakpoint hook: called with each module's record immediately after it
/// is registered.
#[no_mangle]
#[inline(never)]
pub extern "C" fn dsolink_module_attached(record: *const DebugRecord) {
    let _ = record;
}

/// Breakpoint hook: called with each module's record immediately before
/// its memory is released.
#[no_mangle]
#[inline(never)]
pub extern "C" fn dsolink_module_detached(record: *const DebugRecord) {
    let _ = record;
}
