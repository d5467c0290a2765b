//! The `dlopen` pipeline: storage → parse → reserve → copy → relocate →
//! register, unwinding completely on any failure.

use tracing::{debug, trace};

use crate::addr::Addr;
use crate::error::DlError;
use crate::image::Image;
use crate::module::{Export, Module, ModuleHandle, OpenFlags};
use crate::storage::{ImageStream, StorageEngine};

use super::Context;

impl<S: StorageEngine> Context<S> {
    /// Load the module at `path`, or take another reference to it if it is
    /// already live. Repeat opens can widen visibility to GLOBAL and set
    /// NODELETE; they never narrow either.
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<ModuleHandle, DlError> {
        if let Some(handle) = self.find_by_path(path) {
            let module = self.module_mut(handle)?;
            module.refcount += 1;
            if flags.contains(OpenFlags::GLOBAL) && !module.global {
                debug!("{}: widening visibility to global", module);
                module.global = true;
            }
            if flags.contains(OpenFlags::NODELETE) && !module.pinned {
                debug!("{}: pinning", module);
                module.pinned = true;
            }
            debug!("{}: reopened (refcount {})", module, module.refcount);
            return Ok(handle);
        }
        if flags.contains(OpenFlags::NOLOAD) {
            return Err(DlError::NotLoaded {
                path: path.to_string(),
            });
        }

        let mut stream = self.storage.open(path)?;
        let image = Image::parse(&mut stream)?;
        let base = self.arena.reserve(image.region_size, image.region_align)?;
        match self.install(path, flags, &image, base, &mut stream) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                // Nothing was registered yet; dropping the reservation
                // finishes the unwind.
                self.arena.release(base);
                Err(err)
            }
        }
    }

    fn install(
        &mut self,
        path: &str,
        flags: OpenFlags,
        image: &Image,
        base: Addr,
        stream: &mut S::Stream,
    ) -> Result<ModuleHandle, DlError> {
        self.arena.slice_mut(base, image.region_size).fill(0);
        for seg in &image.segments {
            if seg.file_size == 0 {
                continue;
            }
            trace!(
                "{}: segment at base+{:#x} ({:#x} of {:#x} bytes from file, {:?})",
                path,
                seg.placement,
                seg.file_size,
                seg.mem_size,
                seg.flags
            );
            stream.seek(seg.file_off);
            let dst = self.arena.slice_mut(base.offset(seg.placement), seg.file_size);
            let got = stream.read(dst);
            if got < seg.file_size as usize {
                return Err(DlError::TruncatedImage {
                    wanted: seg.file_size as usize,
                    got,
                });
            }
        }

        self.relocate(path, image, base)?;

        let exports: Vec<Export> = image
            .symbols
            .iter()
            .filter(|s| s.exported && s.is_defined())
            .map(|s| Export {
                name: s.name.clone(),
                addr: base.offset(image.sym_offset(s)),
                size: s.size,
            })
            .collect();
        debug!(
            "{}: loaded to {} ({:#x} bytes, {} exports)",
            path,
            base,
            image.region_size,
            exports.len()
        );
        let module = Module::new(path, base, image.region_size, exports, flags);
        Ok(self.insert_module(module))
    }
}
