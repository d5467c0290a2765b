//! The relocation engine: a single file-order pass patching freshly
//! copied, not-yet-published module memory. Nothing else can observe the
//! region until the load commits, so every patch is a plain word update.

use tracing::{debug, error, trace};

use crate::addr::Addr;
use crate::error::DlError;
use crate::image::{Image, RelocKind, RelocRec, SYM_SELF};
use crate::storage::StorageEngine;
use crate::symbol::LookupScope;

use super::Context;

impl<S: StorageEngine> Context<S> {
    pub(crate) fn relocate(&mut self, path: &str, image: &Image, base: Addr) -> Result<(), DlError> {
        debug!("{}: applying {} relocations", path, image.relocs.len());
        for rel in &image.relocs {
            let target = self.reloc_target(path, image, base, rel)?;
            let value = target.wrapping_add_signed(rel.addend);
            let loc = base.offset(image.segments[rel.seg as usize].placement + rel.offset);
            match rel.kind {
                RelocKind::Abs32 => self.arena.write_u32(loc, value),
                RelocKind::High16 => {
                    // Bias for the sign-extension of the paired low half.
                    let hi = value.wrapping_add(0x8000) >> 16;
                    self.patch_low16(loc, hi as u16);
                }
                RelocKind::Low16 => self.patch_low16(loc, value as u16),
                RelocKind::Jump26 => {
                    let word = self.arena.read_u32(loc);
                    self.arena
                        .write_u32(loc, (word & 0xfc00_0000) | ((value >> 2) & 0x03ff_ffff));
                }
            }
            trace!(
                "{}: {:?} at {} <- {:#010x} (addend {})",
                path,
                rel.kind,
                loc,
                value,
                rel.addend
            );
        }
        Ok(())
    }

    /// The address a relocation entry refers to, before its addend.
    fn reloc_target(
        &self,
        path: &str,
        image: &Image,
        base: Addr,
        rel: &RelocRec,
    ) -> Result<u32, DlError> {
        if rel.sym == SYM_SELF {
            return Ok(base.raw());
        }
        let sym = &image.symbols[rel.sym as usize];
        if sym.is_defined() {
            return Ok(base.offset(image.sym_offset(sym)).raw());
        }
        // Imported: the module being linked is not registered yet, so the
        // default search sees exactly the main program and the modules
        // loaded before it.
        match self.resolve(LookupScope::Default, &sym.name) {
            Ok(resolved) => {
                trace!(
                    "{}: resolved '{}' to {} ({:?})",
                    path,
                    sym.name,
                    resolved.addr,
                    resolved.source
                );
                Ok(resolved.addr.raw())
            }
            Err(_) => {
                error!("{}: needed symbol '{}' not found", path, sym.name);
                Err(DlError::UnresolvedSymbol {
                    name: sym.name.clone(),
                    module: path.to_string(),
                })
            }
        }
    }

    /// Replace the low half of the word at `loc`, preserving the
    /// instruction's opcode and register fields in the high half.
    fn patch_low16(&mut self, loc: Addr, imm: u16) {
        let word = self.arena.read_u32(loc);
        self.arena.write_u32(loc, (word & 0xffff_0000) | imm as u32);
    }
}
