//! The `MOD1` relocatable image container.
//!
//! An image is laid out as a 16-byte header followed by the segment table,
//! symbol table, relocation table and string blob, with segment payloads
//! anywhere past those (each segment descriptor carries its absolute file
//! offset). All integers are little-endian.
//!
//! Segments are placed in memory in table order, each aligned to its own
//! `align`; symbol and relocation offsets are relative to their segment's
//! placement, so the packer and the loader agree on addresses without the
//! image ever naming one.

use bitflags::bitflags;
use tracing::trace;

use crate::error::DlError;
use crate::storage::{read_exact, ImageStream};

pub const MAGIC: u32 = u32::from_le_bytes(*b"MOD1");

/// Relocation symbol index standing for the module's own base address.
pub const SYM_SELF: u32 = u32::MAX;
/// Segment index marking a symbol as imported (defined elsewhere).
pub const SEG_NONE: u16 = u16::MAX;

const HEADER_LEN: usize = 16;
const SEG_ENT: usize = 16;
const SYM_ENT: usize = 16;
const REL_ENT: usize = 16;

const SYM_EXPORTED: u16 = 1;

bitflags! {
    /// Segment attribute bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SegFlags: u16 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

/// How a relocation rewrites its destination word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// Store the resolved value verbatim.
    Abs32,
    /// Store `(value + 0x8000) >> 16` in the word's low half. The bias
    /// compensates for sign-extension of the paired low half.
    High16,
    /// Store `value & 0xffff` in the word's low half.
    Low16,
    /// Pack `(value >> 2)` into the word's low 26 bits.
    Jump26,
}

impl RelocKind {
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Abs32),
            1 => Some(Self::High16),
            2 => Some(Self::Low16),
            3 => Some(Self::Jump26),
            _ => None,
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            Self::Abs32 => 0,
            Self::High16 => 1,
            Self::Low16 => 2,
            Self::Jump26 => 3,
        }
    }
}

#[derive(Debug)]
pub struct Segment {
    pub file_off: u32,
    pub file_size: u32,
    pub mem_size: u32,
    pub align: u32,
    pub flags: SegFlags,
    /// Region-relative load offset, assigned during layout.
    pub placement: u32,
}

#[derive(Debug)]
pub struct SymbolRec {
    pub name: String,
    pub seg: u16,
    pub offset: u32,
    pub size: u32,
    pub exported: bool,
}

impl SymbolRec {
    pub fn is_defined(&self) -> bool {
        self.seg != SEG_NONE
    }
}

#[derive(Debug)]
pub struct RelocRec {
    pub kind: RelocKind,
    pub seg: u16,
    pub offset: u32,
    /// Symbol table index, or [`SYM_SELF`] for a base-address reference.
    pub sym: u32,
    pub addend: i32,
}

/// A parsed image: tables only. Segment payloads stay in the stream and are
/// copied straight into module memory by the loader.
#[derive(Debug)]
pub struct Image {
    pub segments: Vec<Segment>,
    pub symbols: Vec<SymbolRec>,
    pub relocs: Vec<RelocRec>,
    pub region_size: u32,
    pub region_align: u32,
}

impl Image {
    pub fn parse(stream: &mut impl ImageStream) -> Result<Self, DlError> {
        let mut header = [0u8; HEADER_LEN];
        read_exact(stream, &mut header)?;
        if le32(&header[0..]) != MAGIC {
            return Err(DlError::invalid("bad magic"));
        }
        let seg_count = le16(&header[4..]) as usize;
        let sym_count = le16(&header[6..]) as usize;
        let reloc_count = le32(&header[8..]) as usize;
        let str_size = le32(&header[12..]) as usize;
        if seg_count == 0 {
            return Err(DlError::invalid("no segments"));
        }
        // Far beyond anything the console's storage could hold; reject
        // before sizing table buffers from untrusted counts.
        const TABLE_LIMIT: usize = 1 << 24;
        if reloc_count > TABLE_LIMIT / REL_ENT || str_size > TABLE_LIMIT {
            return Err(DlError::invalid("unreasonable table size"));
        }

        let mut seg_table = vec![0u8; seg_count * SEG_ENT];
        read_exact(stream, &mut seg_table)?;
        let mut sym_table = vec![0u8; sym_count * SYM_ENT];
        read_exact(stream, &mut sym_table)?;
        let mut rel_table = vec![0u8; reloc_count * REL_ENT];
        read_exact(stream, &mut rel_table)?;
        let mut strings = vec![0u8; str_size];
        read_exact(stream, &mut strings)?;

        let (segments, region_size, region_align) = layout_segments(&seg_table)?;

        let mut symbols = Vec::with_capacity(sym_count);
        for ent in sym_table.chunks_exact(SYM_ENT) {
            let seg = le16(&ent[8..]);
            let offset = le32(&ent[4..]);
            let sym = SymbolRec {
                name: name_at(&strings, le32(&ent[0..]))?,
                seg,
                offset,
                size: le32(&ent[12..]),
                exported: le16(&ent[10..]) & SYM_EXPORTED != 0,
            };
            if sym.is_defined() {
                let seg = segments
                    .get(seg as usize)
                    .ok_or_else(|| DlError::invalid(format!("symbol '{}' names a bad segment", sym.name)))?;
                if offset > seg.mem_size {
                    return Err(DlError::invalid(format!(
                        "symbol '{}' lies outside its segment",
                        sym.name
                    )));
                }
            }
            symbols.push(sym);
        }
        check_unique_exports(&symbols)?;

        let mut relocs = Vec::with_capacity(reloc_count);
        for ent in rel_table.chunks_exact(REL_ENT) {
            let raw_kind = le16(&ent[0..]);
            let kind = RelocKind::from_raw(raw_kind)
                .ok_or(DlError::UnsupportedRelocation { kind: raw_kind })?;
            let seg_idx = le16(&ent[2..]);
            let offset = le32(&ent[4..]);
            let sym = le32(&ent[8..]);
            let seg = segments
                .get(seg_idx as usize)
                .ok_or_else(|| DlError::invalid("relocation targets a bad segment"))?;
            if offset.checked_add(4).map_or(true, |end| end > seg.mem_size) {
                return Err(DlError::invalid("relocation lies outside its segment"));
            }
            if sym != SYM_SELF && sym as usize >= symbols.len() {
                return Err(DlError::invalid("relocation names a bad symbol"));
            }
            relocs.push(RelocRec {
                kind,
                seg: seg_idx,
                offset,
                sym,
                addend: le32(&ent[12..]) as i32,
            });
        }

        trace!(
            "image: {} segments, {} symbols, {} relocations, region {:#x}",
            segments.len(),
            symbols.len(),
            relocs.len(),
            region_size
        );
        Ok(Self {
            segments,
            symbols,
            relocs,
            region_size,
            region_align,
        })
    }

    /// Region-relative offset of a defined symbol.
    pub fn sym_offset(&self, sym: &SymbolRec) -> u32 {
        self.segments[sym.seg as usize].placement + sym.offset
    }
}

fn layout_segments(table: &[u8]) -> Result<(Vec<Segment>, u32, u32), DlError> {
    let mut segments = Vec::with_capacity(table.len() / SEG_ENT);
    let mut cursor = 0u32;
    let mut region_align = 1u32;
    for ent in table.chunks_exact(SEG_ENT) {
        let file_size = le32(&ent[4..]);
        let mem_size = le32(&ent[8..]);
        let align = le16(&ent[12..]) as u32;
        if align == 0 || !align.is_power_of_two() {
            return Err(DlError::invalid(format!("bad segment alignment {align}")));
        }
        if mem_size == 0 {
            return Err(DlError::invalid("empty segment"));
        }
        if file_size > mem_size {
            return Err(DlError::invalid("segment file size exceeds memory size"));
        }
        cursor = cursor
            .checked_add(align - 1)
            .map(|c| c & !(align - 1))
            .ok_or_else(|| DlError::invalid("segment layout overflows the address space"))?;
        segments.push(Segment {
            file_off: le32(&ent[0..]),
            file_size,
            mem_size,
            align,
            flags: SegFlags::from_bits_truncate(le16(&ent[14..])),
            placement: cursor,
        });
        cursor = cursor
            .checked_add(mem_size)
            .ok_or_else(|| DlError::invalid("segment layout overflows the address space"))?;
        region_align = region_align.max(align);
    }
    Ok((segments, cursor, region_align))
}

fn check_unique_exports(symbols: &[SymbolRec]) -> Result<(), DlError> {
    let mut names: Vec<&str> = symbols
        .iter()
        .filter(|s| s.exported && s.is_defined())
        .map(|s| s.name.as_str())
        .collect();
    names.sort_unstable();
    for pair in names.windows(2) {
        if pair[0] == pair[1] {
            return Err(DlError::invalid(format!("duplicate export '{}'", pair[0])));
        }
    }
    Ok(())
}

fn name_at(strings: &[u8], off: u32) -> Result<String, DlError> {
    let start = off as usize;
    if start >= strings.len() {
        return Err(DlError::invalid("symbol name outside string table"));
    }
    let end = strings[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .ok_or_else(|| DlError::invalid("unterminated symbol name"))?;
    std::str::from_utf8(&strings[start..end])
        .map(str::to_string)
        .map_err(|_| DlError::invalid("symbol name is not utf-8"))
}

fn le16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
