//! Shared test fixtures: a packer for `MOD1` images and a context factory.

use dsolink::arena::Arena;
use dsolink::image::{RelocKind, SegFlags, MAGIC, SEG_NONE, SYM_SELF};
use dsolink::{Addr, Context, MainSymbol, MainTable, RamStorage};

pub const POOL_BASE: Addr = Addr::new(0x8030_0000);
pub const POOL_SIZE: u32 = 64 * 1024;

struct SegSpec {
    data: Vec<u8>,
    mem_size: u32,
    align: u16,
    flags: SegFlags,
}

struct SymSpec {
    name: String,
    seg: u16,
    offset: u32,
    size: u32,
    exported: bool,
}

struct RelSpec {
    kind: RelocKind,
    seg: u16,
    offset: u32,
    sym: u32,
    addend: i32,
}

/// Emits module images in the container layout the loader consumes.
#[derive(Default)]
pub struct ImageBuilder {
    segments: Vec<SegSpec>,
    symbols: Vec<SymSpec>,
    relocs: Vec<RelSpec>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment(mut self, data: &[u8], mem_size: u32, align: u16, flags: SegFlags) -> Self {
        self.segments.push(SegSpec {
            data: data.to_vec(),
            mem_size,
            align,
            flags,
        });
        self
    }

    /// A code segment of `mem_size` zero bytes, fully present in the file.
    pub fn code_segment(self, mem_size: u32) -> Self {
        let data = vec![0u8; mem_size as usize];
        self.segment(&data, mem_size, 8, SegFlags::READ | SegFlags::EXEC)
    }

    pub fn export(mut self, name: &str, seg: u16, offset: u32, size: u32) -> Self {
        self.symbols.push(SymSpec {
            name: name.to_string(),
            seg,
            offset,
            size,
            exported: true,
        });
        self
    }

    /// An undefined symbol to be resolved at load time. Returns the symbol
    /// index relocations refer to, which is just insertion order.
    pub fn import(mut self, name: &str) -> Self {
        self.symbols.push(SymSpec {
            name: name.to_string(),
            seg: SEG_NONE,
            offset: 0,
            size: 0,
            exported: false,
        });
        self
    }

    pub fn reloc(mut self, kind: RelocKind, seg: u16, offset: u32, sym: u32, addend: i32) -> Self {
        self.relocs.push(RelSpec {
            kind,
            seg,
            offset,
            sym,
            addend,
        });
        self
    }

    /// A relocation against the module's own base address.
    pub fn self_reloc(self, kind: RelocKind, seg: u16, offset: u32, addend: i32) -> Self {
        self.reloc(kind, seg, offset, SYM_SELF, addend)
    }

    pub fn build(self) -> Vec<u8> {
        let mut strings = Vec::new();
        let name_offsets: Vec<u32> = self
            .symbols
            .iter()
            .map(|s| {
                let off = strings.len() as u32;
                strings.extend_from_slice(s.name.as_bytes());
                strings.push(0);
                off
            })
            .collect();

        let tables_end = 16
            + self.segments.len() * 16
            + self.symbols.len() * 16
            + self.relocs.len() * 16
            + strings.len();

        let mut image = Vec::new();
        image.extend_from_slice(&MAGIC.to_le_bytes());
        image.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());
        image.extend_from_slice(&(self.symbols.len() as u16).to_le_bytes());
        image.extend_from_slice(&(self.relocs.len() as u32).to_le_bytes());
        image.extend_from_slice(&(strings.len() as u32).to_le_bytes());

        let mut file_off = tables_end as u32;
        for seg in &self.segments {
            image.extend_from_slice(&file_off.to_le_bytes());
            image.extend_from_slice(&(seg.data.len() as u32).to_le_bytes());
            image.extend_from_slice(&seg.mem_size.to_le_bytes());
            image.extend_from_slice(&seg.align.to_le_bytes());
            image.extend_from_slice(&seg.flags.bits().to_le_bytes());
            file_off += seg.data.len() as u32;
        }
        for (sym, name_off) in self.symbols.iter().zip(&name_offsets) {
            image.extend_from_slice(&name_off.to_le_bytes());
            image.extend_from_slice(&sym.offset.to_le_bytes());
            image.extend_from_slice(&sym.seg.to_le_bytes());
            image.extend_from_slice(&u16::from(sym.exported).to_le_bytes());
            image.extend_from_slice(&sym.size.to_le_bytes());
        }
        for rel in &self.relocs {
            image.extend_from_slice(&rel.kind.raw().to_le_bytes());
            image.extend_from_slice(&rel.seg.to_le_bytes());
            image.extend_from_slice(&rel.offset.to_le_bytes());
            image.extend_from_slice(&rel.sym.to_le_bytes());
            image.extend_from_slice(&rel.addend.to_le_bytes());
        }
        image.extend_from_slice(&strings);
        for seg in &self.segments {
            image.extend_from_slice(&seg.data);
        }
        image
    }
}

/// A context over a 64 KiB pool with a small main-program table.
pub fn context(storage: RamStorage) -> Context<RamStorage> {
    let main = MainTable::new(vec![
        MainSymbol::new("bar", Addr::new(0x8001_0000), 4),
        MainSymbol::new("console_print", Addr::new(0x8000_2000), 0x40),
    ]);
    Context::new(storage, Arena::new(POOL_BASE, POOL_SIZE), main)
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
