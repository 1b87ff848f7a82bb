use crate::{*, error::*, vm_layout::*, util::*};
use gimli::{EndianSlice, LittleEndian, Reader};

// The object files that the VM generates for traces always have the same shape: fixed section
// numbering, and a .debug_info with a single compilation unit whose DIE has DW_AT_name (inline string),
// DW_AT_low_pc, DW_AT_high_pc, DW_AT_stmt_list, in that order. So instead of going through
// .debug_abbrev we read the fields at known positions.

type Slice<'a> = EndianSlice<'a, LittleEndian>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CuHeader {
    pub version: u16,
    pub name: Vec<u8>,
    pub low_pc: u64,
    pub high_pc: u64,
}

impl CuHeader {
    pub fn contains(&self, addr: u64) -> bool {
        self.low_pc <= addr && addr < self.high_pc
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceSymbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_HEADER_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const STT_FUNC: u8 = 2;

pub fn parse_cu_header(blob: &[u8], layout: &JitLayout) -> Result<CuHeader> {
    parse_cu_header_impl(blob, layout).map_err(malformed)
}

fn malformed(e: Error) -> Error {
    if e.is_malformed_debug_blob() {
        e
    } else {
        error!(MalformedDebugBlob, "bad trace debug info: {}", e)
    }
}

fn check_elf(blob: &[u8]) -> Result<()> {
    if blob.len() < ELF_HEADER_SIZE || blob[..4] != ELF_MAGIC {
        return err!(MalformedDebugBlob, "not an ELF object ({} bytes, starts with {})", blob.len(), EscapedBytes(&blob[..blob.len().min(4)]));
    }
    Ok(())
}

// Contents of section `idx`, bounds-checked.
fn section<'a>(blob: &'a [u8], layout: &JitLayout, idx: usize) -> Result<&'a [u8]> {
    let mut r: Slice = EndianSlice::new(blob, LittleEndian);
    r.skip(layout.elf_shoff)?;
    let shoff = r.read_u64()? as usize;
    let hdr = match idx.checked_mul(layout.shdr_size).and_then(|x| x.checked_add(shoff)) {
        Some(h) if h.saturating_add(layout.shdr_size) <= blob.len() => h,
        _ => return err!(MalformedDebugBlob, "section header {} is out of bounds (e_shoff 0x{:x}, blob size {})", idx, shoff, blob.len()),
    };
    let mut r: Slice = EndianSlice::new(&blob[hdr..hdr + layout.shdr_size], LittleEndian);
    r.skip(layout.shdr_offset)?;
    let offset = r.read_u64()? as usize;
    let mut r: Slice = EndianSlice::new(&blob[hdr..hdr + layout.shdr_size], LittleEndian);
    r.skip(layout.shdr_size_field)?;
    let size = r.read_u64()? as usize;
    match offset.checked_add(size) {
        Some(end) if end <= blob.len() => Ok(&blob[offset..end]),
        _ => err!(MalformedDebugBlob, "section {} (0x{:x} + 0x{:x}) is out of bounds of the blob ({} bytes)", idx, offset, size, blob.len()),
    }
}

fn parse_cu_header_impl(blob: &[u8], layout: &JitLayout) -> Result<CuHeader> {
    check_elf(blob)?;
    let info = section(blob, layout, layout.sect_debug_info)?;
    let mut r: Slice = EndianSlice::new(info, LittleEndian);

    // Fixed prefix: unit_length, version, debug_abbrev_offset, address_size, abbreviation code.
    let unit_length = r.read_u32()? as usize;
    let version = r.read_u16()?;
    let _abbrev_offset = r.read_u32()?;
    let address_size = r.read_u8()?;
    let _abbrev_code = r.read_u8()?;
    if unit_length.saturating_add(4) > info.len() {
        return err!(MalformedDebugBlob, "unit length {} doesn't fit in .debug_info ({} bytes)", unit_length, info.len());
    }
    if !(2..=4).contains(&version) {
        return err!(MalformedDebugBlob, "unexpected DWARF version {}", version);
    }
    if address_size != 8 {
        return err!(MalformedDebugBlob, "unexpected address size {}", address_size);
    }

    let name = r.read_null_terminated_slice()?.slice().to_vec();
    let low_pc = r.read_u64()?;
    let high_pc = r.read_u64()?;
    if low_pc > high_pc {
        return err!(MalformedDebugBlob, "low_pc 0x{:x} > high_pc 0x{:x}", low_pc, high_pc);
    }
    Ok(CuHeader {version, name, low_pc, high_pc})
}

// The TRACE_<n> function symbol from .symtab, if any.
pub fn find_trace_symbol(blob: &[u8], layout: &JitLayout) -> Result<Option<TraceSymbol>> {
    check_elf(blob).and_then(|()| find_trace_symbol_impl(blob, layout)).map_err(malformed)
}

fn find_trace_symbol_impl(blob: &[u8], layout: &JitLayout) -> Result<Option<TraceSymbol>> {
    let symtab = section(blob, layout, layout.sect_symtab)?;
    let strtab = section(blob, layout, layout.sect_strtab)?;
    for sym in symtab.chunks_exact(SYM_SIZE) {
        let mut r: Slice = EndianSlice::new(sym, LittleEndian);
        let st_name = r.read_u32()? as usize;
        let st_info = r.read_u8()?;
        let _st_other = r.read_u8()?;
        let _st_shndx = r.read_u16()?;
        let value = r.read_u64()?;
        let size = r.read_u64()?;
        if st_info & 0xf != STT_FUNC {
            continue;
        }
        if st_name >= strtab.len() {
            return err!(MalformedDebugBlob, "symbol name offset {} is out of bounds of .strtab ({} bytes)", st_name, strtab.len());
        }
        let mut r: Slice = EndianSlice::new(&strtab[st_name..], LittleEndian);
        let name = String::from_utf8_lossy(r.read_null_terminated_slice()?.slice()).into_owned();
        return Ok(Some(TraceSymbol {name, value, size}));
    }
    Ok(None)
}
