use std::{fs::File, io::{self, Seek, SeekFrom, Read}};
use std::collections::HashMap;
use memmap2::Mmap;
use crate::{*, error::*, util::*};

pub struct ElfSection {
    pub idx: usize,
    pub name: String,

    pub section_type: u32,
    pub flags: u64,

    pub address: usize,
    pub offset: usize,
    pub size: usize,

    pub link: u32,
    pub info: u32,
    pub alignment: usize,
    pub entry_size: usize,

    pub name_offset_in_strtab: u32,
}

pub struct ElfSegment {
    pub idx: usize,
    pub segment_type: u32,
    pub flags: u32,
    pub offset: usize,
    pub address: usize,
    pub size_in_file: usize,
    pub size_in_memory: usize,
}

#[derive(Clone, Debug)]
pub struct ElfNote {
    pub type_: u32,
    pub name: String,
    pub desc: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElfSymbol {
    pub name: String,
    pub value: usize,
    pub size: usize,
    pub sym_type: u8,
    pub section_idx: u16,
}

enum ElfData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

pub struct ElfFile {
    pub name: String, // just for logging
    pub elf_type: u16,

    pub segments: Vec<ElfSegment>,
    pub sections: Vec<ElfSection>,
    pub entry_point: usize,

    pub section_by_name: HashMap<String, usize>,

    data: ElfData,
}

pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const ET_CORE: u16 = 4;

pub const PT_LOAD: u32 = 1;
pub const PT_NOTE: u32 = 4;

pub const SHT_SYMTAB: u32 = 0x2;
pub const SHT_NOTE: u32 = 0x7;
pub const SHT_NOBITS: u32 = 0x8;
pub const SHT_DYNSYM: u32 = 0xb;

pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;

pub const SHN_UNDEF: u16 = 0;

const SYM_SIZE: usize = 24;

impl ElfFile {
    pub fn open(path: &str) -> Result<Self> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => return Err(error!(NotFound, "{}: {}", path, e)),
        };
        let len = file.metadata()?.len();
        if len == 0 {
            return err!(MalformedExecutable, "{} is empty", path);
        }
        let mmapped = unsafe {Mmap::map(&file)}?;
        open_elf(path.to_string(), ElfData::Mapped(mmapped))
    }

    pub fn from_contents(name: String, contents: Vec<u8>) -> Result<Self> {
        open_elf(name, ElfData::Owned(contents))
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            ElfData::Mapped(m) => &m[..],
            ElfData::Owned(v) => &v[..],
        }
    }

    pub fn section_data(&self, idx: usize) -> &[u8] {
        let s = &self.sections[idx];
        &self.data()[s.offset..s.offset + s.size_in_file()]
    }

    pub fn section_data_by_name<'a>(&'a self, name: &str) -> Option<&'a [u8]> {
        self.section_by_name.get(name).map(|i| self.section_data(*i))
    }

    // Part of the segment that's present in the file.
    pub fn segment_data(&self, idx: usize) -> &[u8] {
        let s = &self.segments[idx];
        &self.data()[s.offset..s.offset + s.size_in_file]
    }

    // Notes from all PT_NOTE segments (that's where core dumps have them), or from SHT_NOTE sections if there are no segments.
    pub fn notes(&self) -> Result<Vec<ElfNote>> {
        let mut res: Vec<ElfNote> = Vec::new();
        for s in &self.segments {
            if s.segment_type == PT_NOTE {
                res.append(&mut parse_notes(self.segment_data(s.idx))?);
            }
        }
        if self.segments.is_empty() {
            for s in &self.sections {
                if s.section_type == SHT_NOTE {
                    res.append(&mut parse_notes(self.section_data(s.idx))?);
                }
            }
        }
        Ok(res)
    }

    // Link-time address of the first PT_LOAD segment, rounded down to its file offset's page.
    pub fn first_load_address(&self) -> Option<usize> {
        self.segments.iter().filter(|s| s.segment_type == PT_LOAD).min_by_key(|s| s.address).map(|s| s.address.wrapping_sub(s.offset))
    }

    // Searches .symtab, then .dynsym. Undefined symbols are skipped.
    pub fn find_symbol(&self, name: &str) -> Result<Option<ElfSymbol>> {
        for section_type in [SHT_SYMTAB, SHT_DYNSYM] {
            for s in self.sections.iter().filter(|s| s.section_type == section_type) {
                let strtab_idx = s.link as usize;
                if strtab_idx >= self.sections.len() {
                    return err!(MalformedExecutable, "{}: section {} links to nonexistent string table {}", self.name, s.name, strtab_idx);
                }
                let strtab = self.section_data(strtab_idx);
                let mut reader = io::Cursor::new(self.section_data(s.idx));
                for _ in 0..s.size_in_file() / SYM_SIZE {
                    let name_offset = reader.read_u32()? as usize;
                    let info = reader.read_u8()?;
                    let _other = reader.read_u8()?;
                    let section_idx = reader.read_u16()?;
                    let value = reader.read_u64()? as usize;
                    let size = reader.read_u64()? as usize;
                    if section_idx == SHN_UNDEF || strtab_bytes(strtab, name_offset) != name.as_bytes() {
                        continue;
                    }
                    return Ok(Some(ElfSymbol {name: name.to_string(), value, size, sym_type: info & 0xf, section_idx}));
                }
            }
        }
        Ok(None)
    }
}

impl ElfSection {
    pub fn size_in_file(&self) -> usize {
        if self.section_type == SHT_NOBITS {
            0
        } else {
            self.size
        }
    }
}

// NUL-terminated string at `offset`, or empty if out of bounds.
fn strtab_bytes(strtab: &[u8], offset: usize) -> &[u8] {
    let s = match strtab.get(offset..) {
        Some(s) => s,
        None => return &[],
    };
    match s.iter().position(|&b| b == 0) {
        Some(end) => &s[..end],
        None => s,
    }
}

pub fn parse_notes(data: &[u8]) -> Result<Vec<ElfNote>> {
    let mut reader = io::Cursor::new(data);
    let mut res: Vec<ElfNote> = Vec::new();
    while (reader.position() as usize) < data.len() {
        let name_len = reader.read_u32()? as usize;
        let desc_len = reader.read_u32()? as usize;
        let type_ = reader.read_u32()?;
        if name_len > data.len() || desc_len > data.len() {
            return err!(MalformedExecutable, "note size out of bounds: name {}, desc {}", name_len, desc_len);
        }
        let mut buf = vec![0u8; (name_len + 3) / 4 * 4];
        reader.read_exact(&mut buf)?;
        buf.truncate(name_len);
        while buf.last() == Some(&0) {
            buf.pop();
        }
        let name = String::from_utf8(buf)?;
        let mut buf = vec![0u8; (desc_len + 3) / 4 * 4];
        reader.read_exact(&mut buf)?;
        buf.truncate(desc_len);
        res.push(ElfNote {type_: type_, name: name, desc: buf});
    }
    Ok(res)
}

fn open_elf(name: String, data: ElfData) -> Result<ElfFile> {
    let mut elf = ElfFile {name, elf_type: 0, segments: Vec::new(), sections: Vec::new(), entry_point: 0, section_by_name: HashMap::new(), data};
    let data = elf.data();
    let mut reader = io::Cursor::new(data);

    let magic = reader.read_u32()?;
    if magic != 0x464c457f { return err!(MalformedExecutable, "invalid ELF magic bytes: 0x{:x}", magic); }

    let x = reader.read_u8()?;
    if x == 1 { return err!(UnsupportedExecutable, "32-bit executables are not supported"); }
    if x != 2 { return err!(MalformedExecutable, "invalid EI_CLASS: {}", x); }

    let x = reader.read_u8()?;
    if x == 2 { return err!(UnsupportedExecutable, "big-endian executables are not supported"); }
    if x != 1 { return err!(MalformedExecutable, "invalid EI_DATA: {}", x); }

    let x = reader.read_u8()?;
    if x != 1 { return err!(MalformedExecutable, "invalid EI_VERSION: {}", x); }

    let abi = reader.read_u8()?;
    if abi != 0 && abi != 3 { return err!(UnsupportedExecutable, "only Linux and System V ABIs are supported (got: EI_OSABI = {})", abi); }

    reader.read_u64()?;

    let elf_type = reader.read_u16()?;
    if !(ET_REL..=ET_CORE).contains(&elf_type) { return err!(UnsupportedExecutable, "unexpected e_type: {}", elf_type); }

    let machine = reader.read_u16()?;
    if machine != 0x3e { return err!(UnsupportedExecutable, "only AMD x86-64 is supported (got: e_machine = {})", machine); }

    let x = reader.read_u32()?;
    if x != 1 { return err!(MalformedExecutable, "invalid e_version: {}", x); }

    let entry_point = reader.read_u64()? as usize;
    let program_header_table_offset = reader.read_u64()?;
    let section_header_table_offset = reader.read_u64()?;
    let _flags = reader.read_u32()?;
    let _header_size = reader.read_u16()?;

    let program_header_entry_size = reader.read_u16()? as usize;
    let program_header_entry_count = reader.read_u16()? as usize;
    let section_header_entry_size = reader.read_u16()? as usize;
    let section_header_entry_count = reader.read_u16()? as usize;
    let section_names_section_idx = reader.read_u16()? as usize;

    let mut segments: Vec<ElfSegment> = Vec::new();
    if program_header_entry_count > 0 && program_header_entry_size < 0x38 { return err!(MalformedExecutable, "invalid program header entry size: {}", program_header_entry_size); }
    for idx in 0..program_header_entry_count {
        reader.seek(SeekFrom::Start(program_header_table_offset + (idx * program_header_entry_size) as u64))?;
        let segment_type = reader.read_u32()?;
        let flags = reader.read_u32()?;
        let offset = reader.read_u64()? as usize;
        let address = reader.read_u64()? as usize;
        let _physical_address = reader.read_u64()?;
        let mut size_in_file = reader.read_u64()? as usize;
        let size_in_memory = reader.read_u64()? as usize;
        if offset.saturating_add(size_in_file) > data.len() {
            // Truncated core dumps are common. Keep what's there.
            eprintln!("warning: {}: segment {} out of bounds: {} + {} > {}", elf.name, idx, offset, size_in_file, data.len());
            size_in_file = data.len().saturating_sub(offset);
        }
        segments.push(ElfSegment {idx, segment_type, flags, offset: offset.min(data.len()), address, size_in_file, size_in_memory});
    }

    let mut sections: Vec<ElfSection> = Vec::new();
    if section_header_entry_count > 0 && section_header_entry_size < 0x40 { return err!(MalformedExecutable, "invalid section header entry size: {}", section_header_entry_size); }
    for idx in 0..section_header_entry_count {
        reader.seek(SeekFrom::Start(section_header_table_offset + (idx * section_header_entry_size) as u64))?;
        let mut s = ElfSection {
            idx,
            name: String::new(),
            name_offset_in_strtab: reader.read_u32()?,
            section_type: reader.read_u32()?,
            flags: reader.read_u64()?,
            address: reader.read_u64()? as usize,
            offset: reader.read_u64()? as usize,
            size: reader.read_u64()? as usize,
            link: reader.read_u32()?,
            info: reader.read_u32()?,
            alignment: reader.read_u64()? as usize,
            entry_size: reader.read_u64()? as usize,
        };
        if s.offset.saturating_add(s.size_in_file()) > data.len() {
            eprintln!("warning: {}: section {} (type 0x{:x}) out of bounds: {} + {} > {}", elf.name, idx, s.section_type, s.offset, s.size_in_file(), data.len());
            s.offset = s.offset.min(data.len());
            s.size = s.size.min(data.len() - s.offset);
        }
        sections.push(s);
    }

    let mut section_by_name: HashMap<String, usize> = HashMap::new();
    if section_names_section_idx < sections.len() {
        let names = &sections[section_names_section_idx];
        let strtab = &data[names.offset..names.offset + names.size_in_file()];
        for s in &mut sections {
            s.name = String::from_utf8_lossy(strtab_bytes(strtab, s.name_offset_in_strtab as usize)).into_owned();
            section_by_name.entry(s.name.clone()).or_insert(s.idx);
        }
    }

    elf.elf_type = elf_type;
    elf.entry_point = entry_point;
    elf.segments = segments;
    elf.sections = sections;
    elf.section_by_name = section_by_name;
    Ok(elf)
}

#[cfg(test)]
mod tests {
    use crate::{*, elf::*, testing::*, util::*};

    #[test]
    fn parse_trace_object() {
        let blob = build_trace_blob("t", 0x1000, 0x1080, 42);
        let elf = ElfFile::from_contents("trace".to_string(), blob).unwrap();
        assert_eq!(elf.elf_type, ET_REL);
        assert!(elf.segments.is_empty());
        assert_eq!(elf.sections.len(), 9);
        assert_eq!(elf.sections[5].section_type, SHT_SYMTAB);
        let sym = elf.find_symbol("TRACE_42").unwrap().unwrap();
        assert_eq!(sym.size, 0x80);
        assert_eq!(sym.sym_type, STT_FUNC);
        assert!(elf.find_symbol("TRACE_43").unwrap().is_none());
        // The file symbol has no section but isn't SHN_UNDEF.
        assert!(elf.find_symbol("JIT mcode").unwrap().is_some());
        assert!(elf.notes().unwrap().is_empty());
    }

    #[test]
    fn notes() {
        let data = build_notes(&[("CORE", 1, vec![1u8, 2, 3, 4, 5]), ("LINUX", 0x46494c45, vec![])]);
        let notes = parse_notes(&data).unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].name, "CORE");
        assert_eq!(notes[0].desc, vec![1, 2, 3, 4, 5]);
        assert_eq!(notes[1].type_, 0x46494c45);
        assert_eq!(notes[1].name, "LINUX");

        assert!(parse_notes(&data[..10]).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(ElfFile::from_contents("x".to_string(), b"not an elf at all".to_vec()).is_err());
        let mut blob = build_trace_blob("t", 0, 1, 1);
        blob[4] = 1;
        assert!(ElfFile::from_contents("x".to_string(), blob).is_err());
        assert!(ElfFile::open("/nonexistent/ujit").err().unwrap().is_not_found());
    }
}
