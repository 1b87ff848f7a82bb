use crate::{*, error::*, elf::*, procfs::*, util::*, log::*};
use std::{io, sync::Arc, collections::HashMap};

pub const NT_PRSTATUS: u32 = 1;
pub const NT_FILE: u32 = 0x46494c45;

// Offset of user_regs_struct in elf_prstatus, and of rip in user_regs_struct.
const PRSTATUS_PR_PID_OFFSET: usize = 32;
const PRSTATUS_PR_REG_OFFSET: usize = 112;
const USER_REGS_RIP_IDX: usize = 16;

#[derive(Clone)]
pub enum CoreDumpMemorySource {
    Core {offset: usize},
    // Core dumps usually omit read-only file-backed mappings (e.g. the executable's code). We read them from the file.
    File {file: Arc<ElfFile>, offset: usize},
    MissingFile,
}

#[derive(Clone)]
pub struct CoreDumpMemoryRange {
    pub start_address: usize,
    pub len: usize,
    pub source: CoreDumpMemorySource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreThread {
    pub tid: i32,
    pub rip: usize,
}

pub struct CoreDumpMemReader {
    pub core: Arc<ElfFile>,
    pub ranges: Vec<CoreDumpMemoryRange>, // sorted by address, non-overlapping
    // File mappings from the NT_FILE note.
    pub maps: MemMapsInfo,
    // In note order; the first one is the thread that crashed.
    pub threads: Vec<CoreThread>,
}

impl CoreDumpMemReader {
    pub fn open(path: &str) -> Result<Self> {
        Self::from_elf(ElfFile::open(path)?)
    }

    pub fn from_elf(core: ElfFile) -> Result<Self> {
        if core.elf_type != ET_CORE {
            return err!(UnsupportedExecutable, "{} is not a core dump (e_type = {})", core.name, core.elf_type);
        }
        let mut ranges: Vec<CoreDumpMemoryRange> = Vec::new();
        for s in core.segments.iter().filter(|s| s.segment_type == PT_LOAD && s.size_in_memory != 0) {
            // Clamped so that no range wraps around the address space.
            let size = s.size_in_memory.min(usize::MAX - s.address);
            let in_file = s.size_in_file.min(size);
            if in_file != 0 {
                ranges.push(CoreDumpMemoryRange {start_address: s.address, len: in_file, source: CoreDumpMemorySource::Core {offset: s.offset}});
            }
            if in_file < size {
                ranges.push(CoreDumpMemoryRange {start_address: s.address + in_file, len: size - in_file, source: CoreDumpMemorySource::MissingFile});
            }
        }
        ranges.sort_by_key(|r| r.start_address);

        let mut maps = MemMapsInfo::default();
        let mut threads: Vec<CoreThread> = Vec::new();
        for note in core.notes()? {
            if note.name != "CORE" {
                continue;
            }
            match note.type_ {
                NT_FILE => maps = parse_nt_file(&note.desc)?,
                NT_PRSTATUS => {
                    let mut reader = io::Cursor::new(&note.desc[..]);
                    let rip_offset = PRSTATUS_PR_REG_OFFSET + USER_REGS_RIP_IDX * 8;
                    if note.desc.len() < rip_offset + 8 {
                        return err!(MalformedExecutable, "NT_PRSTATUS note too short: {} bytes", note.desc.len());
                    }
                    reader.skip(PRSTATUS_PR_PID_OFFSET)?;
                    let tid = reader.read_i32()?;
                    reader.skip(rip_offset - PRSTATUS_PR_PID_OFFSET - 4)?;
                    let rip = reader.read_usize()?;
                    threads.push(CoreThread {tid, rip});
                }
                _ => (),
            }
        }
        Ok(CoreDumpMemReader {core: Arc::new(core), ranges, maps, threads})
    }

    pub fn crash_rip(&self) -> Option<usize> {
        self.threads.first().map(|t| t.rip)
    }

    // Points missing ranges that NT_FILE says were mapped from `path` at the given file.
    pub fn attach_file(&mut self, path: &str, file: Arc<ElfFile>) -> usize {
        let mut attached = 0;
        for r in &mut self.ranges {
            if !matches!(r.source, CoreDumpMemorySource::MissingFile) {
                continue;
            }
            // (Ranges are not expected to partially overlap a mapping, so we don't split them.)
            let map = match self.maps.addr_to_map(r.start_address) {
                Some(m) if m.path.as_deref() == Some(path) && r.start_address + r.len <= m.start + m.len => m,
                _ => continue,
            };
            let offset = match map.offset.checked_add(r.start_address - map.start) {
                Some(o) => o,
                None => continue,
            };
            r.source = CoreDumpMemorySource::File {file: file.clone(), offset};
            attached += 1;
        }
        attached
    }

    // Opens the files behind missing ranges, where they exist on this machine.
    pub fn resolve_missing_files(&mut self, log: &mut Log) {
        let mut paths: Vec<String> = Vec::new();
        for r in &self.ranges {
            if let CoreDumpMemorySource::MissingFile = r.source {
                if let Some(p) = self.maps.addr_to_map(r.start_address).and_then(|m| m.path.clone()) {
                    if !paths.contains(&p) {
                        paths.push(p);
                    }
                }
            }
        }
        let mut opened: HashMap<String, Arc<ElfFile>> = HashMap::new();
        for p in paths {
            match ElfFile::open(&p) {
                Ok(f) => { opened.insert(p, Arc::new(f)); }
                Err(e) => log!(log, "memory mapped from {} is not in the core dump and the file can't be used: {}", p, e),
            }
        }
        for (p, f) in opened {
            self.attach_file(&p, f);
        }
    }

    pub fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let a = addr.wrapping_add(done);
            let idx = self.ranges.partition_point(|r| r.start_address + r.len <= a);
            let r = match self.ranges.get(idx) {
                Some(r) if r.start_address <= a => r,
                _ => return err!(MemoryUnreadable, "bad address 0x{:x}", a),
            };
            let off = a - r.start_address;
            let n = (r.len - off).min(buf.len() - done);
            let (data, offset) = match &r.source {
                CoreDumpMemorySource::Core {offset} => (self.core.data(), *offset),
                CoreDumpMemorySource::File {file, offset} => (file.data(), *offset),
                CoreDumpMemorySource::MissingFile => return err!(MemoryUnreadable, "0x{:x} is not in the core dump", a),
            };
            let bytes = offset.checked_add(off).and_then(|s| Some(s..s.checked_add(n)?)).and_then(|range| data.get(range));
            match bytes {
                Some(d) => buf[done..done + n].copy_from_slice(d),
                None => return err!(MemoryUnreadable, "0x{:x} is past the end of the file", a),
            }
            done += n;
        }
        Ok(())
    }
}

// count, page_size, count * (start, end, file_offset_in_pages), count * NUL-terminated path.
fn parse_nt_file(desc: &[u8]) -> Result<MemMapsInfo> {
    let mut reader = io::Cursor::new(desc);
    let count = reader.read_usize()?;
    let page_size = reader.read_usize()?;
    if count > desc.len() / 24 {
        return err!(MalformedExecutable, "NT_FILE note claims {} files in {} bytes", count, desc.len());
    }
    let mut maps: Vec<MemMapInfo> = Vec::with_capacity(count);
    for _ in 0..count {
        let start = reader.read_usize()?;
        let end = reader.read_usize()?;
        let offset = reader.read_usize()?;
        if end < start {
            return err!(MalformedExecutable, "NT_FILE has bad range 0x{:x}-0x{:x}", start, end);
        }
        maps.push(MemMapInfo {start, len: end - start, perms: MemMapPermissions::READ, offset: offset.wrapping_mul(page_size), inode: 0, path: None});
    }
    let mut rest = &desc[reader.position() as usize..];
    for m in &mut maps {
        let end = match rest.iter().position(|&c| c == 0) {
            Some(e) => e,
            None => return err!(MalformedExecutable, "NT_FILE paths are truncated"),
        };
        m.path = Some(String::from_utf8_lossy(&rest[..end]).into_owned());
        rest = &rest[end + 1..];
    }
    maps.sort_by_key(|m| m.start);
    Ok(MemMapsInfo {maps})
}
