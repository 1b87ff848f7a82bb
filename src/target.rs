use crate::{*, error::*, elf::*, procfs::*, core_dump::*, memory::*, log::*};
use libc::pid_t;
use std::{fs, os::unix::fs::MetadataExt, path::Path, sync::Arc};

pub enum MemReader {
    Pid(PidMemReader),
    CoreDump(CoreDumpMemReader),
}

impl MemReader {
    pub fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        match self {
            Self::Pid(r) => r.read(addr, buf),
            Self::CoreDump(r) => r.read(addr, buf),
        }
    }
}

// The inspected program: its memory and its executable (for symbols).
pub struct Target {
    pub mem: MemReader,
    pub exe: Arc<ElfFile>,
    // Runtime address minus link-time address.
    pub bias: usize,
    pub warnings: Vec<String>,
}

impl Target {
    pub fn attach(pid: pid_t, exe_path: Option<&str>) -> Result<Self> {
        let path = match exe_path {
            Some(p) => p.to_string(),
            None => format!("/proc/{}/exe", pid),
        };
        let exe = Arc::new(ElfFile::open(&path)?);
        let maps = MemMapsInfo::read_proc_maps(pid)?;
        let inode = fs::metadata(&path)?.ino();
        let bias = maps.load_bias(&exe, |m| m.inode == inode)?;
        Ok(Target {mem: MemReader::Pid(PidMemReader::new(pid)), exe, bias, warnings: Vec::new()})
    }

    pub fn open_core(core_path: &str, exe_path: Option<&str>) -> Result<Self> {
        let core = CoreDumpMemReader::open(core_path)?;
        let mut log = Log::new();
        let path = match exe_path {
            Some(p) => p.to_string(),
            None => {
                // The executable is normally the first file mapping.
                let p = match core.maps.maps.iter().find(|m| m.offset == 0 && m.path.is_some()).and_then(|m| m.path.clone()) {
                    Some(p) => p,
                    None => return err!(Usage, "core dump doesn't say which executable it's from, use -e"),
                };
                log!(log, "using executable {} (from the core dump), use -e to override", p);
                p
            }
        };
        let exe = Arc::new(ElfFile::open(&path)?);
        Self::from_core(core, exe, &path, log)
    }

    pub fn from_core(mut core: CoreDumpMemReader, exe: Arc<ElfFile>, exe_path: &str, mut log: Log) -> Result<Self> {
        // The path in the core may differ from the one we have (e.g. core copied from another machine), then match by file name.
        let recorded = match core.maps.maps.iter().find(|m| m.path.as_deref() == Some(exe_path)) {
            Some(m) => m.path.clone(),
            None => core.maps.maps.iter().find(|m| same_file_name(m, exe_path)).and_then(|m| m.path.clone()),
        };
        let recorded = match recorded {
            Some(p) => p,
            None => return err!(NotFound, "{} is not mapped in the core dump", exe_path),
        };
        let bias = core.maps.load_bias(&exe, |m| m.path.as_deref() == Some(recorded.as_str()))?;
        core.attach_file(&recorded, exe.clone());
        core.resolve_missing_files(&mut log);
        Ok(Target {mem: MemReader::CoreDump(core), exe, bias, warnings: log.into_lines()})
    }

    // Where the crashed thread was, if this is a core dump.
    pub fn default_address(&self) -> Option<usize> {
        match &self.mem {
            MemReader::Pid(_) => None,
            MemReader::CoreDump(c) => c.crash_rip(),
        }
    }
}

fn same_file_name(m: &MemMapInfo, path: &str) -> bool {
    match &m.path {
        Some(p) => Path::new(p).file_name().is_some() && Path::new(p).file_name() == Path::new(path).file_name(),
        None => false,
    }
}

impl MemoryView for Target {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        self.mem.read(addr, buf)
    }

    fn resolve_global(&self, name: &str) -> Result<usize> {
        match self.exe.find_symbol(name)? {
            Some(s) => Ok(s.value.wrapping_add(self.bias)),
            None => err!(NotFound, "{} not found in {}", name, self.exe.name),
        }
    }
}
