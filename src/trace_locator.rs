use crate::{*, error::*, memory::*, settings::*, vm_layout::*, jit_registry::*, debug_blob::*, util::*, log::*};
use std::{fmt, path::{Path, PathBuf}};

// Finding the compiled trace that contains a given machine code address, so that its debug info can be
// loaded into a debugger (otherwise backtraces through JIT code are garbage).

pub struct TraceMatch {
    pub entry: TraceDebugEntry,
    pub cu: CuHeader,
    // Copy of the entry's object file.
    pub blob: Vec<u8>,
}

impl TraceMatch {
    pub fn low_pc(&self) -> u64 { self.cu.low_pc }
    pub fn high_pc(&self) -> u64 { self.cu.high_pc }
    pub fn blob_start(&self) -> usize { self.entry.blob_range().0 }
    pub fn blob_end(&self) -> usize { self.entry.blob_range().1 }
}

pub enum TraceLookup {
    Found(TraceMatch),
    NotFound {entries_scanned: usize},
}

pub struct TraceSearch {
    pub lookup: TraceLookup,
    pub entries_scanned: usize,
    // The list couldn't be followed to the end; entries after the break weren't looked at.
    pub aborted: Option<Error>,
    pub warnings: Vec<String>,
}

impl TraceSearch {
    pub fn found(&self) -> Option<&TraceMatch> {
        match &self.lookup {
            TraceLookup::Found(m) => Some(m),
            TraceLookup::NotFound {..} => None,
        }
    }
}

impl fmt::Display for TraceSearch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lookup {
            TraceLookup::Found(m) => write!(f, "entry {} (0x{:x}): {} [0x{:x}, 0x{:x}), debug object 0x{:x}-0x{:x}", m.entry.index, m.entry.addr, EscapedBytes(&m.cu.name), m.low_pc(), m.high_pc(), m.blob_start(), m.blob_end()),
            TraceLookup::NotFound {entries_scanned} => write!(f, "{} entries scanned, nothing relevant found", entries_scanned),
        }
    }
}

pub fn locate_trace_for_address(mem: &dyn MemoryView, settings: &Settings, target: u64) -> Result<TraceSearch> {
    let mut registry = JitRegistry::open(mem, settings)?;
    Ok(locate_in_registry(&mut registry, mem, settings, target))
}

// First entry whose [low_pc, high_pc) contains `target`. Unreadable or malformed entries are skipped with a warning.
pub fn locate_in_registry(registry: &mut JitRegistry, mem: &dyn MemoryView, settings: &Settings, target: u64) -> TraceSearch {
    let mut log = Log::new();
    let mut found: Option<TraceMatch> = None;
    let mut aborted: Option<Error> = None;
    for entry in registry.by_ref() {
        let (blob, cu) = match read_entry(mem, settings, &entry) {
            Ok(x) => x,
            Err(e) if e.is_recoverable_per_item() => {
                log!(log, "skipping entry {} at 0x{:x}: {}", entry.index, entry.addr, e);
                continue;
            }
            Err(e) => {
                aborted = Some(e);
                break;
            }
        };
        if cu.contains(target) {
            found = Some(TraceMatch {entry, cu, blob});
            break;
        }
    }
    if aborted.is_none() {
        aborted = registry.aborted.take();
    }
    if let Some(e) = &aborted {
        log!(log, "traversal of {} aborted: {}", JIT_DEBUG_DESCRIPTOR_SYMBOL, e);
    }
    let entries_scanned = registry.entries_seen();
    TraceSearch {
        lookup: match found {
            Some(m) => TraceLookup::Found(m),
            None => TraceLookup::NotFound {entries_scanned},
        },
        entries_scanned,
        aborted,
        warnings: log.into_lines(),
    }
}

pub fn read_blob(mem: &dyn MemoryView, settings: &Settings, entry: &TraceDebugEntry) -> Result<Vec<u8>> {
    if entry.symfile_size > settings.max_blob_size {
        return err!(MalformedDebugBlob, "debug object size {} is over the limit ({})", PrettySize(entry.symfile_size), PrettySize(settings.max_blob_size));
    }
    mem.read_bytes(entry.symfile_addr, entry.symfile_size)
}

fn read_entry(mem: &dyn MemoryView, settings: &Settings, entry: &TraceDebugEntry) -> Result<(Vec<u8>, CuHeader)> {
    let blob = read_blob(mem, settings, entry)?;
    let cu = parse_cu_header(&blob, &settings.layout.jit)?;
    Ok((blob, cu))
}

pub struct TraceInfo {
    pub entry: TraceDebugEntry,
    pub cu: Result<CuHeader>,
    pub symbol: Option<TraceSymbol>,
}

pub struct TraceListing {
    pub traces: Vec<TraceInfo>,
    pub aborted: Option<Error>,
    pub warnings: Vec<String>,
}

pub fn list_traces(mem: &dyn MemoryView, settings: &Settings) -> Result<TraceListing> {
    let mut registry = JitRegistry::open(mem, settings)?;
    let mut log = Log::new();
    let mut traces: Vec<TraceInfo> = Vec::new();
    for entry in registry.by_ref() {
        let blob = read_blob(mem, settings, &entry);
        let (cu, symbol) = match blob {
            Ok(b) => {
                let symbol = match find_trace_symbol(&b, &settings.layout.jit) {
                    Ok(s) => s,
                    Err(e) => {
                        log!(log, "entry {}: {}", entry.index, e);
                        None
                    }
                };
                (parse_cu_header(&b, &settings.layout.jit), symbol)
            }
            Err(e) => (Err(e), None),
        };
        if let Err(e) = &cu {
            log!(log, "entry {} at 0x{:x}: {}", entry.index, entry.addr, e);
        }
        traces.push(TraceInfo {entry, cu, symbol});
    }
    let aborted = registry.aborted.take();
    if let Some(e) = &aborted {
        log!(log, "traversal of {} aborted: {}", JIT_DEBUG_DESCRIPTOR_SYMBOL, e);
    }
    Ok(TraceListing {traces, aborted, warnings: log.into_lines()})
}

impl fmt::Display for TraceListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for t in &self.traces {
            write!(f, "{:>5} 0x{:x} blob 0x{:x}+{}", t.entry.index, t.entry.addr, t.entry.symfile_addr, t.entry.symfile_size)?;
            match &t.cu {
                Ok(cu) => write!(f, " [0x{:x}, 0x{:x}) {}", cu.low_pc, cu.high_pc, EscapedBytes(&cu.name))?,
                Err(e) => write!(f, " <{}>", e)?,
            }
            if let Some(s) = &t.symbol {
                write!(f, " {}", s.name)?;
            }
            writeln!(f)?;
        }
        writeln!(f, "{} entries", self.traces.len())
    }
}

pub fn default_symfile_path(settings: &Settings, index: usize) -> PathBuf {
    Path::new(&settings.symfile_dir).join(format!("trace_{}.sym", index))
}

// Writes the object file so that it's either fully there or not there at all.
pub fn export_trace_blob(m: &TraceMatch, path: &Path) -> Result<()> {
    write_file_atomically(path, &m.blob)
}

pub fn add_symbol_file_command(path: &Path, low_pc: u64) -> String {
    format!("add-symbol-file {} 0x{:x}", path.display(), low_pc)
}
