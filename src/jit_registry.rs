use crate::{*, error::*, memory::*, settings::*, vm_layout::*};
use std::collections::HashSet;

// The GDB JIT interface: the VM keeps a doubly linked list of in-memory object files, one per compiled
// trace, rooted at the global __jit_debug_descriptor. We only ever read it.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JitDescriptor {
    pub addr: usize,
    pub version: u32,
    pub action_flag: u32,
    pub relevant_entry: usize,
    pub first_entry: usize,
}

impl JitDescriptor {
    pub fn read(mem: &dyn MemoryView, layout: &VmLayout, addr: usize) -> Result<Self> {
        let j = &layout.jit;
        Ok(JitDescriptor {
            addr,
            version: mem.read_u32(field_addr(addr, j.desc_version)?)?,
            action_flag: mem.read_u32(field_addr(addr, j.desc_action_flag)?)?,
            relevant_entry: mem.read_word(field_addr(addr, j.desc_relevant_entry)?)?,
            first_entry: mem.read_word(field_addr(addr, j.desc_first_entry)?)?,
        })
    }

    pub fn locate(mem: &dyn MemoryView, layout: &VmLayout) -> Result<Self> {
        let addr = match mem.resolve_global(JIT_DEBUG_DESCRIPTOR_SYMBOL) {
            Ok(a) => a,
            Err(e) if e.is_not_found() => return err!(NotFound, "{} not found", JIT_DEBUG_DESCRIPTOR_SYMBOL),
            Err(e) => return Err(e),
        };
        Self::read(mem, layout, addr)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceDebugEntry {
    // 1-based position in the list.
    pub index: usize,
    pub addr: usize,
    pub next: usize,
    pub symfile_addr: usize,
    pub symfile_size: usize,
}

impl TraceDebugEntry {
    pub fn blob_range(&self) -> (usize, usize) {
        (self.symfile_addr, self.symfile_addr.saturating_add(self.symfile_size))
    }
}

// One pass over the list, lazily. Stops at the null terminator, or at the first error, which is then in `aborted`.
pub struct JitRegistry<'a> {
    mem: &'a dyn MemoryView,
    layout: &'a VmLayout,
    next: usize,
    index: usize,
    budget: Budget,
    visited: HashSet<usize>,
    pub aborted: Option<Error>,
}

impl<'a> JitRegistry<'a> {
    pub fn open(mem: &'a dyn MemoryView, settings: &'a Settings) -> Result<Self> {
        let desc = JitDescriptor::locate(mem, &settings.layout)?;
        Ok(Self::from_head(mem, settings, desc.first_entry))
    }

    pub fn from_head(mem: &'a dyn MemoryView, settings: &'a Settings, first_entry: usize) -> Self {
        JitRegistry {mem, layout: &settings.layout, next: first_entry, index: 0, budget: settings.registry_budget(), visited: HashSet::new(), aborted: None}
    }

    // Number of entries yielded so far.
    pub fn entries_seen(&self) -> usize {
        self.index
    }

    fn read_entry(&self, addr: usize) -> Result<TraceDebugEntry> {
        let j = &self.layout.jit;
        Ok(TraceDebugEntry {
            index: self.index + 1,
            addr,
            next: self.mem.read_word(field_addr(addr, j.entry_next)?)?,
            symfile_addr: self.mem.read_word(field_addr(addr, j.entry_symfile_addr)?)?,
            symfile_size: self.mem.read_word(field_addr(addr, j.entry_symfile_size)?)?,
        })
    }
}

impl<'a> Iterator for JitRegistry<'a> {
    type Item = TraceDebugEntry;

    fn next(&mut self) -> Option<TraceDebugEntry> {
        if self.next == 0 || self.aborted.is_some() {
            return None;
        }
        if let Err(e) = self.budget.step() {
            self.aborted = Some(e);
            return None;
        }
        if !self.visited.insert(self.next) {
            self.aborted = Some(error!(Format, "entry list loops back to 0x{:x} after {} entries", self.next, self.index));
            return None;
        }
        match self.read_entry(self.next) {
            Ok(e) => {
                self.index += 1;
                self.next = e.next;
                Some(e)
            }
            Err(e) => {
                self.aborted = Some(e);
                None
            }
        }
    }
}
