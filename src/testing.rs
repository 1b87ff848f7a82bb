// Fake address spaces for tests: a sparse memory and builders that lay out VM objects in it.

use crate::{*, error::*, memory::*, settings::*, vm_layout::*, value::*, bytecode::*, util::*};
use std::collections::{BTreeMap, HashMap};

pub struct FakeMemory {
    regions: BTreeMap<usize, Vec<u8>>,
    symbols: HashMap<String, usize>,
}

impl FakeMemory {
    pub fn new() -> Self { FakeMemory {regions: BTreeMap::new(), symbols: HashMap::new()} }

    // Zero-filled. Regions must not overlap.
    pub fn map(&mut self, addr: usize, len: usize) {
        if let Some((&start, data)) = self.regions.range(..addr + len).next_back() {
            assert!(start + data.len() <= addr, "overlapping mapping at 0x{:x}", addr);
        }
        self.regions.insert(addr, vec![0u8; len]);
    }

    pub fn unmap(&mut self, addr: usize) {
        self.regions.remove(&addr);
    }

    pub fn write(&mut self, addr: usize, bytes: &[u8]) {
        let (&start, data) = self.regions.range_mut(..=addr).next_back().unwrap_or_else(|| panic!("write to unmapped 0x{:x}", addr));
        let off = addr - start;
        assert!(off + bytes.len() <= data.len(), "write past the end of mapping: 0x{:x}+{}", addr, bytes.len());
        data[off..off + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write_u8(&mut self, addr: usize, x: u8) { self.write(addr, &[x]); }
    pub fn write_u16(&mut self, addr: usize, x: u16) { self.write(addr, &x.to_le_bytes()); }
    pub fn write_u32(&mut self, addr: usize, x: u32) { self.write(addr, &x.to_le_bytes()); }
    pub fn write_i32(&mut self, addr: usize, x: i32) { self.write(addr, &x.to_le_bytes()); }
    pub fn write_u64(&mut self, addr: usize, x: u64) { self.write(addr, &x.to_le_bytes()); }

    // TValue with the default layout.
    pub fn write_slot(&mut self, addr: usize, payload: u64, tag: u32) {
        self.write_u64(addr, payload);
        self.write_u32(addr + 8, tag);
        self.write_u32(addr + 12, 0);
    }

    pub fn write_value(&mut self, addr: usize, slot: RawSlot) {
        self.write_slot(addr, slot.payload, slot.tag);
    }

    pub fn write_frame_link(&mut self, addr: usize, func: usize, ftsz: u64) {
        self.write_u64(addr, func as u64);
        self.write_u64(addr + 8, ftsz);
    }

    pub fn define_symbol(&mut self, name: &str, addr: usize) {
        self.symbols.insert(name.to_string(), addr);
    }
}

impl MemoryView for FakeMemory {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        if let Some((&start, data)) = self.regions.range(..=addr).next_back() {
            let off = addr - start;
            if off <= data.len() && buf.len() <= data.len() - off {
                buf.copy_from_slice(&data[off..off + buf.len()]);
                return Ok(());
            }
        }
        err!(MemoryUnreadable, "bad address 0x{:x}", addr)
    }

    fn resolve_global(&self, name: &str) -> Result<usize> {
        match self.symbols.get(name) {
            Some(a) => Ok(*a),
            None => err!(NotFound, "symbol {} not found", name),
        }
    }
}

pub const HEAP_START: usize = 0x10_0000;
pub const HEAP_SIZE: usize = 0x40_0000;

// A VM heap in a FakeMemory, with a bump allocator. Objects are laid out according to `layout`.
pub struct FakeVm {
    pub mem: FakeMemory,
    pub layout: VmLayout,
    pub proto_size: usize,
    heap: usize,
}

impl FakeVm {
    pub fn new() -> Self {
        let mut mem = FakeMemory::new();
        mem.map(HEAP_START, HEAP_SIZE);
        let layout = VmLayout::default();
        let proto_size = layout.gc.proto_sizes[0];
        FakeVm {mem, layout, proto_size, heap: HEAP_START + 0x100}
    }

    pub fn settings(&self) -> Settings {
        Settings {layout: self.layout.clone(), ..Default::default()}
    }

    // Zeroed, 16-byte aligned.
    pub fn alloc(&mut self, size: usize) -> usize {
        let a = self.heap;
        self.heap = (self.heap + size + 15) & !15;
        assert!(self.heap <= HEAP_START + HEAP_SIZE, "fake heap exhausted");
        a
    }

    pub fn new_object(&mut self, tag: ValueTag, size: usize) -> usize {
        let a = self.alloc(size.max(16));
        self.mem.write_u8(a + self.layout.gc.gct, tag.gct());
        a
    }

    pub fn new_string(&mut self, s: &[u8]) -> usize {
        let a = self.new_object(ValueTag::Str, self.layout.gc.str_data + s.len() + 1);
        self.mem.write_u64(a + self.layout.gc.str_len, s.len() as u64);
        self.mem.write(a + self.layout.gc.str_data, s);
        a
    }

    // Prototype followed by its bytecode (one FUNCF instruction), and a closure pointing at it.
    pub fn new_lua_function(&mut self, chunkname: &[u8], firstline: i32, nupvalues: u8) -> usize {
        let name = self.new_string(chunkname);
        let pt = self.new_object(ValueTag::Proto, self.proto_size + 16);
        self.mem.write_u64(pt + self.layout.gc.proto_chunkname, name as u64);
        self.mem.write_i32(pt + self.layout.gc.proto_firstline, firstline);
        let pc = pt + self.proto_size;
        self.mem.write_u32(pc, Ins::new(Opcode::FuncF, 4, 0).0);

        let f = self.new_object(ValueTag::Func, 48);
        self.mem.write_u8(f + self.layout.gc.func_ffid, FF_LUA);
        self.mem.write_u8(f + self.layout.gc.func_nupvalues, nupvalues);
        self.mem.write_u64(f + self.layout.gc.func_pc, pc as u64);
        f
    }

    pub fn new_c_function(&mut self, entry: usize) -> usize {
        let f = self.new_object(ValueTag::Func, 48);
        self.mem.write_u8(f + self.layout.gc.func_ffid, FF_C);
        self.mem.write_u64(f + self.layout.gc.func_c_entry, entry as u64);
        f
    }

    pub fn new_fast_function(&mut self, ffid: u8) -> usize {
        let f = self.new_object(ValueTag::Func, 48);
        self.mem.write_u8(f + self.layout.gc.func_ffid, ffid);
        f
    }

    pub fn new_trace(&mut self, traceno: u16) -> usize {
        let t = self.new_object(ValueTag::Trace, 128);
        self.mem.write_u16(t + self.layout.gc.trace_traceno, traceno);
        t
    }

    pub fn new_table(&mut self, array: &[RawSlot], hash: &[(RawSlot, RawSlot)], metatable: usize) -> usize {
        let t = self.new_object(ValueTag::Table, 64);
        let arr = self.alloc(array.len() * TVALUE_SIZE);
        for (i, v) in array.iter().enumerate() {
            self.mem.write_value(arr + i * TVALUE_SIZE, *v);
        }
        let hsize = hash.len().max(1).next_power_of_two();
        let nodes = self.alloc(hsize * self.layout.gc.node_size);
        for i in 0..hsize {
            let n = nodes + i * self.layout.gc.node_size;
            let (k, v) = hash.get(i).copied().unwrap_or((RawSlot::new(ValueTag::Nil, 0), RawSlot::new(ValueTag::Nil, 0)));
            self.mem.write_value(n + self.layout.gc.node_key, k);
            self.mem.write_value(n + self.layout.gc.node_val, v);
        }
        self.mem.write_u64(t + self.layout.gc.tab_array, arr as u64);
        self.mem.write_u64(t + self.layout.gc.tab_metatable, metatable as u64);
        self.mem.write_u64(t + self.layout.gc.tab_node, nodes as u64);
        self.mem.write_u32(t + self.layout.gc.tab_asize, array.len() as u32);
        self.mem.write_u32(t + self.layout.gc.tab_hmask, (hsize - 1) as u32);
        t
    }

    // A call instruction whose operand A says the callee's frame link is `width` slots above the caller's.
    // Returns the return pc to put into the callee's frame link.
    pub fn call_site(&mut self, op: Opcode, width: usize, encoding: RegisterEncoding) -> usize {
        assert!(width >= 1);
        let a = (width - 1) as u32;
        let a = match encoding { RegisterEncoding::Doubled => a << 1, RegisterEncoding::Plain => a };
        let code = self.alloc(16);
        self.mem.write_u32(code, Ins::new(op, a, 1).0);
        code + INS_SIZE
    }

    // lua_State + global_State + an empty stack of `slots` slots with the root frame at the bottom.
    pub fn new_lua_state(&mut self, slots: usize, vmstate: i32) -> FakeLuaState {
        let g = self.alloc(1024);
        self.mem.write_i32(g + self.layout.state.vmstate, vmstate);
        let l = self.new_object(ValueTag::Thread, 128);
        let stack = self.alloc((slots + RED_ZONE_SLOTS + 1) * TVALUE_SIZE);
        let maxstack = stack + (slots - 1) * TVALUE_SIZE;
        self.mem.write_u64(l + self.layout.state.glref, g as u64);
        self.mem.write_u64(l + self.layout.state.stack, stack as u64);
        self.mem.write_u64(l + self.layout.state.maxstack, maxstack as u64);
        self.mem.write_frame_link(stack, l, BOTTOM_FRAME_FTSZ);
        let s = FakeLuaState {l, g, stack, maxstack};
        self.set_base_top(&s, stack + TVALUE_SIZE, stack + TVALUE_SIZE);
        s
    }

    pub fn set_base_top(&mut self, s: &FakeLuaState, base: usize, top: usize) {
        self.mem.write_u64(s.l + self.layout.state.base, base as u64);
        self.mem.write_u64(s.l + self.layout.state.top, top as u64);
    }

    // ELF object in the format the VM registers with the GDB JIT interface.
    pub fn trace_blob(name: &str, low_pc: u64, high_pc: u64, traceno: u32) -> Vec<u8> {
        build_trace_blob(name, low_pc, high_pc, traceno)
    }

    // Copies blobs into the heap and links them into a registry, in order. Returns entry addresses.
    pub fn new_jit_registry(&mut self, blobs: &[Vec<u8>]) -> Vec<usize> {
        let desc = self.alloc(32);
        self.mem.write_u32(desc + self.layout.jit.desc_version, 1);
        self.mem.define_symbol(JIT_DEBUG_DESCRIPTOR_SYMBOL, desc);
        let mut entries: Vec<usize> = Vec::new();
        for b in blobs {
            let e = self.alloc(self.layout.jit.entry_size);
            let data = self.alloc(b.len());
            self.mem.write(data, b);
            self.mem.write_u64(e + self.layout.jit.entry_symfile_addr, data as u64);
            self.mem.write_u64(e + self.layout.jit.entry_symfile_size, b.len() as u64);
            if let Some(&prev) = entries.last() {
                self.mem.write_u64(prev + self.layout.jit.entry_next, e as u64);
                self.mem.write_u64(e + self.layout.jit.entry_prev, prev as u64);
            }
            entries.push(e);
        }
        let first = entries.first().copied().unwrap_or(0);
        self.mem.write_u64(desc + self.layout.jit.desc_first_entry, first as u64);
        if let Some(&last) = entries.last() {
            self.mem.write_u64(desc + self.layout.jit.desc_relevant_entry, last as u64);
        }
        entries
    }

    pub fn jit_descriptor(&self) -> usize {
        self.mem.resolve_global(JIT_DEBUG_DESCRIPTOR_SYMBOL).unwrap()
    }
}

pub struct FakeLuaState {
    pub l: usize,
    pub g: usize,
    pub stack: usize,
    pub maxstack: usize,
}

const SECTION_COUNT: usize = 9;

// Ehdr, 9 section headers, 3 symbols, then .strtab and .debug_info contents.
pub fn build_trace_blob(name: &str, low_pc: u64, high_pc: u64, traceno: u32) -> Vec<u8> {
    let shoff = 64usize;
    let symoff = shoff + SECTION_COUNT * 64;
    let strtab_off = symoff + 3 * 24;

    let mut strtab: Vec<u8> = vec![0];
    let file_name = strtab.len() as u32;
    strtab.extend_from_slice(b"JIT mcode\0");
    let func_name = strtab.len() as u32;
    strtab.extend_from_slice(format!("TRACE_{}\0", traceno).as_bytes());

    let info_off = strtab_off + strtab.len();
    let mut info: Vec<u8> = Vec::new();
    info.write_u32(0).unwrap(); // patched below
    info.write_u16(2).unwrap();
    info.write_u32(0).unwrap();
    info.write_u8(8).unwrap();
    info.write_u8(1).unwrap();
    info.extend_from_slice(name.as_bytes());
    info.write_u8(0).unwrap();
    info.write_u64(low_pc).unwrap();
    info.write_u64(high_pc).unwrap();
    info.write_u32(0).unwrap();
    let unit_len = (info.len() - 4) as u32;
    info[..4].copy_from_slice(&unit_len.to_le_bytes());

    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.write_u16(1).unwrap(); // e_type
    out.write_u16(62).unwrap(); // e_machine
    out.write_u32(1).unwrap();
    out.write_u64(0).unwrap(); // e_entry
    out.write_u64(0).unwrap(); // e_phoff
    out.write_u64(shoff as u64).unwrap();
    out.write_u32(0).unwrap(); // e_flags
    out.write_u16(64).unwrap();
    out.write_u16(0).unwrap();
    out.write_u16(0).unwrap();
    out.write_u16(64).unwrap();
    out.write_u16(SECTION_COUNT as u16).unwrap();
    out.write_u16(3).unwrap();
    assert_eq!(out.len(), 64);

    for i in 0..SECTION_COUNT {
        let (sh_type, offset, size, link, entsize) = match i {
            4 => (3u32, strtab_off, strtab.len(), 0u32, 0u64),
            5 => (2u32, symoff, 3 * 24, 4u32, 24u64),
            6 => (1u32, info_off, info.len(), 0u32, 0u64),
            _ => (0u32, 0, 0, 0u32, 0u64),
        };
        out.write_u32(0).unwrap(); // sh_name
        out.write_u32(sh_type).unwrap();
        out.write_u64(0).unwrap(); // sh_flags
        out.write_u64(0).unwrap(); // sh_addr
        out.write_u64(offset as u64).unwrap();
        out.write_u64(size as u64).unwrap();
        out.write_u32(link).unwrap();
        out.write_u32(0).unwrap();
        out.write_u64(1).unwrap();
        out.write_u64(entsize).unwrap();
    }

    // Symbols: undef, file, func.
    let syms: [(u32, u8, u16, u64, u64); 3] = [(0, 0, 0, 0, 0), (file_name, 4, 0xfff1, 0, 0), (func_name, 2 | (1 << 4), 1, 0, high_pc - low_pc)];
    for (st_name, st_info, st_shndx, value, size) in syms {
        out.write_u32(st_name).unwrap();
        out.write_u8(st_info).unwrap();
        out.write_u8(0).unwrap();
        out.write_u16(st_shndx).unwrap();
        out.write_u64(value).unwrap();
        out.write_u64(size).unwrap();
    }
    out.extend_from_slice(&strtab);
    out.extend_from_slice(&info);
    out
}

pub fn build_notes(notes: &[(&str, u32, Vec<u8>)]) -> Vec<u8> {
    let mut data: Vec<u8> = Vec::new();
    for (name, type_, desc) in notes {
        data.write_u32(name.len() as u32 + 1).unwrap();
        data.write_u32(desc.len() as u32).unwrap();
        data.write_u32(*type_).unwrap();
        data.extend_from_slice(name.as_bytes());
        data.push(0);
        while data.len() % 4 != 0 { data.push(0); }
        data.extend_from_slice(desc);
        while data.len() % 4 != 0 { data.push(0); }
    }
    data
}

// Minimal x86-64 ELF: program headers, segment contents (PT_LOAD ones page-aligned in the file),
// and optionally .symtab/.strtab/.shstrtab with global symbols of type STT_OBJECT.
pub struct ElfBuilder {
    pub e_type: u16,
    // (p_type, p_vaddr, contents, p_memsz)
    pub segments: Vec<(u32, usize, Vec<u8>, usize)>,
    pub symbols: Vec<(String, usize)>,
}

impl ElfBuilder {
    pub fn build(&self) -> Vec<u8> {
        let phoff = 64usize;
        let mut out = vec![0u8; phoff + self.segments.len() * 56];
        let mut phdrs: Vec<u8> = Vec::new();
        for (p_type, vaddr, contents, memsz) in &self.segments {
            let align = if *p_type == 1 { 0x1000 } else { 8 };
            while out.len() % align != 0 { out.push(0); }
            phdrs.write_u32(*p_type).unwrap();
            phdrs.write_u32(4).unwrap(); // PF_R
            phdrs.write_u64(out.len() as u64).unwrap();
            phdrs.write_u64(*vaddr as u64).unwrap();
            phdrs.write_u64(*vaddr as u64).unwrap();
            phdrs.write_u64(contents.len() as u64).unwrap();
            phdrs.write_u64(*memsz as u64).unwrap();
            phdrs.write_u64(align as u64).unwrap();
            out.extend_from_slice(contents);
        }
        out[phoff..phoff + phdrs.len()].copy_from_slice(&phdrs);

        let mut shoff = 0usize;
        let mut shnum = 0u16;
        if !self.symbols.is_empty() {
            let mut strtab: Vec<u8> = vec![0];
            let mut symtab: Vec<u8> = vec![0u8; 24];
            for (name, value) in &self.symbols {
                symtab.write_u32(strtab.len() as u32).unwrap();
                symtab.write_u8(1 | (1 << 4)).unwrap(); // STT_OBJECT, STB_GLOBAL
                symtab.write_u8(0).unwrap();
                symtab.write_u16(1).unwrap();
                symtab.write_u64(*value as u64).unwrap();
                symtab.write_u64(8).unwrap();
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);
            }
            let shstrtab = b"\0.symtab\0.strtab\0.shstrtab\0".to_vec();
            while out.len() % 8 != 0 { out.push(0); }
            let symtab_off = out.len();
            out.extend_from_slice(&symtab);
            let strtab_off = out.len();
            out.extend_from_slice(&strtab);
            let shstrtab_off = out.len();
            out.extend_from_slice(&shstrtab);
            while out.len() % 8 != 0 { out.push(0); }
            shoff = out.len();
            // (sh_name, sh_type, offset, size, link, entsize)
            let headers: [(u32, u32, usize, usize, u32, u64); 4] = [
                (0, 0, 0, 0, 0, 0),
                (1, 2, symtab_off, symtab.len(), 2, 24),
                (9, 3, strtab_off, strtab.len(), 0, 0),
                (17, 3, shstrtab_off, shstrtab.len(), 0, 0),
            ];
            for (name, sh_type, offset, size, link, entsize) in headers {
                out.write_u32(name).unwrap();
                out.write_u32(sh_type).unwrap();
                out.write_u64(0).unwrap();
                out.write_u64(0).unwrap();
                out.write_u64(offset as u64).unwrap();
                out.write_u64(size as u64).unwrap();
                out.write_u32(link).unwrap();
                out.write_u32(0).unwrap();
                out.write_u64(8).unwrap();
                out.write_u64(entsize).unwrap();
            }
            shnum = 4;
        }

        let mut h: Vec<u8> = Vec::new();
        h.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        h.write_u16(self.e_type).unwrap();
        h.write_u16(62).unwrap();
        h.write_u32(1).unwrap();
        h.write_u64(0).unwrap(); // e_entry
        h.write_u64(if self.segments.is_empty() { 0 } else { phoff as u64 }).unwrap();
        h.write_u64(shoff as u64).unwrap();
        h.write_u32(0).unwrap();
        h.write_u16(64).unwrap();
        h.write_u16(56).unwrap();
        h.write_u16(self.segments.len() as u16).unwrap();
        h.write_u16(64).unwrap();
        h.write_u16(shnum).unwrap();
        h.write_u16(if shnum == 0 { 0 } else { 3 }).unwrap();
        out[..64].copy_from_slice(&h);
        out
    }
}
