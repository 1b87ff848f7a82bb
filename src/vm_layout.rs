// In-memory layout of the VM's structs, for the x86-64 build.
// Everything the inspector knows about the VM's data structures is here: the offsets are hardcoded
// because a post-mortem core usually comes without usable type information for the VM's internals.
// If the VM is built with a different configuration, adjust VmLayout (e.g. from a test or a custom build of the tool).

pub const TVALUE_SIZE: usize = 16;
// Instructions are 32-bit.
pub const INS_SIZE: usize = 4;

// Value tags are stored inverted (~tag). Anything below this isn't a value tag,
// e.g. it's the lower half of a frame link's ftsz.
pub const LJ_T_MIN: u32 = 0xfffffff2;

// Frame link bits.
pub const FRAME_TYPE: u64 = 3;
pub const FRAME_P: u64 = 4;
pub const FRAME_TYPEP: u64 = FRAME_TYPE | FRAME_P;
pub const FRAME_PCALL: u64 = 6;
// ftsz of the root frame at the bottom of each Lua stack.
pub const BOTTOM_FRAME_FTSZ: u64 = 0;
// Lua stack reserves this many slots above maxstack.
pub const RED_ZONE_SLOTS: usize = 5;

// Function ids.
pub const FF_LUA: u8 = 0;
pub const FF_C: u8 = 1;

pub const JIT_DEBUG_DESCRIPTOR_SYMBOL: &str = "__jit_debug_descriptor";

#[derive(Clone, Debug)]
pub struct TValueLayout {
    pub payload: usize,
    pub tag: usize,
}

#[derive(Clone, Debug)]
pub struct FrameLinkLayout {
    pub func: usize,
    pub ftsz: usize,
}

#[derive(Clone, Debug)]
pub struct GcLayout {
    // GC header, common to all collectable objects. gct is stored as ~type (u8).
    pub gct: usize,

    pub str_len: usize,
    pub str_data: usize,

    pub func_ffid: usize,
    pub func_nupvalues: usize,
    pub func_pc: usize,
    pub func_c_entry: usize,

    // Prototype is allocated right before its bytecode, func->pc points past it.
    // Its size depends on the build (profiler support adds a field), so several sizes are tried, in order.
    pub proto_sizes: Vec<usize>,
    pub proto_chunkname: usize,
    pub proto_firstline: usize,

    pub trace_szmcode: usize,
    pub trace_mcode: usize,
    pub trace_traceno: usize,

    pub tab_array: usize,
    pub tab_metatable: usize,
    pub tab_node: usize,
    pub tab_asize: usize,
    pub tab_hmask: usize,

    pub node_val: usize,
    pub node_key: usize,
    pub node_next: usize,
    pub node_size: usize,
}

#[derive(Clone, Debug)]
pub struct StateLayout {
    // lua_State
    pub glref: usize,
    pub base: usize,
    pub top: usize,
    pub maxstack: usize,
    pub stack: usize,

    // global_State
    pub gc_state: usize,
    pub vmstate: usize,
}

// GDB JIT interface: descriptor, entries, and the in-memory ELF object each entry points to.
#[derive(Clone, Debug)]
pub struct JitLayout {
    pub desc_version: usize,
    pub desc_action_flag: usize,
    pub desc_relevant_entry: usize,
    pub desc_first_entry: usize,

    pub entry_next: usize,
    pub entry_prev: usize,
    pub entry_symfile_addr: usize,
    pub entry_symfile_size: usize,
    pub entry_size: usize,

    pub elf_shoff: usize,
    pub shdr_size: usize,
    pub shdr_offset: usize,
    pub shdr_size_field: usize,

    pub sect_strtab: usize,
    pub sect_symtab: usize,
    pub sect_debug_info: usize,
}

#[derive(Clone, Debug)]
pub struct VmLayout {
    pub tvalue: TValueLayout,
    pub frame: FrameLinkLayout,
    pub gc: GcLayout,
    pub state: StateLayout,
    pub jit: JitLayout,
}

impl Default for VmLayout {
    fn default() -> Self { VmLayout {
        tvalue: TValueLayout {payload: 0, tag: 8},
        frame: FrameLinkLayout {func: 0, ftsz: 8},
        gc: GcLayout {
            gct: 9,

            str_len: 16,
            str_data: 24,

            func_ffid: 10,
            func_nupvalues: 11,
            func_pc: 24,
            func_c_entry: 40,

            proto_sizes: vec![120, 112],
            proto_chunkname: 64,
            proto_firstline: 72,

            trace_szmcode: 88,
            trace_mcode: 96,
            trace_traceno: 116,

            tab_array: 16,
            tab_metatable: 24,
            tab_node: 40,
            tab_asize: 48,
            tab_hmask: 56,

            node_val: 0,
            node_key: 16,
            node_next: 32,
            node_size: 40,
        },
        state: StateLayout {
            glref: 16,
            base: 32,
            top: 40,
            maxstack: 48,
            stack: 56,

            gc_state: 137,
            vmstate: 552,
        },
        jit: JitLayout {
            desc_version: 0,
            desc_action_flag: 4,
            desc_relevant_entry: 8,
            desc_first_entry: 16,

            entry_next: 0,
            entry_prev: 8,
            entry_symfile_addr: 16,
            entry_symfile_size: 24,
            entry_size: 32,

            elf_shoff: 0x28,
            shdr_size: 64,
            shdr_offset: 24,
            shdr_size_field: 32,

            sect_strtab: 4,
            sect_symtab: 5,
            sect_debug_info: 6,
        },
    } }
}
