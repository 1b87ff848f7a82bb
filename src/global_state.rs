use crate::{*, error::*, memory::*, vm_layout::*};
use std::fmt;

// What the VM was doing, from global_State.vmstate: ~state for the interpreter and JIT phases,
// or a trace number while executing compiled code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmState {
    LFunc,
    FFunc,
    CFunc,
    Idle,
    Interp,
    Gc,
    Exit,
    Record,
    Opt,
    Asm,
    Trace(u32),
}

impl VmState {
    const NAMED: [VmState; 10] = [VmState::LFunc, VmState::FFunc, VmState::CFunc, VmState::Idle, VmState::Interp, VmState::Gc, VmState::Exit, VmState::Record, VmState::Opt, VmState::Asm];

    pub fn from_raw(raw: i32) -> Option<Self> {
        if raw >= 0 {
            return Some(Self::Trace(raw as u32));
        }
        Self::NAMED.get((!raw) as usize).copied()
    }

    pub fn raw(self) -> i32 {
        match self {
            Self::Trace(n) => n as i32,
            s => !(Self::NAMED.iter().position(|x| *x == s).unwrap_or(0) as i32),
        }
    }

    // The only states in which the Lua stack is consistent.
    pub fn is_executing_function(self) -> bool {
        match self {
            Self::LFunc | Self::CFunc => true,
            _ => false,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LFunc => "LFUNC",
            Self::FFunc => "FFUNC",
            Self::CFunc => "CFUNC",
            Self::Idle => "IDLE",
            Self::Interp => "INTERP",
            Self::Gc => "GC",
            Self::Exit => "EXIT",
            Self::Record => "RECORD",
            Self::Opt => "OPT",
            Self::Asm => "ASM",
            Self::Trace(n) => return write!(f, "TRACE {}", n),
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcState {
    Pause,
    Propagate,
    Atomic,
    SweepString,
    Sweep,
    Finalize,
    Last,
}

impl GcState {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Pause,
            1 => Self::Propagate,
            2 => Self::Atomic,
            3 => Self::SweepString,
            4 => Self::Sweep,
            5 => Self::Finalize,
            6 => Self::Last,
            _ => return None,
        })
    }
}

impl fmt::Display for GcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", match self {
            Self::Pause => "PAUSE",
            Self::Propagate => "PROPAGATE",
            Self::Atomic => "ATOMIC",
            Self::SweepString => "SWEEPSTRING",
            Self::Sweep => "SWEEP",
            Self::Finalize => "FINALIZE",
            Self::Last => "LAST",
        })
    }
}

#[derive(Clone, Debug)]
pub struct GlobalStateInfo {
    pub addr: usize,
    pub vm_state_raw: i32,
    pub vm_state: Option<VmState>,
    pub gc_state_raw: u8,
    pub gc_state: Option<GcState>,
}

impl fmt::Display for GlobalStateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.vm_state {
            Some(s) => writeln!(f, "VM state: {}", s)?,
            None => writeln!(f, "VM state: unknown ({})", self.vm_state_raw)?,
        }
        match &self.gc_state {
            Some(s) => write!(f, "GC state: {}", s),
            None => write!(f, "GC state: UNKNOWN ({})", self.gc_state_raw),
        }
    }
}

pub fn global_state_addr(mem: &dyn MemoryView, layout: &VmLayout, l: usize) -> Result<usize> {
    mem.read_word(field_addr(l, layout.state.glref)?)
}

pub fn read_vm_state(mem: &dyn MemoryView, layout: &VmLayout, l: usize) -> Result<Option<VmState>> {
    let g = global_state_addr(mem, layout, l)?;
    Ok(VmState::from_raw(mem.read_i32(field_addr(g, layout.state.vmstate)?)?))
}

pub fn read_global_state(mem: &dyn MemoryView, layout: &VmLayout, l: usize) -> Result<GlobalStateInfo> {
    let g = global_state_addr(mem, layout, l)?;
    let vm_state_raw = mem.read_i32(field_addr(g, layout.state.vmstate)?)?;
    let gc_state_raw = mem.read_u8(field_addr(g, layout.state.gc_state)?)?;
    Ok(GlobalStateInfo {addr: g, vm_state_raw, vm_state: VmState::from_raw(vm_state_raw), gc_state_raw, gc_state: GcState::from_raw(gc_state_raw)})
}

#[cfg(test)]
mod tests {
    use crate::{*, global_state::*, testing::*};

    #[test]
    fn vm_states() {
        assert_eq!(VmState::from_raw(!0), Some(VmState::LFunc));
        assert_eq!(VmState::from_raw(!2), Some(VmState::CFunc));
        assert_eq!(VmState::from_raw(!9), Some(VmState::Asm));
        assert_eq!(VmState::from_raw(!10), None);
        assert_eq!(VmState::from_raw(5), Some(VmState::Trace(5)));
        for s in VmState::NAMED {
            assert_eq!(VmState::from_raw(s.raw()), Some(s));
        }
        assert!(VmState::LFunc.is_executing_function());
        assert!(!VmState::Gc.is_executing_function());
        assert_eq!(VmState::Trace(12).to_string(), "TRACE 12");
        assert_eq!(VmState::Record.to_string(), "RECORD");
    }

    #[test]
    fn read_from_memory() {
        let mut vm = FakeVm::new();
        let s = vm.new_lua_state(16, VmState::Gc.raw());
        vm.mem.write_u8(s.g + vm.layout.state.gc_state, 3);
        let info = read_global_state(&vm.mem, &vm.layout, s.l).unwrap();
        assert_eq!(info.addr, s.g);
        assert_eq!(info.vm_state, Some(VmState::Gc));
        assert_eq!(info.gc_state, Some(GcState::SweepString));
        assert_eq!(info.to_string(), "VM state: GC\nGC state: SWEEPSTRING");

        vm.mem.write_u8(s.g + vm.layout.state.gc_state, 42);
        let info = read_global_state(&vm.mem, &vm.layout, s.l).unwrap();
        assert_eq!(info.gc_state, None);
        assert!(info.to_string().ends_with("UNKNOWN (42)"));

        assert!(read_global_state(&vm.mem, &vm.layout, 0x20).unwrap_err().is_memory_unreadable());

        // glref pointing at the very end of the address space.
        vm.mem.write_u64(s.l + vm.layout.state.glref, u64::MAX - 2);
        assert!(read_global_state(&vm.mem, &vm.layout, s.l).unwrap_err().is_memory_unreadable());
        assert!(read_vm_state(&vm.mem, &vm.layout, s.l).unwrap_err().is_memory_unreadable());
        assert!(global_state_addr(&vm.mem, &vm.layout, usize::MAX - 2).unwrap_err().is_memory_unreadable());
    }
}
