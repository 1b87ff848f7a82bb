use crate::{*, error::*, memory::*, settings::*, vm_layout::*, bytecode::*};
use std::fmt;

// Lua stacks have no frame pointer chain. Each frame starts with a frame link slot: the function
// being called, and either the return pc (Lua frames) or the distance to the previous frame link,
// with frame type bits in the low 3 bits. The bottom of every stack is a root frame link with ftsz == 0.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Lua,
    C,
    // Continuation, e.g. a metamethod called from the interpreter.
    Cont,
    // Frame of a vararg function; the fixed arguments are copied above it.
    Varg,
}

impl FrameKind {
    pub fn from_bits(ftsz: u64) -> Self {
        match ftsz & FRAME_TYPE {
            0 => Self::Lua,
            1 => Self::C,
            2 => Self::Cont,
            _ => Self::Varg,
        }
    }

    pub fn letter(self) -> &'static str {
        match self {
            Self::Lua => "L",
            Self::C => "C",
            Self::Cont => "M",
            Self::Varg => "V",
        }
    }
}

// The frame link slot, as read from memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLink {
    pub addr: usize,
    pub func: usize,
    pub ftsz: u64,
}

impl FrameLink {
    pub fn is_root(&self) -> bool {
        self.ftsz == BOTTOM_FRAME_FTSZ
    }

    pub fn kind(&self) -> FrameKind {
        FrameKind::from_bits(self.ftsz)
    }

    // Lua frame: ftsz is the return pc, and the frame size is in the call instruction before it.
    pub fn is_lua(&self) -> bool {
        self.kind() == FrameKind::Lua && !self.is_root()
    }

    pub fn pc(&self) -> usize {
        self.ftsz as usize
    }

    // Explicit size of a non-Lua frame, in bytes. Low bits are type and flags.
    pub fn sized(&self) -> u64 {
        self.ftsz & !FRAME_TYPEP
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameClass {
    pub kind: FrameKind,
    // Called through a protected call (pcall, or lua_pcall from C).
    pub protected: bool,
    pub pcall: bool,
    // The caller got here through a tail call instruction.
    pub parent_tail: bool,
}

impl fmt::Display for FrameClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pcall {
            write!(f, "PP")
        } else {
            write!(f, "{}{}", self.kind.letter(), if self.protected {"P"} else {""})
        }
    }
}

pub struct FrameWalker<'a> {
    mem: &'a dyn MemoryView,
    layout: &'a VmLayout,
    encoding: RegisterEncoding,
}

impl<'a> FrameWalker<'a> {
    pub fn new(mem: &'a dyn MemoryView, settings: &'a Settings) -> Self {
        FrameWalker {mem, layout: &settings.layout, encoding: settings.register_encoding}
    }

    pub fn read_link(&self, addr: usize) -> Result<FrameLink> {
        let func = self.mem.read_word(field_addr(addr, self.layout.frame.func)?)?;
        let ftsz = self.mem.read_u64(field_addr(addr, self.layout.frame.ftsz)?)?;
        Ok(FrameLink {addr, func, ftsz})
    }

    // The instruction that called into a Lua frame, right before its return pc.
    pub fn calling_ins(&self, link: &FrameLink) -> Result<Ins> {
        let pc = match link.pc().checked_sub(INS_SIZE) {
            Some(p) => p,
            None => return err!(CorruptFrameChain, "frame link at 0x{:x} has bad return pc 0x{:x}", link.addr, link.pc()),
        };
        Ok(Ins(self.mem.read_u32(pc)?))
    }

    // Distance to the previous frame link, in slots.
    pub fn width(&self, link: &FrameLink) -> Result<usize> {
        if link.is_root() {
            return err!(Internal, "root frame at 0x{:x} has no width", link.addr);
        }
        let slots: i64 = if link.is_lua() {
            let ins = self.calling_ins(link)?;
            let a = match ins.a(self.encoding) {
                Ok(a) => a,
                Err(e) => return Err(error!(UnsupportedOpcode, "frame link at 0x{:x}, return pc 0x{:x}: {}", link.addr, link.pc(), e)),
            };
            1 + a as i64
        } else {
            // Signed, so that garbage in the high bits shows up as going the wrong way.
            (link.sized() as i64) >> 4
        };
        if slots <= 0 {
            return err!(CorruptFrameChain, "frame link at 0x{:x} has size {} (ftsz 0x{:x})", link.addr, slots, link.ftsz);
        }
        Ok(slots as usize)
    }

    // Address of the previous (caller's) frame link. None for the root frame.
    pub fn previous(&self, addr: usize) -> Result<Option<usize>> {
        let link = self.read_link(addr)?;
        self.previous_of(&link)
    }

    pub fn previous_of(&self, link: &FrameLink) -> Result<Option<usize>> {
        if link.is_root() {
            return Ok(None);
        }
        let width = self.width(link)?;
        match width.checked_mul(TVALUE_SIZE).and_then(|b| link.addr.checked_sub(b)) {
            Some(p) => Ok(Some(p)),
            None => err!(CorruptFrameChain, "frame link at 0x{:x} points below address 0 ({} slots)", link.addr, width),
        }
    }

    pub fn classify(&self, addr: usize) -> Result<FrameClass> {
        let link = self.read_link(addr)?;
        self.classify_link(&link)
    }

    pub fn classify_link(&self, link: &FrameLink) -> Result<FrameClass> {
        if link.is_lua() {
            // The low bits of a Lua frame's ftsz are pc bits, not flags.
            let ins = self.calling_ins(link)?;
            let op = ins.opcode()?;
            return Ok(FrameClass {kind: FrameKind::Lua, protected: false, pcall: false, parent_tail: op.is_tail_call()});
        }
        Ok(FrameClass {
            kind: link.kind(),
            protected: link.ftsz & FRAME_P != 0,
            pcall: link.ftsz & FRAME_PCALL == FRAME_PCALL,
            parent_tail: false,
        })
    }

    // Follows the chain from `start` down to the root frame. Frame links must strictly descend and stay at or above `lowest`.
    pub fn walk(&self, start: usize, lowest: usize, budget: &mut Budget) -> FrameChain {
        let mut chain = FrameChain {frames: Vec::new(), root: None, broken: None, truncated: None};
        let mut addr = start;
        loop {
            if let Err(e) = budget.step() {
                chain.truncated = Some(e);
                break;
            }
            if addr < lowest {
                chain.truncated = Some(error!(CorruptFrameChain, "frame link at 0x{:x} is below the stack start 0x{:x}", addr, lowest));
                break;
            }
            let link = match self.read_link(addr) {
                Ok(l) => l,
                Err(e) => { chain.truncated = Some(e); break; }
            };
            if link.is_root() {
                chain.root = Some(link);
                break;
            }
            let (prev, class) = match self.previous_of(&link).and_then(|p| Ok((p, self.classify_link(&link)?))) {
                Ok((Some(p), c)) => (p, c),
                Ok((None, _)) => {
                    chain.broken = Some(link);
                    chain.truncated = Some(error!(Internal, "no previous frame for non-root frame at 0x{:x}", link.addr));
                    break;
                }
                Err(e) => {
                    chain.broken = Some(link);
                    chain.truncated = Some(e);
                    break;
                }
            };
            chain.frames.push(ChainFrame {link, class, width: (link.addr - prev) / TVALUE_SIZE});
            addr = prev;
        }
        chain
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainFrame {
    pub link: FrameLink,
    pub class: FrameClass,
    // In slots, down to the caller's frame link.
    pub width: usize,
}

// Non-root frames, top-down, and the root if the walk got there.
#[derive(Debug)]
pub struct FrameChain {
    pub frames: Vec<ChainFrame>,
    pub root: Option<FrameLink>,
    // Frame link that was read but couldn't be followed; `truncated` says why.
    pub broken: Option<FrameLink>,
    pub truncated: Option<Error>,
}

#[cfg(test)]
mod tests {
    use crate::{*, frame::*, testing::*, settings::*, vm_layout::*, bytecode::*};
    use rand::random;

    #[test]
    fn kinds_and_flags() {
        let mut vm = FakeVm::new();
        let s = vm.new_lua_state(64, !0);
        let settings = vm.settings();
        let c = s.stack + 3 * TVALUE_SIZE;
        // C frame, 3 slots, protected.
        vm.mem.write_frame_link(c, 0x1234, (3 * TVALUE_SIZE as u64) | 1 | FRAME_P);
        let pc = s.stack + 5 * TVALUE_SIZE;
        vm.mem.write_frame_link(pc, 0x1234, (2 * TVALUE_SIZE as u64) | FRAME_PCALL);
        let w = FrameWalker::new(&vm.mem, &settings);

        let cl = w.classify(c).unwrap();
        assert_eq!(cl, FrameClass {kind: FrameKind::C, protected: true, pcall: false, parent_tail: false});
        assert_eq!(cl.to_string(), "CP");
        assert_eq!(w.previous(c).unwrap(), Some(s.stack));

        let cl = w.classify(pc).unwrap();
        assert!(cl.pcall);
        assert!(cl.protected);
        assert_eq!(cl.kind, FrameKind::Cont);
        assert_eq!(cl.to_string(), "PP");
        assert_eq!(w.previous(pc).unwrap(), Some(c));

        assert_eq!(w.previous(s.stack).unwrap(), None);
        assert!(w.read_link(s.stack).unwrap().is_root());
    }

    #[test]
    fn lua_frame_width_from_call() {
        let mut vm = FakeVm::new();
        let s = vm.new_lua_state(64, !0);
        let settings = vm.settings();
        for (op, tail) in [(Opcode::Call, false), (Opcode::CallM, false), (Opcode::CallT, true), (Opcode::CallMT, true), (Opcode::IterC, false), (Opcode::IterN, false)] {
            let f = s.stack + 4 * TVALUE_SIZE;
            let ret = vm.call_site(op, 4, RegisterEncoding::Doubled);
            vm.mem.write_frame_link(f, 0x1234, ret as u64);
            let w = FrameWalker::new(&vm.mem, &settings);
            assert_eq!(w.previous(f).unwrap(), Some(s.stack));
            let cl = w.classify(f).unwrap();
            assert_eq!(cl.kind, FrameKind::Lua);
            assert_eq!(cl.parent_tail, tail);
            assert_eq!(cl.to_string(), "L");
        }

        // Same instruction read without x2 decoding points twice as far (A = 6 → 7 slots).
        let f = s.stack + 7 * TVALUE_SIZE;
        let ret = vm.call_site(Opcode::Call, 4, RegisterEncoding::Doubled);
        vm.mem.write_frame_link(f, 0x1234, ret as u64);
        let mut plain = vm.settings();
        plain.register_encoding = RegisterEncoding::Plain;
        let w = FrameWalker::new(&vm.mem, &plain);
        assert_eq!(w.previous(f).unwrap(), Some(s.stack));
    }

    #[test]
    fn unsupported_opcode_fails() {
        let mut vm = FakeVm::new();
        let s = vm.new_lua_state(64, !0);
        let code = vm.alloc(16);
        vm.mem.write_u32(code, 0x12 | (4 << 8)); // not a call
        let f = s.stack + 3 * TVALUE_SIZE;
        vm.mem.write_frame_link(f, 0x1234, (code + 4) as u64);
        let settings = vm.settings();
        let w = FrameWalker::new(&vm.mem, &settings);
        assert!(w.previous(f).unwrap_err().is_unsupported_opcode());

        let mut budget = settings.frame_budget();
        let chain = w.walk(f, s.stack, &mut budget);
        assert!(chain.frames.is_empty());
        assert!(chain.root.is_none());
        assert_eq!(chain.broken.map(|l| l.addr), Some(f));
        assert!(chain.truncated.unwrap().is_unsupported_opcode());
    }

    #[test]
    fn wrong_direction_is_corrupt() {
        let mut vm = FakeVm::new();
        let s = vm.new_lua_state(64, !0);
        let f = s.stack + 3 * TVALUE_SIZE;
        // Negative size in a C frame.
        vm.mem.write_frame_link(f, 0x1234, ((-(2 * TVALUE_SIZE as i64)) as u64 & !FRAME_TYPEP) | 1);
        let settings = vm.settings();
        assert!(FrameWalker::new(&vm.mem, &settings).previous(f).unwrap_err().is_corrupt_frame_chain());

        // Zero size with type bits set.
        vm.mem.write_frame_link(f, 0x1234, 2);
        assert!(FrameWalker::new(&vm.mem, &settings).previous(f).unwrap_err().is_corrupt_frame_chain());

        // Size that goes past the stack start.
        vm.mem.write_frame_link(f, 0x1234, (10 * TVALUE_SIZE as u64) | 1);
        let w = FrameWalker::new(&vm.mem, &settings);
        let mut budget = settings.frame_budget();
        let chain = w.walk(f, s.stack, &mut budget);
        assert_eq!(chain.frames.len(), 1);
        assert_eq!(chain.frames[0].width, 10);
        assert!(chain.broken.is_none());
        assert!(chain.truncated.unwrap().is_corrupt_frame_chain());
    }

    #[test]
    fn walk_random_chains() {
        for _ in 0..50 {
            let mut vm = FakeVm::new();
            let s = vm.new_lua_state(4096, !0);
            let settings = vm.settings();
            let n = (random::<usize>() % 40) + 1;
            let mut addr = s.stack;
            let mut expected: Vec<usize> = Vec::new();
            for _ in 0..n {
                let width = (random::<usize>() % 20) + 1;
                addr += width * TVALUE_SIZE;
                if random::<bool>() {
                    let ret = vm.call_site(Opcode::Call, width, RegisterEncoding::Doubled);
                    vm.mem.write_frame_link(addr, 0x1234, ret as u64);
                } else {
                    let bits = [1u64, 2, 3, 5, 6, 7][random::<usize>() % 6];
                    vm.mem.write_frame_link(addr, 0x1234, (width * TVALUE_SIZE) as u64 | bits);
                }
                expected.push(addr);
            }
            expected.reverse();
            let w = FrameWalker::new(&vm.mem, &settings);
            let mut budget = settings.frame_budget();
            let chain = w.walk(addr, s.stack, &mut budget);
            assert!(chain.truncated.is_none(), "{:?}", chain.truncated);
            assert_eq!(chain.frames.iter().map(|f| f.link.addr).collect::<Vec<_>>(), expected);
            assert!(chain.broken.is_none());
            assert_eq!(chain.root.map(|r| r.addr), Some(s.stack));
        }
    }

    #[test]
    fn budget_stops_walk() {
        let mut vm = FakeVm::new();
        let s = vm.new_lua_state(256, !0);
        let mut addr = s.stack;
        for _ in 0..100 {
            addr += TVALUE_SIZE;
            vm.mem.write_frame_link(addr, 0x1234, TVALUE_SIZE as u64 | 1);
        }
        let mut settings = vm.settings();
        settings.max_frames = 10;
        let w = FrameWalker::new(&vm.mem, &settings);
        let mut budget = settings.frame_budget();
        let chain = w.walk(addr, s.stack, &mut budget);
        assert_eq!(chain.frames.len(), 10);
        assert!(chain.frames.iter().all(|f| f.width == 1 && f.class.kind == FrameKind::C));
        assert!(chain.root.is_none());
        assert!(chain.truncated.unwrap().is_corrupt_frame_chain());
    }
}
