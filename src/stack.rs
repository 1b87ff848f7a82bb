use crate::{*, error::*, memory::*, settings::*, vm_layout::*, value::*, frame::*, global_state::*, log::*};
use bitflags::*;
use std::fmt;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct SlotMarkers: u8 {
        const BASE = 0b0001;
        const TOP = 0b0010;
        const MAXSTACK = 0b0100;
        // L->stack, where the root frame lives.
        const STACK = 0b1000;
    }
}

// Sanity limit on the stack size, well above what the VM allows.
const MAX_STACK_SLOTS: usize = 1 << 22;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackBounds {
    pub stack: usize,
    pub base: usize,
    pub top: usize,
    pub maxstack: usize,
}

impl StackBounds {
    pub fn read(mem: &dyn MemoryView, layout: &VmLayout, l: usize) -> Result<Self> {
        Ok(StackBounds {
            stack: mem.read_word(field_addr(l, layout.state.stack)?)?,
            base: mem.read_word(field_addr(l, layout.state.base)?)?,
            top: mem.read_word(field_addr(l, layout.state.top)?)?,
            maxstack: mem.read_word(field_addr(l, layout.state.maxstack)?)?,
        })
    }

    pub fn markers(&self, addr: usize) -> SlotMarkers {
        let mut m = SlotMarkers::empty();
        if addr == self.base { m.insert(SlotMarkers::BASE); }
        if addr == self.top { m.insert(SlotMarkers::TOP); }
        if addr == self.maxstack { m.insert(SlotMarkers::MAXSTACK); }
        if addr == self.stack { m.insert(SlotMarkers::STACK); }
        m
    }

    // Slots strictly between top and maxstack.
    pub fn free_slots(&self) -> isize {
        (self.maxstack as isize).wrapping_sub(self.top as isize).wrapping_sub(TVALUE_SIZE as isize) / TVALUE_SIZE as isize
    }

    // First and last slot of the red zone above maxstack.
    pub fn red_zone(&self) -> (usize, usize) {
        (self.maxstack.saturating_add(TVALUE_SIZE), self.red_zone_end())
    }

    fn red_zone_end(&self) -> usize {
        self.maxstack.saturating_add(RED_ZONE_SLOTS * TVALUE_SIZE)
    }

    fn check(&self) -> Result<()> {
        if self.maxstack < self.stack || (self.maxstack - self.stack) / TVALUE_SIZE > MAX_STACK_SLOTS {
            return err!(CorruptFrameChain, "bad stack range 0x{:x}..0x{:x}", self.stack, self.maxstack);
        }
        if self.base <= self.stack || self.base > self.red_zone_end() {
            return err!(CorruptFrameChain, "base 0x{:x} is outside the stack 0x{:x}..0x{:x}", self.base, self.stack, self.maxstack);
        }
        if self.top < self.base || self.top > self.red_zone_end() {
            return err!(CorruptFrameChain, "top 0x{:x} is outside 0x{:x}..0x{:x}", self.top, self.base, self.maxstack);
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum StackRecord {
    Value {addr: usize, markers: SlotMarkers, value: Result<DecodedValue>},
    // Not a value: a frame link left behind by a call that has returned.
    DeadFrame {addr: usize, markers: SlotMarkers, link: FrameLink, func: Result<FuncInfo>},
    Frame {addr: usize, markers: SlotMarkers, link: FrameLink, class: FrameClass, width: usize, func: Result<FuncInfo>},
    Root {addr: usize, markers: SlotMarkers, link: FrameLink},
}

impl StackRecord {
    pub fn addr(&self) -> usize {
        match self {
            Self::Value {addr, ..} | Self::DeadFrame {addr, ..} | Self::Frame {addr, ..} | Self::Root {addr, ..} => *addr,
        }
    }

    pub fn is_value(&self) -> bool { match self { Self::Value {..} => true, _ => false } }
    pub fn is_frame(&self) -> bool { match self { Self::Frame {..} => true, _ => false } }
    pub fn is_root(&self) -> bool { match self { Self::Root {..} => true, _ => false } }
}

#[derive(Debug)]
pub struct StackDump {
    pub bounds: StackBounds,
    pub vm_state: Option<VmState>,
    // Top-down.
    pub records: Vec<StackRecord>,
    pub frames: usize,
    // Why the walk stopped before reaching the root frame.
    pub truncated: Option<Error>,
    pub warnings: Vec<String>,
}

impl StackDump {
    pub fn reached_root(&self) -> bool {
        self.records.last().map_or(false, |r| r.is_root())
    }
}

// Stack of the coroutine `l`, optionally with base and top overridden (e.g. taken from registers while in the interpreter).
pub fn reconstruct_stack(mem: &dyn MemoryView, settings: &Settings, l: usize, base: Option<usize>, top: Option<usize>) -> Result<StackDump> {
    let mut bounds = StackBounds::read(mem, &settings.layout, l)?;
    if let Some(b) = base { bounds.base = b; }
    if let Some(t) = top { bounds.top = t; }

    let mut log = Log::new();
    let vm_state = match read_vm_state(mem, &settings.layout, l) {
        Ok(Some(s)) => {
            if !s.is_executing_function() {
                log!(log, "bad VM state: {}, must be CFUNC or LFUNC", s);
            }
            Some(s)
        }
        Ok(None) => {
            log!(log, "unknown VM state");
            None
        }
        Err(e) => {
            log!(log, "can't read VM state: {}", e);
            None
        }
    };
    Ok(reconstruct(mem, settings, bounds, vm_state, log))
}

// Same, for explicitly given bounds.
pub fn reconstruct_span(mem: &dyn MemoryView, settings: &Settings, bounds: StackBounds) -> StackDump {
    reconstruct(mem, settings, bounds, None, Log::new())
}

fn reconstruct(mem: &dyn MemoryView, settings: &Settings, bounds: StackBounds, vm_state: Option<VmState>, mut log: Log) -> StackDump {
    let mut dump = StackDump {bounds, vm_state, records: Vec::new(), frames: 0, truncated: None, warnings: Vec::new()};
    if let Err(e) = bounds.check() {
        dump.truncated = Some(e);
        dump.warnings = log.into_lines();
        return dump;
    }
    if (bounds.top - bounds.stack) % TVALUE_SIZE != 0 || (bounds.base - bounds.stack) % TVALUE_SIZE != 0 {
        log!(log, "base 0x{:x} or top 0x{:x} is not slot-aligned relative to stack 0x{:x}", bounds.base, bounds.top, bounds.stack);
    }

    let start = match bounds.base.checked_sub(TVALUE_SIZE) {
        Some(a) => a,
        None => {
            dump.truncated = Some(error!(CorruptFrameChain, "base 0x{:x} leaves no room for a frame link", bounds.base));
            dump.warnings = log.into_lines();
            return dump;
        }
    };

    let decoder = ValueDecoder::new(mem, settings);
    let walker = FrameWalker::new(mem, settings);
    let mut budget = settings.frame_budget();
    let chain = walker.walk(start, bounds.stack, &mut budget);

    // top >= base, so this doesn't wrap.
    let mut slot = bounds.top - TVALUE_SIZE;
    for frame in &chain.frames {
        let link = frame.link;
        push_slots(&mut dump.records, &decoder, &walker, &bounds, &mut slot, link.addr, &mut log);
        let func = decoder.read_func(link.func);
        if let Err(e) = &func {
            log!(log, "frame at 0x{:x}: can't decode function 0x{:x}: {}", link.addr, link.func, e);
        }
        dump.records.push(StackRecord::Frame {addr: link.addr, markers: bounds.markers(link.addr), link, class: frame.class, width: frame.width, func});
        dump.frames += 1;
        slot = link.addr.saturating_sub(TVALUE_SIZE);
    }
    // The values of the frame we couldn't get past are still worth showing.
    if let Some(link) = &chain.broken {
        push_slots(&mut dump.records, &decoder, &walker, &bounds, &mut slot, link.addr, &mut log);
    }
    if let Some(link) = chain.root {
        if link.addr != bounds.stack {
            log!(log, "root frame found at 0x{:x}, but the stack starts at 0x{:x}", link.addr, bounds.stack);
        }
        dump.records.push(StackRecord::Root {addr: link.addr, markers: bounds.markers(link.addr), link});
    }
    dump.truncated = chain.truncated;

    dump.warnings = log.into_lines();
    dump
}

// Slots from `*slot` down to, not including, the frame link at `link`.
fn push_slots(records: &mut Vec<StackRecord>, decoder: &ValueDecoder, walker: &FrameWalker, bounds: &StackBounds, slot: &mut usize, link: usize, log: &mut Log) {
    while *slot > link {
        records.push(slot_record(decoder, walker, bounds, *slot, log));
        *slot = match slot.checked_sub(TVALUE_SIZE) {
            Some(s) => s,
            None => break,
        };
    }
}

fn slot_record(decoder: &ValueDecoder, walker: &FrameWalker, bounds: &StackBounds, addr: usize, log: &mut Log) -> StackRecord {
    let markers = bounds.markers(addr);
    let raw = match decoder.read_slot(addr) {
        Ok(r) => r,
        Err(e) => {
            log!(log, "slot 0x{:x}: {}", addr, e);
            return StackRecord::Value {addr, markers, value: Err(e)};
        }
    };
    if raw.is_valid() {
        let value = decoder.decode(raw);
        if let Err(e) = &value {
            log!(log, "slot 0x{:x}: {}", addr, e);
        }
        return StackRecord::Value {addr, markers, value};
    }

    // Not a value. If it points at a function, it's a stale frame link.
    let obj = raw.payload as usize;
    match decoder.object_kind(obj) {
        Ok(Some(ValueTag::Func)) => (),
        Ok(_) => return StackRecord::Value {addr, markers, value: Ok(DecodedValue::Invalid {tag: raw.tag, payload: raw.payload})},
        Err(e) => {
            log!(log, "slot 0x{:x}: invalid tag 0x{:x}, and its object 0x{:x} is unreadable: {}", addr, raw.tag, obj, e);
            return StackRecord::Value {addr, markers, value: Err(e)};
        }
    }
    let link = match walker.read_link(addr) {
        Ok(l) => l,
        Err(e) => return StackRecord::Value {addr, markers, value: Err(e)},
    };
    let func = decoder.read_func(obj);
    if let Err(e) = &func {
        log!(log, "dead frame at 0x{:x}: can't decode function 0x{:x}: {}", addr, obj, e);
    }
    StackRecord::DeadFrame {addr, markers, link, func}
}

struct MarkerColumn(SlotMarkers);
impl fmt::Display for MarkerColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(f, "[{}{}{}{}]",
               if m.contains(SlotMarkers::STACK) {"S"} else {" "},
               if m.contains(SlotMarkers::BASE) {"B"} else {" "},
               if m.contains(SlotMarkers::TOP) {"T"} else {" "},
               if m.contains(SlotMarkers::MAXSTACK) {"M"} else {" "})
    }
}

fn write_func(f: &mut fmt::Formatter<'_>, func: &Result<FuncInfo>) -> fmt::Result {
    match func {
        Ok(x) => write!(f, "{}", x),
        Err(e) => write!(f, "<{}>", e),
    }
}

impl fmt::Display for StackRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value {addr, markers, value} => {
                write!(f, "0x{:x}                {} ", addr, MarkerColumn(*markers))?;
                match value {
                    Ok(v @ DecodedValue::Invalid {..}) => write!(f, "DEADF: {}", v),
                    Ok(v) => write!(f, "VALUE: {}", v),
                    Err(e) => write!(f, "VALUE: <{}>", e),
                }
            }
            Self::DeadFrame {addr, markers, link, func} => {
                write!(f, "0x{:x}                {} DEADF: ftsz=0x{:x}, ", addr, MarkerColumn(*markers), link.ftsz)?;
                write_func(f, func)
            }
            Self::Frame {addr, markers, class, width, func, ..} => {
                write!(f, "0x{:x}                {} FRAME: [{}] delta={}, ", addr, MarkerColumn(*markers), class, width)?;
                write_func(f, func)
            }
            Self::Root {addr, markers, ..} => write!(f, "0x{:x}                {} FRAME: dummy L", addr, MarkerColumn(*markers)),
        }
    }
}

impl fmt::Display for StackDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bounds;
        let (red_lo, red_hi) = b.red_zone();
        writeln!(f, "0x{:x}:0x{:x} [    ] {} slots: Red zone", red_hi, red_lo, RED_ZONE_SLOTS)?;
        writeln!(f, "0x{:x}                {}", b.maxstack, MarkerColumn(b.markers(b.maxstack)))?;
        writeln!(f, "0x{:x}:0x{:x} [    ] {} slots: Free stack slots", b.maxstack.wrapping_sub(TVALUE_SIZE), b.top.wrapping_add(TVALUE_SIZE), b.free_slots())?;
        writeln!(f, "0x{:x}                {}", b.top, MarkerColumn(b.markers(b.top)))?;
        for r in &self.records {
            writeln!(f, "{}", r)?;
        }
        if let Some(e) = &self.truncated {
            writeln!(f, "(stack walk stopped: {})", e)?;
        }
        Ok(())
    }
}
