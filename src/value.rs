use crate::{*, error::*, memory::*, settings::*, vm_layout::*, util::*};
use std::{fmt, cell::Cell};

// Value kinds, in the VM's order. In memory they're stored inverted, see ValueTag::raw().
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueTag {
    Nil = 0,
    False = 1,
    True = 2,
    LightUserdata = 3,
    Str = 4,
    Upvalue = 5,
    Thread = 6,
    Proto = 7,
    Func = 8,
    Trace = 9,
    Cdata = 10,
    Table = 11,
    Userdata = 12,
    Number = 13,
}

impl ValueTag {
    pub const ALL: [ValueTag; 14] = [ValueTag::Nil, ValueTag::False, ValueTag::True, ValueTag::LightUserdata, ValueTag::Str, ValueTag::Upvalue, ValueTag::Thread, ValueTag::Proto, ValueTag::Func, ValueTag::Trace, ValueTag::Cdata, ValueTag::Table, ValueTag::Userdata, ValueTag::Number];

    pub fn from_index(i: u32) -> Option<Self> {
        Self::ALL.get(i as usize).copied()
    }

    // From the tag word of a TValue. None if it's not a value tag (below LJ_T_MIN).
    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw < LJ_T_MIN {
            return None;
        }
        Self::from_index(!raw)
    }

    pub fn raw(self) -> u32 {
        !(self as u32)
    }

    // From the gct byte of a GC object header.
    pub fn from_gct(gct: u8) -> Option<Self> {
        Self::from_index((!gct) as u32)
    }

    pub fn gct(self) -> u8 {
        !(self as u8)
    }

    // Payload is a pointer to a GC object.
    pub fn is_gc(self) -> bool {
        match self {
            Self::Str | Self::Upvalue | Self::Thread | Self::Proto | Self::Func | Self::Trace | Self::Cdata | Self::Table | Self::Userdata => true,
            Self::Nil | Self::False | Self::True | Self::LightUserdata | Self::Number => false,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::False => "false",
            Self::True => "true",
            Self::LightUserdata => "lightuserdata",
            Self::Str => "string",
            Self::Upvalue => "upvalue",
            Self::Thread => "thread",
            Self::Proto => "proto",
            Self::Func => "function",
            Self::Trace => "trace",
            Self::Cdata => "cdata",
            Self::Table => "table",
            Self::Userdata => "userdata",
            Self::Number => "number",
        }
    }
}

// One stack slot (TValue) as it is in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawSlot {
    pub payload: u64,
    pub tag: u32,
}

impl RawSlot {
    pub fn new(tag: ValueTag, payload: u64) -> Self {
        RawSlot {payload, tag: tag.raw()}
    }

    pub fn number(x: f64) -> Self {
        Self::new(ValueTag::Number, x.to_bits())
    }

    pub fn read(mem: &dyn MemoryView, layout: &VmLayout, addr: usize) -> Result<Self> {
        let payload = mem.read_u64(field_addr(addr, layout.tvalue.payload)?)?;
        let tag = mem.read_u32(field_addr(addr, layout.tvalue.tag)?)?;
        Ok(RawSlot {payload, tag})
    }

    pub fn kind(&self) -> Option<ValueTag> {
        ValueTag::from_raw(self.tag)
    }

    pub fn is_valid(&self) -> bool {
        self.tag >= LJ_T_MIN
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LuaString {
    pub addr: usize,
    pub len: usize,
    pub bytes: Vec<u8>, // at most max_string_len bytes
    pub truncated: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProtoInfo {
    pub addr: usize,
    pub chunkname: LuaString,
    pub firstline: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FuncInfo {
    // proto is None if no prototype could be found in front of the bytecode.
    Lua {addr: usize, nupvalues: u8, proto: Option<ProtoInfo>},
    C {addr: usize, entry: usize},
    // Builtin, implemented in the interpreter.
    Fast {addr: usize, ffid: u8},
}

impl FuncInfo {
    pub fn addr(&self) -> usize {
        match self { Self::Lua {addr, ..} | Self::C {addr, ..} | Self::Fast {addr, ..} => *addr }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DecodedValue {
    Nil,
    False,
    True,
    LightUserdata(usize),
    Str(LuaString),
    Upvalue(usize),
    Thread(usize),
    Proto(usize),
    Func(FuncInfo),
    Trace {addr: usize, traceno: u16},
    Cdata(usize),
    Table(usize),
    Userdata(usize),
    Number(f64),
    // Tag word below LJ_T_MIN.
    Invalid {tag: u32, payload: u64},
}

impl DecodedValue {
    pub fn tag(&self) -> Option<ValueTag> {
        Some(match self {
            Self::Nil => ValueTag::Nil,
            Self::False => ValueTag::False,
            Self::True => ValueTag::True,
            Self::LightUserdata(_) => ValueTag::LightUserdata,
            Self::Str(_) => ValueTag::Str,
            Self::Upvalue(_) => ValueTag::Upvalue,
            Self::Thread(_) => ValueTag::Thread,
            Self::Proto(_) => ValueTag::Proto,
            Self::Func(_) => ValueTag::Func,
            Self::Trace {..} => ValueTag::Trace,
            Self::Cdata(_) => ValueTag::Cdata,
            Self::Table(_) => ValueTag::Table,
            Self::Userdata(_) => ValueTag::Userdata,
            Self::Number(_) => ValueTag::Number,
            Self::Invalid {..} => return None,
        })
    }
}

// Where to take the value from.
#[derive(Clone, Copy, Debug)]
pub enum ValueSource {
    Address(usize),
    Word(RawSlot),
}

pub fn decode_value(mem: &dyn MemoryView, settings: &Settings, source: ValueSource) -> Result<DecodedValue> {
    let decoder = ValueDecoder::new(mem, settings);
    match source {
        ValueSource::Address(a) => decoder.decode_at(a),
        ValueSource::Word(w) => decoder.decode(w),
    }
}

pub struct ValueDecoder<'a> {
    mem: &'a dyn MemoryView,
    layout: &'a VmLayout,
    max_string_len: usize,
    // sizeof(GCproto) that worked last time; tried first.
    proto_size: Cell<Option<usize>>,
}

impl<'a> ValueDecoder<'a> {
    pub fn new(mem: &'a dyn MemoryView, settings: &'a Settings) -> Self {
        ValueDecoder {mem, layout: &settings.layout, max_string_len: settings.max_string_len, proto_size: Cell::new(None)}
    }

    pub fn mem(&self) -> &'a dyn MemoryView { self.mem }
    pub fn layout(&self) -> &'a VmLayout { self.layout }

    pub fn read_slot(&self, addr: usize) -> Result<RawSlot> {
        RawSlot::read(self.mem, self.layout, addr)
    }

    pub fn decode_at(&self, addr: usize) -> Result<DecodedValue> {
        let slot = self.read_slot(addr)?;
        self.decode(slot)
    }

    pub fn decode(&self, slot: RawSlot) -> Result<DecodedValue> {
        let tag = match slot.kind() {
            None => return Ok(DecodedValue::Invalid {tag: slot.tag, payload: slot.payload}),
            Some(t) => t,
        };
        let p = slot.payload as usize;
        Ok(match tag {
            ValueTag::Nil => DecodedValue::Nil,
            ValueTag::False => DecodedValue::False,
            ValueTag::True => DecodedValue::True,
            ValueTag::LightUserdata => DecodedValue::LightUserdata(p),
            ValueTag::Str => DecodedValue::Str(self.read_string(p)?),
            ValueTag::Upvalue => DecodedValue::Upvalue(p),
            ValueTag::Thread => DecodedValue::Thread(p),
            ValueTag::Proto => DecodedValue::Proto(p),
            ValueTag::Func => DecodedValue::Func(self.read_func(p)?),
            ValueTag::Trace => DecodedValue::Trace {addr: p, traceno: self.mem.read_u16(field_addr(p, self.layout.gc.trace_traceno)?)?},
            ValueTag::Cdata => DecodedValue::Cdata(p),
            ValueTag::Table => DecodedValue::Table(p),
            ValueTag::Userdata => DecodedValue::Userdata(p),
            ValueTag::Number => DecodedValue::Number(f64::from_bits(slot.payload)),
        })
    }

    // Kind of a GC object according to its own header, independent of whatever points to it.
    pub fn object_kind(&self, addr: usize) -> Result<Option<ValueTag>> {
        let gct = self.mem.read_u8(field_addr(addr, self.layout.gc.gct)?)?;
        Ok(ValueTag::from_gct(gct))
    }

    pub fn read_string(&self, addr: usize) -> Result<LuaString> {
        let len = self.mem.read_word(field_addr(addr, self.layout.gc.str_len)?)?;
        let n = len.min(self.max_string_len);
        let bytes = self.mem.read_bytes(field_addr(addr, self.layout.gc.str_data)?, n)?;
        Ok(LuaString {addr, len, bytes, truncated: n < len})
    }

    pub fn read_func(&self, addr: usize) -> Result<FuncInfo> {
        let ffid = self.mem.read_u8(field_addr(addr, self.layout.gc.func_ffid)?)?;
        Ok(match ffid {
            FF_LUA => {
                let nupvalues = self.mem.read_u8(field_addr(addr, self.layout.gc.func_nupvalues)?)?;
                let proto = self.find_proto(addr)?;
                FuncInfo::Lua {addr, nupvalues, proto}
            }
            FF_C => FuncInfo::C {addr, entry: self.mem.read_word(field_addr(addr, self.layout.gc.func_c_entry)?)?},
            _ => FuncInfo::Fast {addr, ffid},
        })
    }

    // The prototype sits right before the bytecode that func->pc points to.
    pub fn find_proto(&self, func: usize) -> Result<Option<ProtoInfo>> {
        let pc = self.mem.read_word(field_addr(func, self.layout.gc.func_pc)?)?;
        let cached = self.proto_size.get();
        for size in cached.into_iter().chain(self.layout.gc.proto_sizes.iter().copied()) {
            let pt = match pc.checked_sub(size) {
                Some(a) => a,
                None => continue,
            };
            match self.object_kind(pt) {
                Ok(Some(ValueTag::Proto)) => (),
                Ok(_) => continue,
                Err(e) if e.is_memory_unreadable() => continue,
                Err(e) => return Err(e),
            }
            if cached != Some(size) {
                self.proto_size.set(Some(size));
            }
            return Ok(Some(self.read_proto(pt)?));
        }
        Ok(None)
    }

    pub fn read_proto(&self, addr: usize) -> Result<ProtoInfo> {
        let name = self.mem.read_word(field_addr(addr, self.layout.gc.proto_chunkname)?)?;
        let chunkname = self.read_string(name)?;
        let firstline = self.mem.read_i32(field_addr(addr, self.layout.gc.proto_firstline)?)?;
        Ok(ProtoInfo {addr, chunkname, firstline})
    }
}

impl fmt::Display for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", EscapedBytes(&self.bytes))?;
        if self.truncated {
            write!(f, "... ({} bytes)", self.len)?;
        }
        Ok(())
    }
}

impl fmt::Display for FuncInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lua {addr, nupvalues, proto: Some(p)} => write!(f, "Lua function 0x{:x}, upvalues {}, {}:{}", addr, nupvalues, p.chunkname, p.firstline),
            Self::Lua {addr, nupvalues, proto: None} => write!(f, "Lua function 0x{:x}, upvalues {}, <prototype not found>", addr, nupvalues),
            Self::C {entry, ..} => write!(f, "C function 0x{:x}", entry),
            Self::Fast {ffid, ..} => write!(f, "fast function {}", ffid),
        }
    }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::False => write!(f, "false"),
            Self::True => write!(f, "true"),
            Self::LightUserdata(p) => write!(f, "light user data 0x{:x}", p),
            Self::Str(s) => write!(f, "string: {}", s),
            Self::Upvalue(p) => write!(f, "upvalue 0x{:x}", p),
            Self::Thread(p) => write!(f, "thread 0x{:x}", p),
            Self::Proto(p) => write!(f, "proto 0x{:x}", p),
            Self::Func(func) => write!(f, "{}", func),
            Self::Trace {traceno, ..} => write!(f, "trace {}", traceno),
            Self::Cdata(p) => write!(f, "cdata 0x{:x}", p),
            Self::Table(p) => write!(f, "table 0x{:x}", p),
            Self::Userdata(p) => write!(f, "userdata 0x{:x}", p),
            Self::Number(x) => write!(f, "number: {}", x),
            Self::Invalid {tag, payload} => write!(f, "not valid type 0x{:x} (payload 0x{:x})", tag, payload),
        }
    }
}
