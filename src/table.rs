use crate::{*, error::*, memory::*, settings::*, vm_layout::*, value::*, log::*};
use std::fmt;

#[derive(Debug)]
pub struct TableNode {
    pub addr: usize,
    pub key: Result<DecodedValue>,
    pub val: Result<DecodedValue>,
    pub next: usize,
}

#[derive(Debug)]
pub struct TableDump {
    pub addr: usize,
    pub metatable: Option<usize>,
    pub asize: u32,
    // hmask + 1
    pub hsize: usize,
    pub array: Vec<Result<DecodedValue>>,
    // All nodes of the hash part, in memory order, including free ones.
    pub hash: Vec<TableNode>,
    pub truncated: Option<Error>,
    pub warnings: Vec<String>,
}

pub fn dump_table(mem: &dyn MemoryView, settings: &Settings, addr: usize) -> Result<TableDump> {
    let layout = &settings.layout;
    let decoder = ValueDecoder::new(mem, settings);
    let mut log = Log::new();
    match decoder.object_kind(addr)? {
        Some(ValueTag::Table) => (),
        Some(t) => log!(log, "object at 0x{:x} is a {}, not a table", addr, t.name()),
        None => log!(log, "object at 0x{:x} has an unknown type, not a table", addr),
    }

    let array_addr = mem.read_word(field_addr(addr, layout.gc.tab_array)?)?;
    let metatable = mem.read_word(field_addr(addr, layout.gc.tab_metatable)?)?;
    let node = mem.read_word(field_addr(addr, layout.gc.tab_node)?)?;
    let asize = mem.read_u32(field_addr(addr, layout.gc.tab_asize)?)?;
    let hmask = mem.read_u32(field_addr(addr, layout.gc.tab_hmask)?)?;
    let hsize = hmask as usize + 1;
    if !hsize.is_power_of_two() {
        log!(log, "hash part size {} is not a power of two", hsize);
    }

    let mut dump = TableDump {addr, metatable: if metatable != 0 {Some(metatable)} else {None}, asize, hsize, array: Vec::new(), hash: Vec::new(), truncated: None, warnings: Vec::new()};
    // Same limit as for stack walks: a garbage size shouldn't make us read gigabytes.
    let mut budget = Budget::new(BudgetKind::Scan, settings.max_frames, settings.time_budget);

    let decode = |a: usize, log: &mut Log| -> Result<DecodedValue> {
        let r = decoder.decode_at(a);
        if let Err(e) = &r {
            log!(log, "slot 0x{:x}: {}", a, e);
        }
        r
    };

    for i in 0..asize as usize {
        if let Err(e) = budget.step() {
            dump.truncated = Some(e);
            break;
        }
        match index_addr(array_addr, i, TVALUE_SIZE) {
            Ok(a) => dump.array.push(decode(a, &mut log)),
            Err(e) => {
                dump.truncated = Some(e);
                break;
            }
        }
    }
    if dump.truncated.is_none() {
        for i in 0..hsize {
            if let Err(e) = budget.step() {
                dump.truncated = Some(e);
                break;
            }
            let n = match index_addr(node, i, layout.gc.node_size) {
                Ok(n) => n,
                Err(e) => {
                    dump.truncated = Some(e);
                    break;
                }
            };
            let next = match field_addr(n, layout.gc.node_next).and_then(|a| mem.read_word(a)) {
                Ok(x) => x,
                Err(e) => {
                    // Nodes are contiguous, so the rest won't be readable either.
                    dump.truncated = Some(e);
                    break;
                }
            };
            let key = field_addr(n, layout.gc.node_key).and_then(|a| decode(a, &mut log));
            let val = field_addr(n, layout.gc.node_val).and_then(|a| decode(a, &mut log));
            dump.hash.push(TableNode {addr: n, key, val, next});
        }
    }

    dump.warnings = log.into_lines();
    Ok(dump)
}

fn write_value(f: &mut fmt::Formatter<'_>, v: &Result<DecodedValue>) -> fmt::Result {
    match v {
        Ok(v) => write!(f, "{}", v),
        Err(e) => write!(f, "<{}>", e),
    }
}

impl fmt::Display for TableDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(mt) = self.metatable {
            writeln!(f, "Metatable detected: 0x{:x}", mt)?;
        }
        writeln!(f, "Array part:")?;
        for (i, v) in self.array.iter().enumerate() {
            write!(f, "[{}] ", i)?;
            write_value(f, v)?;
            writeln!(f)?;
        }
        writeln!(f, "Hash part:")?;
        for n in &self.hash {
            write!(f, "{{ ")?;
            write_value(f, &n.key)?;
            write!(f, " }} => {{ ")?;
            write_value(f, &n.val)?;
            writeln!(f, " }} next = 0x{:x}", n.next)?;
        }
        if let Some(e) = &self.truncated {
            writeln!(f, "(table dump stopped: {})", e)?;
        }
        Ok(())
    }
}
