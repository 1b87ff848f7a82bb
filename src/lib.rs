#![allow(dead_code)]
#![allow(unused_variables)]
#![allow(unused_imports)]

pub mod error;
pub mod log;
pub mod util;
pub mod settings;
pub mod vm_layout;
pub mod memory;
pub mod value;
pub mod bytecode;
pub mod frame;
pub mod global_state;
pub mod stack;
pub mod table;
pub mod jit_registry;
pub mod debug_blob;
pub mod trace_locator;
pub mod procfs;
pub mod elf;
pub mod core_dump;
pub mod target;

#[cfg(test)]
pub mod testing;
