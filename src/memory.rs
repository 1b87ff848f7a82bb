use crate::{*, error::*};

// Read-only access to the inspected address space: a stopped process, a core dump, or a fake one in tests.
pub trait MemoryView {
    // Fills the whole `buf` or fails. Unmapped addresses fail with MemoryUnreadable.
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()>;

    // Address of a global variable in the inspected program, NotFound if there's no such symbol.
    fn resolve_global(&self, name: &str) -> Result<usize>;

    fn read_u8(&self, addr: usize) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(addr, &mut b)?;
        Ok(b[0])
    }

    fn read_u16(&self, addr: usize) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_u32(&self, addr: usize) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_i32(&self, addr: usize) -> Result<i32> {
        Ok(self.read_u32(addr)? as i32)
    }

    fn read_u64(&self, addr: usize) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read(addr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    // Pointer-sized.
    fn read_word(&self, addr: usize) -> Result<usize> {
        Ok(self.read_u64(addr)? as usize)
    }

    fn read_bytes(&self, addr: usize, len: usize) -> Result<Vec<u8>> {
        if len > usize::MAX - addr {
            return err!(MemoryUnreadable, "bad memory range: 0x{:x} + 0x{:x}", addr, len);
        }
        let mut v = vec![0u8; len];
        self.read(addr, &mut v)?;
        Ok(v)
    }
}

// Address of a field at `offset` inside an object at `base`. Bases come from the inspected memory and can be garbage,
// so this must not wrap.
pub fn field_addr(base: usize, offset: usize) -> Result<usize> {
    match base.checked_add(offset) {
        Some(a) => Ok(a),
        None => err!(MemoryUnreadable, "bad address: 0x{:x} + 0x{:x}", base, offset),
    }
}

// Address of element `i` of an array of `size`-byte elements at `base`.
pub fn index_addr(base: usize, i: usize, size: usize) -> Result<usize> {
    match i.checked_mul(size) {
        Some(off) => field_addr(base, off),
        None => err!(MemoryUnreadable, "bad address: 0x{:x} + {} * {}", base, i, size),
    }
}
