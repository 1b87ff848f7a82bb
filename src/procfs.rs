use crate::{*, error::*, elf::*};
use bitflags::*;
use libc::{pid_t, c_void};
use std::{fs, io::{BufRead, BufReader}};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemMapInfo {
    pub start: usize,
    pub len: usize,
    pub perms: MemMapPermissions,
    pub offset: usize,
    pub inode: u64,
    pub path: Option<String>,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct MemMapPermissions: u8 {
        const READ = 0b00001;
        const WRITE = 0b00010;
        const EXECUTE = 0b00100;
        const SHARED = 0b01000;
        const PRIVATE = 0b10000;
    }
}

// Information from /proc/[pid]/maps, or the equivalent from a core dump.
#[derive(Default, Clone, Debug)]
pub struct MemMapsInfo {
    pub maps: Vec<MemMapInfo>, // sorted by address
}

impl MemMapsInfo {
    pub fn read_proc_maps(pid: pid_t) -> Result<MemMapsInfo> {
        let reader = BufReader::new(fs::File::open(format!("/proc/{}/maps", pid))?);
        let mut res: Vec<MemMapInfo> = Vec::new();
        for line in reader.lines() {
            res.push(Self::parse_line(&line?)?);
        }
        res.sort_by_key(|m| m.start);
        Ok(MemMapsInfo {maps: res})
    }

    pub fn parse(text: &str) -> Result<MemMapsInfo> {
        let mut res: Vec<MemMapInfo> = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            res.push(Self::parse_line(line)?);
        }
        res.sort_by_key(|m| m.start);
        Ok(MemMapsInfo {maps: res})
    }

    // The last field of the line is path. It can contain spaces (including trailing), so we can't just
    // split_whitespace(), and splitn() doesn't skip repeated spaces. Hence one field at a time.
    fn parse_line(line: &str) -> Result<MemMapInfo> {
        let (range, rest) = next_field(line)?;
        let (start, end) = match range.split_once('-') {
            Some(x) => x,
            None => return err!(Format, "bad range: {}", range),
        };
        let start = usize::from_str_radix(start, 16)?;
        let end = usize::from_str_radix(end, 16)?;
        if end < start {
            return err!(Format, "bad range: {}", range);
        }

        let (perms, rest) = next_field(rest)?;
        let mut permissions = MemMapPermissions::empty();
        for ch in perms.chars() {
            match ch {
                'r' => permissions.insert(MemMapPermissions::READ),
                'w' => permissions.insert(MemMapPermissions::WRITE),
                'x' => permissions.insert(MemMapPermissions::EXECUTE),
                's' => permissions.insert(MemMapPermissions::SHARED),
                'p' => permissions.insert(MemMapPermissions::PRIVATE),
                _ => (),
            }
        }

        let (offset, rest) = next_field(rest)?;
        let offset = usize::from_str_radix(offset, 16)?;
        let (_dev, rest) = next_field(rest)?;

        let mut s = rest.trim_start().splitn(2, ' ');
        let inode = match s.next() {
            Some(i) if !i.is_empty() => i.parse::<u64>()?,
            _ => return err!(Format, "too few fields"),
        };
        let path = match s.next() {
            None => None,
            Some(p) if p.trim_start().is_empty() => None,
            Some(p) => Some(p.trim_start().to_string()),
        };

        Ok(MemMapInfo {start, len: end - start, perms: permissions, offset, inode, path})
    }

    pub fn addr_to_map(&self, addr: usize) -> Option<&MemMapInfo> {
        let idx = self.maps.partition_point(|m| m.start + m.len <= addr);
        match self.maps.get(idx) {
            Some(m) if m.start <= addr => Some(m),
            _ => None,
        }
    }

    // Difference between runtime and link-time addresses of the binary whose mappings satisfy `is_binary`.
    // The mapping at file offset 0 holds the ELF header and corresponds to the first PT_LOAD segment.
    pub fn load_bias(&self, elf: &ElfFile, is_binary: impl Fn(&MemMapInfo) -> bool) -> Result<usize> {
        let first = match elf.first_load_address() {
            Some(a) => a,
            None => return err!(MalformedExecutable, "{} has no loadable segments", elf.name),
        };
        match self.maps.iter().find(|m| m.offset == 0 && is_binary(m)) {
            Some(m) => Ok(m.start.wrapping_sub(first)),
            None => err!(NotFound, "{} is not mapped", elf.name),
        }
    }
}

fn next_field(s: &str) -> Result<(&str, &str)> {
    let mut it = s.trim_start().splitn(2, ' ');
    match (it.next(), it.next()) {
        (Some(f), Some(rest)) => Ok((f, rest)),
        _ => err!(Format, "too few fields"),
    }
}

#[derive(Clone)]
pub struct PidMemReader {
    pid: pid_t,
}
impl PidMemReader {
    pub fn new(pid: pid_t) -> Self { PidMemReader {pid: pid} }

    pub fn pid(&self) -> pid_t { self.pid }

    pub fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let local_iov = libc::iovec {iov_base: buf.as_mut_ptr() as *mut c_void, iov_len: buf.len()};
        let remote_iov = libc::iovec {iov_base: addr as *mut c_void, iov_len: buf.len()};
        let r = unsafe {libc::process_vm_readv(self.pid, &local_iov as *const libc::iovec, 1, &remote_iov as *const libc::iovec, 1, 0)};
        if r < 0 {
            if unsafe {*libc::__errno_location()} == libc::EFAULT {
                return err!(MemoryUnreadable, "bad address 0x{:x}", addr);
            }
            return errno_err!("process_vm_readv failed");
        }
        if r != buf.len() as isize {
            // Partial read: the range crosses into an unmapped page.
            return err!(MemoryUnreadable, "bad address 0x{:x} (only {} of {} bytes readable)", addr, r, buf.len());
        }
        Ok(())
    }
}
