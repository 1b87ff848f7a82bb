use crate::{*, error::*};
use std::{io, io::{Read, BufRead, Write}, fmt, fs, path::{Path, PathBuf}, ffi::OsString};

// Little-endian reads from byte buffers, e.g. io::Cursor over an mmapped ELF file.
pub trait ByteRead : BufRead {
    fn read_u8(&mut self) -> io::Result<u8>;
    fn read_u16(&mut self) -> io::Result<u16>;
    fn read_u32(&mut self) -> io::Result<u32>;
    fn read_u64(&mut self) -> io::Result<u64>;
    fn read_usize(&mut self) -> io::Result<usize>;
    fn read_i32(&mut self) -> io::Result<i32>;
    fn read_i64(&mut self) -> io::Result<i64>;
    fn skip(&mut self, n: usize) -> io::Result<()>;
}
impl<R: BufRead> ByteRead for R {
    fn read_u8(&mut self) -> io::Result<u8> { let mut b = [0u8]; self.read_exact(&mut b)?; Ok(b[0]) }
    fn read_u16(&mut self) -> io::Result<u16> { let mut b = [0u8; 2]; self.read_exact(&mut b)?; Ok(u16::from_le_bytes(b)) }
    fn read_u32(&mut self) -> io::Result<u32> { let mut b = [0u8; 4]; self.read_exact(&mut b)?; Ok(u32::from_le_bytes(b)) }
    fn read_u64(&mut self) -> io::Result<u64> { let mut b = [0u8; 8]; self.read_exact(&mut b)?; Ok(u64::from_le_bytes(b)) }
    fn read_usize(&mut self) -> io::Result<usize> { let mut b = [0u8; 8]; self.read_exact(&mut b)?; Ok(usize::from_le_bytes(b)) }
    fn read_i32(&mut self) -> io::Result<i32> { let mut b = [0u8; 4]; self.read_exact(&mut b)?; Ok(i32::from_le_bytes(b)) }
    fn read_i64(&mut self) -> io::Result<i64> { let mut b = [0u8; 8]; self.read_exact(&mut b)?; Ok(i64::from_le_bytes(b)) }
    fn skip(&mut self, n: usize) -> io::Result<()> {
        let copied = io::copy(&mut self.by_ref().take(n as u64), &mut io::sink())?;
        if copied != n as u64 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }
}

pub trait ByteWrite : Write {
    fn write_u8(&mut self, x: u8) -> io::Result<()>;
    fn write_u16(&mut self, x: u16) -> io::Result<()>;
    fn write_u32(&mut self, x: u32) -> io::Result<()>;
    fn write_u64(&mut self, x: u64) -> io::Result<()>;
    fn write_i32(&mut self, x: i32) -> io::Result<()>;
}
impl<R: Write> ByteWrite for R {
    fn write_u8(&mut self, x: u8) -> io::Result<()> { self.write_all(&[x]) }
    fn write_u16(&mut self, x: u16) -> io::Result<()> { self.write_all(&x.to_le_bytes()) }
    fn write_u32(&mut self, x: u32) -> io::Result<()> { self.write_all(&x.to_le_bytes()) }
    fn write_u64(&mut self, x: u64) -> io::Result<()> { self.write_all(&x.to_le_bytes()) }
    fn write_i32(&mut self, x: i32) -> io::Result<()> { self.write_all(&x.to_le_bytes()) }
}

// Accepts "0x1f", "0X1F" and plain decimal.
pub fn parse_address(s: &str) -> Result<usize> {
    let s = s.trim();
    let r = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16)
    } else {
        usize::from_str_radix(s, 10)
    };
    match r {
        Ok(a) => Ok(a),
        Err(e) => err!(Usage, "invalid address '{}': {}", s, e),
    }
}

// Write to "<path>.tmp", fsync, rename over `path`. Readers of `path` never see a partial file.
pub fn write_file_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp_name: OsString = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    let r = (|| -> Result<()> {
        let mut f = match fs::File::create(&tmp_path) {
            Ok(f) => f,
            Err(e) => return Err(Error::from_io_error(e, format!("failed to create {}", tmp_path.display()))),
        };
        if let Err(e) = f.write_all(contents) { return Err(Error::from_io_error(e, format!("failed to write {}", tmp_path.display()))); }
        if let Err(e) = f.sync_all() { return Err(Error::from_io_error(e, format!("failed to sync {}", tmp_path.display()))); }
        if let Err(e) = fs::rename(&tmp_path, path) { return Err(Error::from_io_error(e, format!("failed to rename {} to {}", tmp_path.display(), path.display()))); }
        Ok(())
    })();
    if r.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    r
}

// Prints byte sizes with a few digits of precision and B/KiB/MiB/GiB suffix, e.g. "42 B", "12.4 KiB".
pub struct PrettySize(pub usize);
impl fmt::Display for PrettySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = self.0;
        if x < 1<<10 {             write!(f, "{} B", x) }
        else if x < (1usize<<20) { write!(f, "{:.3} KiB", x as f64 / (1usize<<10) as f64) }
        else if x < (1usize<<30) { write!(f, "{:.3} MiB", x as f64 / (1usize<<20) as f64) }
        else {                     write!(f, "{:.3} GiB", x as f64 / (1usize<<30) as f64) }
    }
}

// Byte string for showing to the user: printable ASCII as is, everything else as \xNN.
pub struct EscapedBytes<'a>(pub &'a [u8]);
impl fmt::Display for EscapedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0 {
            match b {
                b'\\' => write!(f, "\\\\")?,
                b'"' => write!(f, "\\\"")?,
                b'\n' => write!(f, "\\n")?,
                b'\t' => write!(f, "\\t")?,
                0x20..=0x7e => write!(f, "{}", b as char)?,
                _ => write!(f, "\\x{:02x}", b)?,
            }
        }
        Ok(())
    }
}
