use std::{fmt, io};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    MalformedExecutable = 1,
    UnsupportedExecutable = 2,
    Internal = 3,
    Usage = 4,
    Cancelled = 5,
    Format = 6,
    Dwarf = 7,
    NotFound = 11,

    // A requested address range is not present in the inspected image.
    MemoryUnreadable = 30,
    // Stack walk didn't reach the root frame, or a frame size points the wrong way.
    CorruptFrameChain = 31,
    // Frame sizing asked about an instruction outside the call/function-header set.
    UnsupportedOpcode = 32,
    // Trace debug blob doesn't match the layout the VM writes.
    MalformedDebugBlob = 33,
}

#[derive(Debug)]
pub enum ErrorEnum {
    IO(io::Error),
    Code(ErrorCode),
}

#[derive(Clone)]
pub struct Error {
    pub error: ErrorEnum,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: ErrorCode, message: String) -> Error {
        Error {error: ErrorEnum::Code(code), message}
    }

    pub fn from_io_error(e: io::Error, message: String) -> Error {
        Error {error: ErrorEnum::IO(e), message}
    }

    pub fn code(&self) -> Option<ErrorCode> { match self.error { ErrorEnum::Code(c) => Some(c), _ => None, } }

    pub fn is_usage(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::Usage) => true, _ => false, } }
    pub fn is_not_found(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::NotFound) => true, _ => false, } }
    pub fn is_cancelled(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::Cancelled) => true, _ => false, } }
    pub fn is_memory_unreadable(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::MemoryUnreadable) => true, _ => false, } }
    pub fn is_corrupt_frame_chain(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::CorruptFrameChain) => true, _ => false, } }
    pub fn is_unsupported_opcode(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::UnsupportedOpcode) => true, _ => false, } }
    pub fn is_malformed_debug_blob(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::MalformedDebugBlob) => true, _ => false, } }
    pub fn is_io_not_found(&self) -> bool { match &self.error { ErrorEnum::IO(e) if e.kind() == io::ErrorKind::NotFound => true, _ => false, } }
    pub fn is_io_permission_denied(&self) -> bool { match &self.error { ErrorEnum::IO(e) if e.kind() == io::ErrorKind::PermissionDenied => true, _ => false, } }

    // Errors that a scan over many independent items may skip past.
    pub fn is_recoverable_per_item(&self) -> bool {
        self.is_memory_unreadable() || self.is_malformed_debug_blob()
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error {error: ErrorEnum::IO(error), message: String::new()}
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<std::num::ParseFloatError> for Error {
    fn from(error: std::num::ParseFloatError) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<gimli::Error> for Error {
    fn from(error: gimli::Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Dwarf), message: format!("{}", error)}
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(error: std::str::Utf8Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(error: std::string::FromUtf8Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<std::fmt::Error> for Error {
    fn from(error: std::fmt::Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

// For printing to log.
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(code) => write!(f, "{}: {}", code as i64, self.message),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

// For showing to the user.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(_) => write!(f, "{}", self.message),
            ErrorEnum::IO(error) if self.message.is_empty() => write!(f, "{}", error),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

impl Clone for ErrorEnum {
    fn clone(&self) -> Self {
        match self {
            Self::Code(c) => Self::Code(c.clone()),
            Self::IO(e) => Self::IO(match e.raw_os_error() {
                Some(os) => io::Error::from_raw_os_error(os),
                None => e.kind().into(),
            }),
        }
    }
}

#[macro_export]
macro_rules! error {
    ($code:ident, $($arg:tt)*) => (
        $crate::error::Error {error: $crate::error::ErrorEnum::Code($crate::error::ErrorCode::$code), message: format!($($arg)*)}
    );
}

#[macro_export]
macro_rules! err {
    ($code:ident, $($arg:tt)*) => (
        Err($crate::error!($code, $($arg)*))
    );
}

#[macro_export]
macro_rules! errno_err {
    ($($arg:tt)*) => (
        Err($crate::error::Error {error: $crate::error::ErrorEnum::IO(::std::io::Error::last_os_error()), message: format!($($arg)*)})
    );
}
