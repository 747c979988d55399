//! The crate's error type.
//!
//! Every fallible operation in this crate returns `crate::Result<T>`.
//! Variants map onto the POSIX-shaped error kinds a façade layer is
//! expected to translate (`NotFound`, `IsDirectory`, `NotDirectory`,
//! `NotEmpty`, `AlreadyExists`, `Corrupt`, `Io`, `Unsupported`);
//! [`Error::kind`] exposes that mapping directly so a caller doesn't have
//! to match on every variant.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("is a storage, not a stream: {0}")]
    IsDirectory(String),

    #[error("is a stream, not a storage: {0}")]
    NotDirectory(String),

    #[error("storage is not empty: {0}")]
    NotEmpty(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("corrupt container: {0}")]
    Corrupt(#[from] CorruptReason),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

#[derive(thiserror::Error, Debug)]
pub enum CorruptReason {
    #[error("bad magic bytes: found {0:x?}")]
    WrongMagic(Vec<u8>),
    #[error("header field {0}: {1}")]
    BadHeaderField(&'static str, String),
    #[error("directory entry {0}: field {1}: {2}")]
    BadDirent(usize, &'static str, String),
    #[error("sector chain starting at {0} contains a cycle")]
    CyclicChain(u32),
    #[error("SID {0} is out of range for a table of length {1}")]
    SidOutOfRange(u32, usize),
    #[error("tried to read {0} bytes of header/sector data, found {1}")]
    UnexpectedEof(usize, usize),
    #[error("directory stream length {0} is not a multiple of the {1}-byte dirent record")]
    MisalignedDirectoryStream(usize, usize),
}

/// A classification of [`Error`] matching §6.3's POSIX-shaped error kinds,
/// for a façade layer that wants to dispatch on kind without matching every
/// variant (and without peeking at message text).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    NotFound,
    IsDirectory,
    NotDirectory,
    NotEmpty,
    AlreadyExists,
    Corrupt,
    Io,
    Unsupported,
}

impl Error {
    pub fn kind(&self) -> Kind {
        match self {
            Error::NotFound(_) => Kind::NotFound,
            Error::IsDirectory(_) => Kind::IsDirectory,
            Error::NotDirectory(_) => Kind::NotDirectory,
            Error::NotEmpty(_) => Kind::NotEmpty,
            Error::AlreadyExists(_) => Kind::AlreadyExists,
            Error::Corrupt(_) => Kind::Corrupt,
            Error::Io(_) => Kind::Io,
            Error::Unsupported(_) => Kind::Unsupported,
        }
    }
}
