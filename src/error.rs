//! Error types for DMG operations

use thiserror::Error;

/// Result type alias for DMG operations
pub type Result<T> = std::result::Result<T, DmgError>;

/// Errors that can occur while parsing or reading a DMG image
#[derive(Error, Debug)]
pub enum DmgError {
    /// Neither trailer location carries the koly signature
    #[error("not a UDIF image: no koly trailer found")]
    NotUdif,

    /// A read ended mid-record
    #[error("truncated image: read past the end of the source")]
    Truncated,

    /// I/O error from the underlying byte source
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    /// A structural invariant of the container does not hold
    #[error("invalid structure: {0}")]
    InvalidStructure(String),

    /// Block method code that is unknown, or known but not decodable
    #[error("unsupported compression method: {0:#010x}")]
    UnsupportedMethod(u32),

    /// Compressed block data disagrees with its declaration
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Out-of-range index or invalid caller-supplied value
    #[error("bad argument: {0}")]
    BadArgument(String),
}

impl From<std::io::Error> for DmgError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DmgError::Truncated
        } else {
            DmgError::Io(e)
        }
    }
}

impl From<DmgError> for std::io::Error {
    fn from(e: DmgError) -> Self {
        use std::io::ErrorKind;
        match e {
            DmgError::Io(err) => err,
            DmgError::Truncated => std::io::Error::new(ErrorKind::UnexpectedEof, DmgError::Truncated),
            e @ DmgError::UnsupportedMethod(_) => std::io::Error::new(ErrorKind::Unsupported, e),
            e @ DmgError::BadArgument(_) => std::io::Error::new(ErrorKind::InvalidInput, e),
            e => std::io::Error::new(ErrorKind::InvalidData, e),
        }
    }
}
