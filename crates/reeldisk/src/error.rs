//! Error types for reeldisk

use std::fmt;
use std::io;

/// Result type alias for disk tier operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for disk tier operations
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(io::Error),

    /// Malformed entry file
    Format(String),

    /// Strip name longer than the header can record (max 64 KiB)
    NameTooLong(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Format(msg) => write!(f, "Format error: {}", msg),
            Error::NameTooLong(len) => {
                write!(f, "Strip name too long: {} bytes (max 64 KiB)", len)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        Error::Format(format!("{:?}", err))
    }
}
