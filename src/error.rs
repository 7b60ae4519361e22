//! The three ways a conversion can fail. Callers only ever see one failure per
//! invocation: the pipeline stops at the first error and cleans up after itself.
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// An underlying read/write/open/seek primitive failed. A short read at EOF
    /// (truncated dump) lands here too.
    Io(io::Error),

    /// The input doesn't conform to the expected ELF-core/NOTE structure.
    /// Kernel dumps are usually well formed so this mostly means the stream
    /// isn't a core dump at all, or was mangled in transit.
    Format(String),

    /// The free-space query failed, or the reduced core would exceed the
    /// disk-space-derived ceiling.
    Resource(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn format(mesg: impl Into<String>) -> Error {
        Error::Format(mesg.into())
    }

    pub fn resource(mesg: impl Into<String>) -> Error {
        Error::Resource(mesg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "i/o error: {err}"),
            Error::Format(mesg) => write!(f, "malformed core dump: {mesg}"),
            Error::Resource(mesg) => write!(f, "{mesg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}
