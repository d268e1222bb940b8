use std::fmt;
use std::io;

/// Errors returned by kiln's fallible setup paths.
#[derive(Debug)]
pub enum Error {
    /// An underlying I/O operation failed.
    Io(io::Error),
    /// Hostname resolution produced no usable address.
    Resolve(String),
    /// Binding the listen socket failed (e.g., address already in use).
    Bind { addr: String, source: io::Error },
    /// Configuration file could not be parsed or validated.
    Config(String),
    /// The target loop is no longer accepting work.
    LoopUnavailable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Resolve(host) => write!(f, "address resolution failed: {host}"),
            Error::Bind { addr, source } => write!(f, "bind {addr}: {source}"),
            Error::Config(msg) => write!(f, "config: {msg}"),
            Error::LoopUnavailable => write!(f, "event loop not accepting work"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
