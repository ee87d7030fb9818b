//! Error handling for the gateway host

use std::fmt;
use std::io;

/// A Result for internal operations.
pub type Result<T> = ::std::result::Result<T, Error>;

/// All errors which might arise within the application
#[derive(Debug)]
pub enum Error {
    Parse(httparse::Error),
    Io(io::Error),
    RequestIncomplete,
    /// Bad server-side setup: script path missing, not a file, and so on.
    /// Fatal at startup; a 500 if it somehow surfaces per-request.
    Config(String),
    /// The child executable could not be started.
    Spawn(io::Error),
    /// The child outlived its wall-clock budget and was killed.
    Timeout,
    /// The child exited without writing a single byte.
    EmptyOutput,
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Error {
        Error::Parse(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Parse(e) => write!(f, "malformed request: {}", e),
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::RequestIncomplete => write!(f, "request ended mid-head"),
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Spawn(e) => write!(f, "could not start child: {}", e),
            Error::Timeout => write!(f, "child exceeded its time budget"),
            Error::EmptyOutput => write!(f, "child produced no output"),
        }
    }
}
