// src/error.rs
use std::io;

/// Process/worker level failures — setup and infrastructure, not
/// per-connection protocol outcomes (those live in `crate::conn::ConnState`).
#[derive(Debug)]
pub enum FtError {
    /// Underlying I/O error from the OS.
    Io(io::Error),
    /// The connection table has no free slot for a new connection.
    SlotsExhausted,
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for FtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FtError::Io(e) => write!(f, "I/O error: {}", e),
            FtError::SlotsExhausted => write!(f, "connection table is full"),
            FtError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for FtError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FtError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FtError {
    fn from(e: io::Error) -> Self {
        FtError::Io(e)
    }
}

pub type FtResult<T> = Result<T, FtError>;
