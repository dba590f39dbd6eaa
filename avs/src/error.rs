use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// The result type used by every storage operation.
pub type CResult<T> = std::result::Result<T, Error>;

/// Storage errors. `NotFound` and `Eof` are control signals rather than
/// failures; callers match on them instead of bailing out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The requested object or metadata entry does not exist.
    NotFound,
    /// Reached the end of the AVS file while scanning records.
    Eof,
    /// The descriptor behind a read or write handle was closed underneath a
    /// live worker. The handle manager reopens against the stable path when
    /// it sees this.
    FdClosed,
    /// Free disk space is too low to run a compaction safely.
    SystemLimit,
    /// The dispatcher gave up waiting for the worker to reply.
    Timeout,
    /// A record, entry or property file could not be decoded.
    Parse(String),
    /// An invalid argument or state transition.
    Value(String),
    /// An unexpected I/O or encoding failure.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Eof => write!(f, "end of file"),
            Error::FdClosed => write!(f, "file descriptor closed"),
            Error::SystemLimit => write!(f, "insufficient disk space"),
            Error::Timeout => write!(f, "request timed out"),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Value(msg) => write!(f, "invalid value: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        // EBADF surfaces when a handle pair was closed under a live worker.
        if err.raw_os_error() == Some(9) {
            return Error::FdClosed;
        }
        Error::Internal(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_ebadf_maps_to_fd_closed() {
        let err = std::io::Error::from_raw_os_error(9);
        assert_eq!(Error::from(err), Error::FdClosed);

        let err = std::io::Error::from_raw_os_error(28); // ENOSPC
        assert!(matches!(Error::from(err), Error::Internal(_)));
    }

    #[test]
    fn display() {
        assert_eq!(Error::NotFound.to_string(), "not found");
        assert_eq!(
            Error::Value("bad range".to_string()).to_string(),
            "invalid value: bad range"
        );
    }
}
