//! The error taxonomy surfaced to application code via `Socket::on_err`.
//!
//! Mirrors the `ErrorCode`/`SockException` split of the original toolkit:
//! a small closed set of kinds that session code can match on, plus a
//! human-readable message carried alongside for logging.

use std::fmt;
use std::io;

/// One `on_err` per socket lifetime carries exactly one of these.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SockError {
    /// TCP read of zero bytes, or peer close detected some other way.
    #[error("end of file")]
    Eof,
    /// Connect or send-queue age exceeded its configured budget.
    #[error("timeout")]
    Timeout,
    /// `connect` observed `ECONNREFUSED`.
    #[error("connection refused")]
    Refused,
    /// Name resolution failed before a connect attempt could be made.
    #[error("dns resolution failed: {0}")]
    Dns(String),
    /// Session code called `shutdown(err)` explicitly.
    #[error("shutdown: {0}")]
    Shutdown(String),
    /// Any other errno not covered above.
    #[error("{0}")]
    Other(String),
}

impl SockError {
    /// Classifies a raw `io::Error` the way `toSockException` does in the
    /// original: most errno values fall into `Other`, a handful get their
    /// own kind.
    pub fn from_io(err: &io::Error) -> SockError {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => SockError::Refused,
            io::ErrorKind::TimedOut => SockError::Timeout,
            io::ErrorKind::UnexpectedEof => SockError::Eof,
            _ => SockError::Other(err.to_string()),
        }
    }

    /// True for `Eof`/`Other` — the two kinds a TCP peer-reset can surface,
    /// per S3 in the testable-properties scenarios.
    pub fn is_terminal_read_error(&self) -> bool {
        matches!(self, SockError::Eof | SockError::Other(_))
    }
}

/// Errors returned synchronously by poller bookkeeping calls
/// (`add_event`/`del_event`/`modify_event`) that fail before any socket
/// exists to carry a `SockError`.
#[derive(thiserror::Error, Debug)]
pub enum PollerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("poller is shutting down")]
    ShuttingDown,
}

impl fmt::Display for PollErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Coarse classification kept around for callers that want to branch on
/// kind without matching the full `SockError` (e.g. metrics bucketing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollErrorCode {
    Success,
    Eof,
    Timeout,
    Refused,
    Dns,
    Shutdown,
    Other,
}

impl SockError {
    pub fn code(&self) -> PollErrorCode {
        match self {
            SockError::Eof => PollErrorCode::Eof,
            SockError::Timeout => PollErrorCode::Timeout,
            SockError::Refused => PollErrorCode::Refused,
            SockError::Dns(_) => PollErrorCode::Dns,
            SockError::Shutdown(_) => PollErrorCode::Shutdown,
            SockError::Other(_) => PollErrorCode::Other,
        }
    }
}
