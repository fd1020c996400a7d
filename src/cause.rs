use std::{fmt, io};
use std::sync::Arc;

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T, E = Cause> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Cancelled,
    TimedOut,
    // Generic I/O or system failure.
    Fault,
    OutOfMemory,
    AlreadyInProgress,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::Fault => "fault",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::AlreadyInProgress => "already in progress",
        };

        f.write_str(name)
    }
}

/// Failure value carried by promises and completion callbacks.
///
/// A cause is cheap to clone, since a single failure is handed to every
/// continuation registered on a promise.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct Cause {
    kind: ErrorKind,
    message: Arc<str>,
    #[source]
    source: Option<Arc<Cause>>,
}

impl Cause {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into().into(),
            source: None,
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fault, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TimedOut, message)
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfMemory, message)
    }

    pub fn already_in_progress(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyInProgress, message)
    }

    /// Build a cause from a positive errno value, as reported (negated) by the kernel.
    pub fn from_errno(errno: i32) -> Self {
        let kind = match errno {
            libc::ECANCELED => ErrorKind::Cancelled,
            libc::ETIME | libc::ETIMEDOUT => ErrorKind::TimedOut,
            libc::ENOMEM | libc::ENOBUFS => ErrorKind::OutOfMemory,
            libc::EALREADY | libc::EINPROGRESS => ErrorKind::AlreadyInProgress,
            _ => ErrorKind::Fault,
        };

        Self::new(kind, Errno::from_i32(errno).desc())
    }

    /// Chain `source` underneath this cause.
    pub fn with_source(mut self, source: Cause) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source_cause(&self) -> Option<&Cause> {
        self.source.as_deref()
    }
}

impl From<io::Error> for Cause {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Self::from_errno(errno),
            None => Self::fault(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn errno_kinds() {
        assert_eq!(Cause::from_errno(libc::ECANCELED).kind(), ErrorKind::Cancelled);
        assert_eq!(Cause::from_errno(libc::ETIME).kind(), ErrorKind::TimedOut);
        assert_eq!(Cause::from_errno(libc::ENOMEM).kind(), ErrorKind::OutOfMemory);
        assert_eq!(Cause::from_errno(libc::EALREADY).kind(), ErrorKind::AlreadyInProgress);
        assert_eq!(Cause::from_errno(libc::EBADF).kind(), ErrorKind::Fault);
    }

    #[test]
    fn source_is_chained() {
        let cause = Cause::fault("read failed").with_source(Cause::timed_out("deadline"));

        assert_eq!(cause.source_cause().map(Cause::kind), Some(ErrorKind::TimedOut));
        assert_eq!(cause.source().map(|s| s.to_string()), Some("timed out: deadline".to_string()));
        assert_eq!(cause.to_string(), "fault: read failed");
    }

    #[test]
    fn io_error_conversion() {
        let cause: Cause = io::Error::from_raw_os_error(libc::ETIMEDOUT).into();
        assert_eq!(cause.kind(), ErrorKind::TimedOut);

        let cause: Cause = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert_eq!(cause.kind(), ErrorKind::Fault);
        assert_eq!(cause.message(), "boom");
    }
}
