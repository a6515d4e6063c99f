use core::result;
use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// A helper type for wrapping a [result::Result] such that we can reduce noise in our signatures.
pub type Result<T> = result::Result<T, Error>;

/// The portable error taxonomy surfaced by every operation in this crate. Native `errno` values
/// are translated into one of these at the point they are received from the OS, and never leak
/// past a driver boundary in raw form.
///
/// The type is [Copy] so that it can be stored in an [crate::Aio] and handed out any number of
/// times after completion.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    #[error("address is invalid or of an unsupported family")]
    AddressInvalid,
    #[error("out of memory")]
    NoMemory,
    #[error("object is closed")]
    Closed,
    #[error("message is larger than the supplied buffers")]
    MessageTooBig,
    #[error("operation was canceled")]
    Canceled,
    #[error("operation timed out")]
    TimedOut,
    #[error("operation was stopped")]
    Stopped,
    #[error("address is already in use")]
    AddressInUse,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("destination is unreachable")]
    Unreachable,
    #[error("permission denied")]
    PermissionDenied,
    #[error("resource temporarily unavailable")]
    TryAgain,
    #[error("operation not supported")]
    NotSupported,
    #[error("unclassified system error ({0})")]
    System(i32),
}

impl From<Errno> for Error {
    fn from(value: Errno) -> Self {
        use Errno::*;
        match value {
            ENOMEM | ENOBUFS => Error::NoMemory,
            EADDRNOTAVAIL | EAFNOSUPPORT | EINVAL | EDESTADDRREQ => Error::AddressInvalid,
            EBADF | ENOTSOCK | ESHUTDOWN | EPIPE => Error::Closed,
            EMSGSIZE => Error::MessageTooBig,
            ECANCELED => Error::Canceled,
            ETIMEDOUT | ETIME => Error::TimedOut,
            EADDRINUSE => Error::AddressInUse,
            ECONNREFUSED | ECONNRESET => Error::ConnectionRefused,
            EHOSTUNREACH | ENETUNREACH | ENETDOWN => Error::Unreachable,
            EACCES | EPERM => Error::PermissionDenied,
            EAGAIN => Error::TryAgain,
            ENOSYS | EOPNOTSUPP | EPROTONOSUPPORT => Error::NotSupported,
            other => Error::System(other as i32),
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        match value.raw_os_error() {
            Some(code) => Errno::from_raw(code).into(),
            None => match value.kind() {
                io::ErrorKind::OutOfMemory => Error::NoMemory,
                io::ErrorKind::InvalidInput => Error::AddressInvalid,
                io::ErrorKind::WouldBlock => Error::TryAgain,
                io::ErrorKind::TimedOut => Error::TimedOut,
                io::ErrorKind::Unsupported => Error::NotSupported,
                io::ErrorKind::PermissionDenied => Error::PermissionDenied,
                _ => Error::System(0),
            },
        }
    }
}

/// Translate a raw completion queue result into a byte count or a portable [Error].
pub(crate) fn from_cqe_result(ret: i32) -> Result<usize> {
    if ret < 0 {
        Err(Errno::from_raw(-ret).into())
    } else {
        Ok(ret as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_translation() {
        assert_eq!(Error::from(Errno::ENOMEM), Error::NoMemory);
        assert_eq!(Error::from(Errno::EAFNOSUPPORT), Error::AddressInvalid);
        assert_eq!(Error::from(Errno::ECANCELED), Error::Canceled);
        assert_eq!(Error::from(Errno::EAGAIN), Error::TryAgain);
        assert_eq!(Error::from(Errno::EMSGSIZE), Error::MessageTooBig);
        assert_eq!(
            Error::from(Errno::EROFS),
            Error::System(Errno::EROFS as i32)
        );
    }

    #[test]
    fn test_io_error_translation() {
        let err = io::Error::from_raw_os_error(Errno::EADDRINUSE as i32);
        assert_eq!(Error::from(err), Error::AddressInUse);

        let err = io::Error::new(io::ErrorKind::InvalidInput, "bad address");
        assert_eq!(Error::from(err), Error::AddressInvalid);
    }

    #[test]
    fn test_cqe_result() {
        assert_eq!(from_cqe_result(12), Ok(12));
        assert_eq!(from_cqe_result(0), Ok(0));
        assert_eq!(
            from_cqe_result(-(Errno::ECANCELED as i32)),
            Err(Error::Canceled)
        );
    }
}
