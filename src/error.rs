use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by monitoring commands.
///
/// Every variant maps onto an errno value, so callers speaking the
/// numeric interface get the same codes as the command table reports.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Unimplemented or reserved register, malformed command, oversized argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Caller may not attach to the target task.
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    /// Conflicting session, debug-register claim, or a command issued
    /// from the wrong CPU or against a zombie context.
    #[error("resource busy: {0}")]
    Busy(&'static str),

    /// The target task vanished.
    #[error("no such process: {0}")]
    NoSuchProcess(u32),

    /// Sampling buffer could not be allocated.
    #[error("out of memory: {0} bytes requested")]
    OutOfMemory(usize),

    /// Hardware was found in a state it should never be in.
    #[error("hardware in unexpected state: {0}")]
    Io(&'static str),

    /// Non-blocking read on an empty message queue.
    #[error("no message available")]
    WouldBlock,

    /// A blocked reader was woken by a pending signal.
    #[error("interrupted by signal")]
    Interrupted,
}

impl Error {
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::PermissionDenied(_) => libc::EPERM,
            Error::Busy(_) => libc::EBUSY,
            Error::NoSuchProcess(_) => libc::ESRCH,
            Error::OutOfMemory(_) => libc::ENOMEM,
            Error::Io(_) => libc::EIO,
            Error::WouldBlock => libc::EAGAIN,
            Error::Interrupted => libc::EINTR,
        }
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        io::Error::from_raw_os_error(value.errno())
    }
}
