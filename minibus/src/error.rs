use std::io;

use crate::RemoteError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(io::Error),
    #[error("invalid bus address '{0}'")]
    InvalidAddress(String),
    #[error("connecting to '{address}' failed: {source}")]
    ConnectionFailed { address: String, source: io::Error },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("call timed out")]
    Timeout,
    #[error("invalid type signature: {0}")]
    Signature(#[from] minibus_parser::Error),
    #[error("type mismatch: expected '{expected}', got '{found}'")]
    TypeMismatch { expected: String, found: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("malformed message payload: {0}")]
    BadMessage(&'static str),
    #[error("no container is open")]
    NoContainer,
    #[error("a container is still open")]
    UnclosedContainer,
    #[error("container contents are incomplete")]
    IncompleteContainer,
    #[error("container contents are already complete")]
    ContainerFull,
    #[error("container not fully consumed")]
    ContainerNotConsumed,
    #[error("read past the declared fields of a container")]
    ReadPastEnd,
    #[error("{0}")]
    Remote(RemoteError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(e),
        }
    }
}

impl Error {
    /// The numeric code retained by the diagnostics accessors on
    /// [`Connection`](crate::Connection) and [`Message`](crate::Message).
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::InvalidAddress(_) => libc::EINVAL,
            Error::ConnectionFailed { source, .. } => {
                source.raw_os_error().unwrap_or(libc::ECONNREFUSED)
            }
            Error::ConnectionClosed => libc::ECONNRESET,
            Error::Timeout => libc::ETIMEDOUT,
            Error::Signature(_) => libc::EINVAL,
            Error::TypeMismatch { .. } => libc::ENXIO,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::BadMessage(_) => libc::EBADMSG,
            Error::NoContainer
            | Error::UnclosedContainer
            | Error::IncompleteContainer
            | Error::ContainerFull
            | Error::ContainerNotConsumed => libc::EINVAL,
            Error::ReadPastEnd => libc::ENXIO,
            Error::Remote(e) => e.errno(),
        }
    }
}
