use std::io;
use std::net::SocketAddrV4;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

pub type SocketResult<T> = Result<T, SocketError>;

/// The kind of a [SocketError], with stable numeric codes so that results can be logged or
///  handed across an FFI boundary without losing information.
#[repr(i8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ErrorKind {
    SocketCreate = -1,
    SocketOption = -2,
    Bind = -3,
    Listen = -4,
    Accept = -5,
    Connect = -6,
    Reconnect = -7,
    Send = -8,
    Recv = -9,
    /// A bounded wait elapsed. Expected in polling loops, not fatal.
    Timeout = -10,
    InvalidParam = -11,
    NotInitialized = -12,
    /// The peer shut down the connection in an orderly fashion.
    Closed = -13,
    /// A non-blocking operation could not proceed right now.
    WouldBlock = -14,
    AlreadyConnected = -15,
}

impl ErrorKind {
    /// Transient conditions are worth retrying, everything else calls for abandoning or
    ///  re-establishing the connection.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::WouldBlock)
    }
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error("invalid IPv4 address {0:?}")]
    InvalidAddress(String),
    #[error("failed to create socket: {0}")]
    SocketCreate(#[source] io::Error),
    #[error("failed to set socket option {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen: {0}")]
    Listen(#[source] io::Error),
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },
    #[error("failed to reconnect to {addr}: {source}")]
    Reconnect {
        addr: SocketAddrV4,
        #[source]
        source: Box<SocketError>,
    },
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("receive failed: {0}")]
    Recv(#[source] io::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("operation would block")]
    WouldBlock,
    #[error("connection closed by peer")]
    Closed,
    #[error("not initialized: {0}")]
    NotInitialized(&'static str),
    #[error("socket is already connected")]
    AlreadyConnected,
}

impl SocketError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SocketError::InvalidParam(_) | SocketError::InvalidAddress(_) => ErrorKind::InvalidParam,
            SocketError::SocketCreate(_) => ErrorKind::SocketCreate,
            SocketError::SocketOption { .. } => ErrorKind::SocketOption,
            SocketError::Bind { .. } => ErrorKind::Bind,
            SocketError::Listen(_) => ErrorKind::Listen,
            SocketError::Accept(_) => ErrorKind::Accept,
            SocketError::Connect { .. } => ErrorKind::Connect,
            SocketError::Reconnect { .. } => ErrorKind::Reconnect,
            SocketError::Send(_) => ErrorKind::Send,
            SocketError::Recv(_) => ErrorKind::Recv,
            SocketError::Timeout => ErrorKind::Timeout,
            SocketError::WouldBlock => ErrorKind::WouldBlock,
            SocketError::Closed => ErrorKind::Closed,
            SocketError::NotInitialized(_) => ErrorKind::NotInitialized,
            SocketError::AlreadyConnected => ErrorKind::AlreadyConnected,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    pub(crate) fn option(option: &'static str) -> impl FnOnce(io::Error) -> SocketError {
        move |source| SocketError::SocketOption { option, source }
    }
}

impl From<SocketError> for io::Error {
    fn from(e: SocketError) -> Self {
        let kind = match e.kind() {
            ErrorKind::SocketCreate => io::ErrorKind::Other,
            ErrorKind::SocketOption | ErrorKind::InvalidParam => io::ErrorKind::InvalidInput,
            ErrorKind::Bind => io::ErrorKind::AddrInUse,
            ErrorKind::Listen | ErrorKind::Accept | ErrorKind::Connect | ErrorKind::Reconnect => io::ErrorKind::ConnectionRefused,
            ErrorKind::Send => io::ErrorKind::BrokenPipe,
            ErrorKind::Recv => io::ErrorKind::ConnectionReset,
            ErrorKind::Timeout => io::ErrorKind::TimedOut,
            ErrorKind::NotInitialized => io::ErrorKind::NotConnected,
            ErrorKind::Closed => io::ErrorKind::ConnectionAborted,
            ErrorKind::WouldBlock => io::ErrorKind::WouldBlock,
            ErrorKind::AlreadyConnected => io::ErrorKind::AlreadyExists,
        };
        io::Error::new(kind, e)
    }
}

/// Convenience for polling loops: a transient failure (timeout, would-block) becomes `None`,
///  everything else is passed through.
pub trait TransientExt<T> {
    fn transient_as_none(self) -> SocketResult<Option<T>>;
}

impl<T> TransientExt<T> for SocketResult<T> {
    fn transient_as_none(self) -> SocketResult<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_transient() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use rstest::rstest;
    use super::*;

    fn refused() -> io::Error {
        io::Error::from(io::ErrorKind::ConnectionRefused)
    }

    #[rstest]
    #[case::timeout(SocketError::Timeout, ErrorKind::Timeout, true)]
    #[case::would_block(SocketError::WouldBlock, ErrorKind::WouldBlock, true)]
    #[case::closed(SocketError::Closed, ErrorKind::Closed, false)]
    #[case::address(SocketError::InvalidAddress("x".to_string()), ErrorKind::InvalidParam, false)]
    #[case::already_connected(SocketError::AlreadyConnected, ErrorKind::AlreadyConnected, false)]
    #[case::send(SocketError::Send(io::Error::from(io::ErrorKind::BrokenPipe)), ErrorKind::Send, false)]
    fn test_kind(#[case] error: SocketError, #[case] expected: ErrorKind, #[case] transient: bool) {
        assert_eq!(error.kind(), expected);
        assert_eq!(error.is_transient(), transient);
    }

    #[rstest]
    #[case::create(ErrorKind::SocketCreate, -1)]
    #[case::reconnect(ErrorKind::Reconnect, -7)]
    #[case::timeout(ErrorKind::Timeout, -10)]
    #[case::already_connected(ErrorKind::AlreadyConnected, -15)]
    fn test_kind_codes(#[case] kind: ErrorKind, #[case] code: i8) {
        assert_eq!(i8::from(kind), code);
        assert_eq!(ErrorKind::try_from(code).unwrap(), kind);
    }

    #[test]
    fn test_unknown_code() {
        assert!(ErrorKind::try_from(0i8).is_err());
        assert!(ErrorKind::try_from(-16i8).is_err());
    }

    #[test]
    fn test_reconnect_wraps_source() {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
        let e = SocketError::Reconnect {
            addr,
            source: Box::new(SocketError::Connect { addr, source: refused() }),
        };
        assert_eq!(e.kind(), ErrorKind::Reconnect);
        let source = std::error::Error::source(&e).unwrap();
        assert!(source.to_string().contains("failed to connect"));
    }

    #[rstest]
    #[case::timeout(SocketError::Timeout, io::ErrorKind::TimedOut)]
    #[case::would_block(SocketError::WouldBlock, io::ErrorKind::WouldBlock)]
    #[case::not_initialized(SocketError::NotInitialized("x"), io::ErrorKind::NotConnected)]
    #[case::closed(SocketError::Closed, io::ErrorKind::ConnectionAborted)]
    #[case::invalid(SocketError::InvalidParam("x"), io::ErrorKind::InvalidInput)]
    fn test_into_io_error(#[case] error: SocketError, #[case] expected: io::ErrorKind) {
        assert_eq!(io::Error::from(error).kind(), expected);
    }

    #[test]
    fn test_transient_as_none() {
        let timeout: SocketResult<usize> = Err(SocketError::Timeout);
        assert_eq!(timeout.transient_as_none().unwrap(), None);

        let ok: SocketResult<usize> = Ok(5);
        assert_eq!(ok.transient_as_none().unwrap(), Some(5));

        let closed: SocketResult<usize> = Err(SocketError::Closed);
        assert_eq!(closed.transient_as_none().unwrap_err().kind(), ErrorKind::Closed);
    }
}
