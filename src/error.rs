use std::io;

pub type Result<T> = std::result::Result<T, ConnectError>;

/// Failure of a single `connect` call. The socket involved is always closed
/// by the time one of these reaches the caller.
#[derive(Debug)]
pub enum ConnectError {
    InvalidTarget(&'static str),
    InvalidProxy(&'static str),
    ConnectFailed(io::Error),
    UnexpectedEof,
    ProxyRejected { code: u16, reason: String },
    ResponseTooLarge,
    TimedOut,
    Cancelled,
    Io(io::Error),
    #[cfg(feature = "socks")]
    Socks(tokio_socks::Error),
    Unsupported(&'static str),
}

impl ConnectError {
    /// Classifies an I/O error raised after the socket is connected.
    pub(crate) fn from_handshake_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ConnectError::TimedOut,
            io::ErrorKind::UnexpectedEof => ConnectError::UnexpectedEof,
            _ => ConnectError::Io(e),
        }
    }

    /// Classifies an I/O error raised while opening the socket.
    pub(crate) fn from_connect_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ConnectError::TimedOut,
            _ => ConnectError::ConnectFailed(e),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ConnectError::ProxyRejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::InvalidTarget(detail) => write!(f, "invalid target: {detail}"),
            ConnectError::InvalidProxy(detail) => write!(f, "invalid proxy: {detail}"),
            ConnectError::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            ConnectError::UnexpectedEof => write!(f, "unexpected EOF while reading proxy response"),
            ConnectError::ProxyRejected { code, reason } if reason.is_empty() => {
                write!(f, "proxy rejected tunnel with status {code}")
            }
            ConnectError::ProxyRejected { code, reason } => {
                write!(f, "proxy rejected tunnel with status {code} ({reason})")
            }
            ConnectError::ResponseTooLarge => write!(f, "proxy response exceeds header limits"),
            ConnectError::TimedOut => write!(f, "timed out"),
            ConnectError::Cancelled => write!(f, "cancelled"),
            ConnectError::Io(e) => write!(f, "handshake I/O error: {e}"),
            #[cfg(feature = "socks")]
            ConnectError::Socks(e) => write!(f, "SOCKS error: {e}"),
            ConnectError::Unsupported(detail) => write!(f, "unsupported: {detail}"),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::ConnectFailed(e) | ConnectError::Io(e) => Some(e),
            #[cfg(feature = "socks")]
            ConnectError::Socks(e) => Some(e),
            _ => None,
        }
    }
}
