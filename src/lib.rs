//! Proxy-aware TCP connector.
//!
//! [`ProxyAwareConnector`] hands out connected `TcpStream`s to a target,
//! either directly or through a SOCKS5 or HTTP CONNECT proxy, ready for a
//! raw-stream protocol such as SSH.

pub mod cancel;
pub mod config;
pub mod connector;
pub mod dialer;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod response;
#[cfg(feature = "socks")]
mod socks;
pub mod ssh_transport;


pub use cancel::CancelToken;
pub use config::{ConnectionTarget, ConnectorConfig, Credentials, ProxyConfig, ProxyKind, ProxySettings, TargetHost};
pub use connector::ProxyAwareConnector;
pub use dialer::{DialOptions, Dialer, Route, SystemDialer};
pub use error::{ConnectError, Result};
