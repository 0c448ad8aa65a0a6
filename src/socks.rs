//! SOCKS5 route for [`SystemDialer`](crate::dialer::SystemDialer).
//!
//! The negotiation is delegated to `tokio-socks` on a throwaway
//! current-thread runtime, so the blocking connector can sit on top of it.
//! The target host name is sent to the proxy unresolved.

use std::borrow::Cow;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tokio_socks::tcp::Socks5Stream;
use tokio_socks::TargetAddr;
use tracing::debug;

use crate::config::{ConnectionTarget, Credentials, TargetHost};
use crate::error::{ConnectError, Result};

fn target_addr(target: &ConnectionTarget) -> TargetAddr<'_> {
    match &target.host {
        TargetHost::Addr(ip) => TargetAddr::Ip(SocketAddr::new(*ip, target.port)),
        TargetHost::Name(name) => TargetAddr::Domain(Cow::Borrowed(name.as_str()), target.port),
    }
}

/// Runs the SOCKS5 exchange over a socket already connected to the proxy
/// and returns it in blocking mode.
pub(crate) fn negotiate(
    stream: TcpStream,
    target: &ConnectionTarget,
    credentials: Option<&Credentials>,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ConnectError::Io)?;
    stream.set_nonblocking(true).map_err(ConnectError::Io)?;

    let tunneled = runtime.block_on(async move {
        let socket = tokio::net::TcpStream::from_std(stream).map_err(ConnectError::Io)?;
        let exchange = async {
            let addr = target_addr(target);
            let negotiated = match credentials {
                Some(c) => {
                    let password = c.password.as_deref().unwrap_or("");
                    Socks5Stream::connect_with_password_and_socket(socket, addr, &c.username, password).await
                }
                None => Socks5Stream::connect_with_socket(socket, addr).await,
            };
            negotiated.map(Socks5Stream::into_inner).map_err(ConnectError::Socks)
        };
        match timeout.filter(|t| !t.is_zero()) {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| ConnectError::TimedOut)?,
            None => exchange.await,
        }
    })?;

    let stream = tunneled.into_std().map_err(ConnectError::Io)?;
    stream.set_nonblocking(false).map_err(ConnectError::Io)?;
    debug!(dest = %target, authenticated = credentials.is_some(), "SOCKS5 route established");
    Ok(stream)
}
