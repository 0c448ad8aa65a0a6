use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::config::{ConnectionTarget, Credentials, ProxyEndpoint, TargetHost};
use crate::error::{ConnectError, Result};
use crate::handshake;

/// Per-call socket options handed to a [`Dialer`]
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub local_bind: Option<SocketAddr>,
    pub timeout: Option<Duration>,
    pub nodelay: bool,
}

/// Proxy routes whose negotiation belongs to the connection layer rather
/// than to the connector
#[derive(Debug, Clone, Copy)]
pub enum Route<'a> {
    Socks {
        proxy: &'a ProxyEndpoint,
        credentials: Option<&'a Credentials>,
    },
    Http {
        proxy: &'a ProxyEndpoint,
    },
}

impl Route<'_> {
    pub fn proxy(&self) -> &ProxyEndpoint {
        match self {
            Route::Socks { proxy, .. } | Route::Http { proxy } => proxy,
        }
    }
}

/// Connection primitive used by the connector.
pub trait Dialer: Send + Sync {
    /// Plain TCP connection to `endpoint`.
    fn dial(&self, endpoint: &ConnectionTarget, opts: &DialOptions) -> Result<TcpStream>;

    /// Connection to `target` that the route has already carried through the
    /// proxy.
    fn dial_routed(
        &self,
        route: &Route<'_>,
        target: &ConnectionTarget,
        opts: &DialOptions,
    ) -> Result<TcpStream>;
}

impl<D: Dialer + ?Sized> Dialer for Arc<D> {
    fn dial(&self, endpoint: &ConnectionTarget, opts: &DialOptions) -> Result<TcpStream> {
        (**self).dial(endpoint, opts)
    }

    fn dial_routed(
        &self,
        route: &Route<'_>,
        target: &ConnectionTarget,
        opts: &DialOptions,
    ) -> Result<TcpStream> {
        (**self).dial_routed(route, target, opts)
    }
}

/// Dialer backed by the OS socket API
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDialer;

impl SystemDialer {
    fn resolve(endpoint: &ConnectionTarget) -> Result<Vec<SocketAddr>> {
        match &endpoint.host {
            TargetHost::Addr(ip) => Ok(vec![SocketAddr::new(*ip, endpoint.port)]),
            TargetHost::Name(name) => {
                let addrs: Vec<SocketAddr> = (name.as_str(), endpoint.port)
                    .to_socket_addrs()
                    .map_err(ConnectError::ConnectFailed)?
                    .collect();
                if addrs.is_empty() {
                    Err(ConnectError::ConnectFailed(io::Error::new(
                        io::ErrorKind::NotFound,
                        "host resolved to no addresses",
                    )))
                } else {
                    Ok(addrs)
                }
            }
        }
    }

    fn connect_addr(addr: SocketAddr, opts: &DialOptions) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if let Some(local) = opts.local_bind {
            socket.bind(&local.into())?;
        }
        match opts.timeout.filter(|t| !t.is_zero()) {
            Some(timeout) => socket.connect_timeout(&addr.into(), timeout)?,
            None => socket.connect(&addr.into())?,
        }
        socket.set_nodelay(opts.nodelay)?;
        Ok(socket.into())
    }
}

impl Dialer for SystemDialer {
    fn dial(&self, endpoint: &ConnectionTarget, opts: &DialOptions) -> Result<TcpStream> {
        let mut addrs = Self::resolve(endpoint)?;
        if let Some(local) = opts.local_bind {
            addrs.retain(|a| a.is_ipv4() == local.is_ipv4());
        }

        let mut last_error = None;
        for addr in addrs {
            debug!(%addr, "dialing");
            match Self::connect_addr(addr, opts) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, error = %e, "dial attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => ConnectError::from_connect_io(e),
            None => ConnectError::ConnectFailed(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no address matches the local bind family",
            )),
        })
    }

    fn dial_routed(
        &self,
        route: &Route<'_>,
        target: &ConnectionTarget,
        opts: &DialOptions,
    ) -> Result<TcpStream> {
        let stream = self.dial(route.proxy(), opts)?;
        match route {
            Route::Http { proxy } => handshake::open_tunnel(stream, target, proxy, None, opts.timeout),
            #[cfg(feature = "socks")]
            Route::Socks { credentials, .. } => {
                crate::socks::negotiate(stream, target, *credentials, opts.timeout)
            }
            #[cfg(not(feature = "socks"))]
            Route::Socks { .. } => {
                drop(stream);
                Err(ConnectError::Unsupported("built without the `socks` feature"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn dials_named_host() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            s.write_all(b"hi").unwrap();
        });

        let opts = DialOptions { nodelay: true, ..Default::default() };
        // localhost may resolve to ::1 first; the v4 attempt follows.
        let mut stream = SystemDialer
            .dial(&ConnectionTarget::new("localhost", port), &opts)
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        server.join().unwrap();
    }

    #[test]
    fn binds_local_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = ConnectionTarget::from(listener.local_addr().unwrap());
        let opts = DialOptions {
            local_bind: Some("127.0.0.1:0".parse().unwrap()),
            ..Default::default()
        };
        let stream = SystemDialer.dial(&target, &opts).unwrap();
        let (_peer, seen) = listener.accept().unwrap();
        assert_eq!(stream.local_addr().unwrap(), seen);
    }

    #[test]
    fn refused_connection_is_connect_failed() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = SystemDialer
            .dial(&ConnectionTarget::new("127.0.0.1", port), &DialOptions::default())
            .unwrap_err();
        assert!(matches!(err, ConnectError::ConnectFailed(_)));
    }

    #[test]
    fn bind_family_mismatch_is_connect_failed() {
        let opts = DialOptions {
            local_bind: Some("[::1]:0".parse().unwrap()),
            ..Default::default()
        };
        let err = SystemDialer
            .dial(&ConnectionTarget::new("127.0.0.1", 9), &opts)
            .unwrap_err();
        assert!(matches!(err, ConnectError::ConnectFailed(_)));
    }

    #[test]
    fn http_route_sends_unauthenticated_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let proxy = ConnectionTarget::from(listener.local_addr().unwrap());
        let server = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                s.read_exact(&mut byte).unwrap();
                request.push(byte[0]);
            }
            s.write_all(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
            String::from_utf8(request).unwrap()
        });

        let target = ConnectionTarget::new("example.com", 22);
        let route = Route::Http { proxy: &proxy };
        SystemDialer.dial_routed(&route, &target, &DialOptions::default()).unwrap();
        let request = server.join().unwrap();
        assert!(request.starts_with("CONNECT example.com:22 HTTP/1.1\r\n"));
        assert!(request.contains(&format!("\r\nHost: {proxy}\r\n")));
        assert!(!request.contains("Proxy-Authorization"));
    }
}
